use std::path::PathBuf;
use std::process::Command;

/// Cross-compiles `fluxlb-ebpf-xdp` and `fluxlb-ebpf-tc` for
/// `bpfel-unknown-none` via `cargo +nightly build` and embeds the resulting
/// ELF objects into this crate via `aya::include_bytes_aligned!` (see
/// `src/loader.rs`).
///
/// Requires a nightly toolchain with the `rust-src` component; each kernel
/// crate pins its channel via its own `rust-toolchain.toml`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR")?);
    let workspace_root = manifest_dir.parent().ok_or("could not find workspace root")?;
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    build_kernel_crate(workspace_root, &out_dir, "fluxlb-ebpf-xdp", "xdp.bpf.o")?;
    build_kernel_crate(workspace_root, &out_dir, "fluxlb-ebpf-tc", "tc.bpf.o")?;

    Ok(())
}

fn build_kernel_crate(
    workspace_root: &std::path::Path,
    out_dir: &std::path::Path,
    crate_name: &str,
    out_name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let crate_dir = workspace_root.join(crate_name);

    println!("cargo:rerun-if-changed={}", crate_dir.join("src/main.rs").display());
    println!("cargo:rerun-if-changed={}", crate_dir.join("Cargo.toml").display());

    let bpf_target_dir = out_dir.join(format!("{crate_name}-target"));

    // A build script runs under the *host* toolchain, which would otherwise
    // leak RUSTC/RUSTUP_TOOLCHAIN into the child cargo invocation and
    // override the nightly selection the kernel crate's rust-toolchain.toml
    // asks for.
    let status = Command::new("cargo")
        .args(["build", "--release", "--target", "bpfel-unknown-none", "-Z", "build-std=core"])
        .env("CARGO_TARGET_DIR", &bpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTDOC")
        .env_remove("RUSTUP_TOOLCHAIN")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .env_remove("RUSTC_WRAPPER")
        .current_dir(&crate_dir)
        .status();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => {
            return Err(format!(
                "cargo build of {crate_name} failed (exit {:?}).\n\
                Ensure nightly toolchain and rust-src are installed:\n\
                  rustup toolchain install nightly\n\
                  rustup component add rust-src --toolchain nightly",
                s.code()
            )
            .into());
        }
        Err(e) => return Err(format!("failed to run cargo for {crate_name}: {e}").into()),
    }

    let bpf_bin = bpf_target_dir.join(format!("bpfel-unknown-none/release/{crate_name}"));
    if !bpf_bin.exists() {
        return Err(format!("BPF binary not found at {}", bpf_bin.display()).into());
    }

    let out_file = out_dir.join(out_name);
    std::fs::copy(&bpf_bin, &out_file)?;
    Ok(())
}
