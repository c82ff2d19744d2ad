//! Lifecycle glue: load the XDP and TC kernel objects, wire their shared
//! conntrack map together via pinning, attach them to an interface, and tear
//! them down in reverse order.

use std::path::PathBuf;

use aya::programs::tc::TcAttachType;
use aya::programs::{SchedClassifier, Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader};
use tracing::{info, warn};

use crate::error::{EbpfError, Result};
use crate::maps::FluxMaps;

static XDP_BPF_BYTES: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/xdp.bpf.o"));
static TC_BPF_BYTES: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/tc.bpf.o"));

/// Directory both kernel objects pin their shared maps under. Loading the
/// XDP object first creates and pins `conntrack_map`; loading the TC object
/// against the same directory resolves its `conntrack_map` declaration to
/// that already-pinned map instead of creating a second, disconnected one.
const PIN_PATH: &str = "/sys/fs/bpf/fluxlb";

/// Owns the loaded BPF objects and their attachments for one interface.
/// Dropping it detaches both TC filters and the XDP program (reverse order
/// of attachment).
pub struct Loader {
    interface: String,
    xdp_ebpf: Ebpf,
    _tc_ebpf: Ebpf,
}

impl Loader {
    /// Loads both kernel objects, attaches the XDP program and the two TC
    /// classifiers to `interface`, and returns a handle whose `maps()`
    /// method is the control plane's only way to touch kernel state.
    pub fn attach(interface: &str) -> Result<Self> {
        remove_memlock_limit();
        std::fs::create_dir_all(PIN_PATH).ok();

        let mut xdp_ebpf = EbpfLoader::new()
            .map_pin_path(PIN_PATH)
            .load(XDP_BPF_BYTES)?;

        let xdp_prog: &mut Xdp = xdp_ebpf
            .program_mut("fluxlb_xdp_ingress")
            .ok_or(EbpfError::ProgramNotFound("fluxlb_xdp_ingress"))?
            .try_into()
            .map_err(EbpfError::ProgramType)?;
        xdp_prog
            .load()
            .map_err(|source| EbpfError::ProgramLoad { name: "fluxlb_xdp_ingress", source })?;
        xdp_prog
            .attach(interface, XdpFlags::default())
            .map_err(|source| EbpfError::Attach {
                name: "fluxlb_xdp_ingress",
                interface: interface.to_string(),
                source,
            })?;

        let mut tc_ebpf = EbpfLoader::new().map_pin_path(PIN_PATH).load(TC_BPF_BYTES)?;

        // clsact is idempotent to create; a second attach on an interface
        // that already has one from a prior run is not an error.
        if let Err(e) = aya::programs::tc::qdisc_add_clsact(interface) {
            warn!(interface, error = %e, "clsact qdisc already present or could not be created; continuing");
        }

        let egress_prog: &mut SchedClassifier = tc_ebpf
            .program_mut("fluxlb_tc_egress")
            .ok_or(EbpfError::ProgramNotFound("fluxlb_tc_egress"))?
            .try_into()
            .map_err(EbpfError::ProgramType)?;
        egress_prog
            .load()
            .map_err(|source| EbpfError::ProgramLoad { name: "fluxlb_tc_egress", source })?;
        egress_prog.attach(interface, TcAttachType::Egress).map_err(|source| EbpfError::Attach {
            name: "fluxlb_tc_egress",
            interface: interface.to_string(),
            source,
        })?;

        let ingress_prog: &mut SchedClassifier = tc_ebpf
            .program_mut("fluxlb_tc_ingress_proxy")
            .ok_or(EbpfError::ProgramNotFound("fluxlb_tc_ingress_proxy"))?
            .try_into()
            .map_err(EbpfError::ProgramType)?;
        ingress_prog
            .load()
            .map_err(|source| EbpfError::ProgramLoad { name: "fluxlb_tc_ingress_proxy", source })?;
        ingress_prog.attach(interface, TcAttachType::Ingress).map_err(|source| EbpfError::Attach {
            name: "fluxlb_tc_ingress_proxy",
            interface: interface.to_string(),
            source,
        })?;

        info!(interface, "XDP ingress and TC egress/ingress-proxy programs attached");

        Ok(Self { interface: interface.to_string(), xdp_ebpf, _tc_ebpf: tc_ebpf })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Every map the control plane needs, resolved from the XDP object
    /// (which declares all of them; `conntrack_map` is additionally shared
    /// with the TC object via pinning).
    pub fn maps(&mut self) -> Result<FluxMaps> {
        FluxMaps::from_ebpf(&mut self.xdp_ebpf)
    }

    /// Takes ownership of the `stats_ringbuf` map and wraps it for async
    /// consumption. Can only be called once per `Loader` — the underlying
    /// `aya::Ebpf::take_map` call removes the map from the object.
    pub fn take_stats_ring(&mut self) -> Result<crate::stats::StatsRingConsumer> {
        let map = self
            .xdp_ebpf
            .take_map("stats_ringbuf")
            .ok_or(EbpfError::MapNotFound("stats_ringbuf"))?;
        let ring_buf = aya::maps::RingBuf::try_from(map)
            .map_err(|source| EbpfError::MapType { name: "stats_ringbuf", source })?;
        crate::stats::StatsRingConsumer::new(ring_buf)
    }

    pub fn pin_path() -> PathBuf {
        PathBuf::from(PIN_PATH)
    }
}

fn remove_memlock_limit() {
    #[cfg(target_os = "linux")]
    unsafe {
        let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
        let _ = libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim);
    }
}
