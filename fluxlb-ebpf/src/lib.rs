// eBPF/XDP is Linux-only. This crate does not compile for other targets.
#![cfg(target_os = "linux")]

pub mod error;
pub mod loader;
pub mod maps;
pub mod reaper;
pub mod stats;

pub use error::{EbpfError, Result};
pub use loader::Loader;
pub use maps::FluxMaps;
pub use reaper::{reap_idle, monotonic_now_ns, unix_now_ns, ExpiredConnection};
pub use stats::StatsRingConsumer;
