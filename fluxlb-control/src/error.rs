use thiserror::Error;

/// Control-plane errors (§7): config validation, DNS resolution, circuit
/// misuse. Drain timeout is deliberately not a variant here — per §7 it is
/// non-fatal and carried through the drain callback, not this enum.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("DNS resolution failed for '{hostname}': {source}")]
    DnsResolution { hostname: String, #[source] source: std::io::Error },

    #[error("no addresses returned for hostname '{0}'")]
    DnsEmptyResult(String),

    #[error("unknown proxy '{0}'")]
    UnknownProxy(String),

    #[error("unknown target '{0}' in proxy '{1}'")]
    UnknownTarget(String, String),

    #[error("circuit breaker for '{0}' is not in a state that allows this operation")]
    CircuitMisuse(String),

    #[error("interface '{0}' not found or has no kernel index")]
    InterfaceNotFound(String),

    #[error("proxy '{0}' is already attached")]
    DuplicateProxy(String),

    #[error("drain handle for '{0}' was dropped before completing")]
    DrainChannelClosed(String),

    #[error("kernel map operation failed: {0}")]
    Ebpf(#[from] fluxlb_ebpf::EbpfError),

    #[error("software-reference pipeline error: {0}")]
    Core(#[from] fluxlb_core::CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControlError>;
