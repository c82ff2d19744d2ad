use thiserror::Error;

/// Errors raised by the pure-logic layer: malformed packets reaching the
/// software-reference pipeline, and invalid weight/CIDR configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("packet too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),

    #[error("unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("fragmented packet")]
    Fragmented,

    #[error("target group is empty")]
    EmptyTargetGroup,

    #[error("weights {0:?} do not sum to 100")]
    WeightsDoNotSumTo100(Vec<u8>),

    #[error("mixed address families cannot be compared for CIDR containment")]
    MixedAddressFamily,
}

pub type Result<T> = std::result::Result<T, CoreError>;
