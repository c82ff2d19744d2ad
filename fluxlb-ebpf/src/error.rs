#[derive(Debug, thiserror::Error)]
pub enum EbpfError {
    #[error("failed to load BPF object: {0}")]
    Load(#[from] aya::EbpfError),

    #[error("program '{0}' not found in BPF object")]
    ProgramNotFound(&'static str),

    #[error("BPF program is not the expected program type: {0}")]
    ProgramType(#[source] aya::programs::ProgramError),

    #[error("failed to load '{name}' into the kernel: {source}")]
    ProgramLoad { name: &'static str, #[source] source: aya::programs::ProgramError },

    #[error("failed to attach '{name}' to interface '{interface}': {source}")]
    Attach { name: &'static str, interface: String, #[source] source: aya::programs::ProgramError },

    #[error("map '{0}' not found in loaded BPF object")]
    MapNotFound(&'static str),

    #[error("map '{name}' has an unexpected type: {source}")]
    MapType { name: &'static str, #[source] source: aya::maps::MapError },

    #[error("map operation failed: {0}")]
    MapOperation(#[from] aya::maps::MapError),

    #[error("failed to create clsact qdisc on '{0}': {1}")]
    QdiscCreate(String, #[source] std::io::Error),

    #[error("failed to register stats ring buffer with the async reactor: {0}")]
    RingBufPoll(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EbpfError>;
