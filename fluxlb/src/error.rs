use thiserror::Error;

/// Top-level error union for the CLI binary (§4.1): wraps the per-crate
/// boundaries the orchestrator and its config loader can raise.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Control(#[from] fluxlb_control::ControlError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
