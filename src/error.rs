use thiserror::Error;

/// Errors reported by the sampler, the query layer and the stack printer.
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("cannot render an empty call stack")]
    EmptyStack,

    #[error("sampler is not enabled")]
    NotEnabled,

    #[error("allocation hook is already observing another sampler")]
    AlreadyObserving,

    /// A recorder panicked while holding the store; the cycle is invalid.
    #[error("aggregation store was poisoned during recording")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SamplerError>;
