use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// Memcap reached and the spare pool is empty. Expected under load; the
    /// packet should be handled as untracked.
    #[error("Flow memcap reached and no spare flow available")]
    ResourceExhausted,

    #[error("Invalid flow configuration: {0}")]
    ConfigInvalid(String),

    #[error("Flow invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Flow engine is shut down")]
    ShutDown,
}
