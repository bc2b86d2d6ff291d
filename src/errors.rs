use crate::schema::Phase;
use thiserror::Error;

/// Error type for job enqueueing operations.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The payload could not be serialized to JSON.
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying store rejected the write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error type shared by all store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database-level failure.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A stored value could not be decoded at the storage boundary.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// The requested row does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
}

/// Classified outcome of a job handler, see the error taxonomy in the worker.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not match the handler's expected shape. Non-retriable:
    /// re-running the handler can never succeed.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    /// The handler's effect failed; eligible for re-pick on a future tick.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Whether a future attempt could succeed.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, HandlerError::MalformedPayload(_))
    }
}

/// Terminal errors of the evaluation protocol.
///
/// A model rate limit is deliberately NOT an error here; it is reported
/// through the protocol's `Outcome` signal type so the owning job completes
/// while the checkpoint owns the retry.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The protocol-level rate-limit retry ceiling was exhausted.
    #[error("evaluation exhausted {0} rate-limit retries")]
    TooManyRetries(u32),

    /// A model call failed with a non-rate-limit error.
    #[error("model call failed during phase {phase}: {source}")]
    Model {
        /// Phase that was executing.
        phase: Phase,
        /// The underlying model error.
        source: crate::model::ModelError,
    },

    /// A checkpoint or evaluation write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
