//! Embedding-side failures.
//!
//! `EmbedError` is `Clone` so a single terminal failure can fan out to every
//! request in a rejected batch.

#[derive(thiserror::Error, Debug, Clone)]
pub enum EmbedError {
    /// Likely to succeed on retry (timeouts, rate limits, transport).
    #[error("Transient embedding failure: {0}")]
    Transient(String),

    /// Retrying will not help (bad request, auth, unsupported input).
    #[error("Permanent embedding failure: {0}")]
    Permanent(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The request was dropped before execution (queue cleared or shutdown).
    #[error("Embedding request cancelled")]
    Cancelled,

    /// Retries were exhausted; `last` is the terminal failure message.
    #[error("Embedding batch gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
}

impl From<sift_error::Error> for EmbedError {
    fn from(e: sift_error::Error) -> Self {
        match e {
            sift_error::Error::Cancelled(_) => EmbedError::Cancelled,
            other => EmbedError::Transient(other.to_string()),
        }
    }
}

impl From<EmbedError> for sift_error::Error {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Cancelled => sift_error::Error::Cancelled("embedding request".to_string()),
            other => sift_error::Error::Embed(other.to_string()),
        }
    }
}
