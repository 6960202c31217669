//! sift-error — workspace-wide error type shared across the sift crates.
//!
//! Each crate defines its own `thiserror` enum for local failures and provides
//! an `impl From<LocalError> for sift_error::Error` so higher layers can handle
//! failures uniformly. Library code returns [`Result`] and propagates with `?`;
//! the retrieval surface itself never surfaces these to callers (degraded
//! results are reported in-band).

/// Workspace-wide result alias used by all crates in the project.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse severity classification for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recoverable; the operation degraded but produced a usable result.
    Warning,
    /// The operation failed; the pipeline as a whole remains usable.
    Error,
    /// Unrecoverable; shared state may be inconsistent.
    Fatal,
}

/// Top-level error type used across the sift workspace.
///
/// Variants group failures into coarse classes. External-collaborator failures
/// (embedding, vector store, persistence) are recoverable: callers degrade to
/// local state where the pipeline specifies a fallback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An embedding backend call failed.
    #[error("Embedding error: {0}")]
    Embed(String),

    /// The vector backend rejected or failed an operation.
    #[error("Vector store error: {0}")]
    Store(String),

    /// The durable mirror failed; in-memory state remains authoritative.
    #[error("Persistence error: {0}")]
    Persist(String),

    /// An mpsc/oneshot endpoint closed or timed out.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Work was cancelled before completion.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Caller-supplied input failed validation.
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// A precondition violation or bug inside the pipeline itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for failures the pipeline recovers from locally.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Internal(_))
    }

    pub fn severity(&self) -> Severity {
        match self {
            Error::Persist(_) => Severity::Warning,
            Error::Internal(_) => Severity::Fatal,
            Error::Embed(_)
            | Error::Store(_)
            | Error::Channel(_)
            | Error::Cancelled(_)
            | Error::Invalid(_) => Severity::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_classification() {
        assert_eq!(Error::Persist("x".into()).severity(), Severity::Warning);
        assert_eq!(Error::Internal("x".into()).severity(), Severity::Fatal);
        assert_eq!(Error::Embed("x".into()).severity(), Severity::Error);
        assert!(Error::Persist("x".into()).is_recoverable());
        assert!(!Error::Internal("x".into()).is_recoverable());
    }
}
