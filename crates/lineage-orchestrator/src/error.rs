//! Orchestrator error types.

use std::path::PathBuf;
use std::time::Duration;

use lineage_client::ClientError;
use uuid::Uuid;

/// Result type alias using [`OrchestratorError`].
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by the orchestrator. One per top-level operation.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Malformed or missing configuration. Never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("File or directory not found: {}", path.display())]
    PayloadNotFound { path: PathBuf },

    #[error("Failed to package payload {}: {reason}", path.display())]
    Payload { path: PathBuf, reason: String },

    /// Transport or protocol failure, after any retry budget was spent.
    #[error("Remote call '{operation}' failed: {source}")]
    RemoteCallFailed {
        operation: &'static str,
        #[source]
        source: ClientError,
    },

    /// Local deadline exceeded while polling. Not a remote process failure.
    #[error("Timeout waiting for {id}: {}ms", elapsed.as_millis())]
    WaitTimeout { id: Uuid, elapsed: Duration },

    /// One or more children reached a failure terminal.
    #[error("{message}")]
    AggregateFailure { message: String, failed: Vec<Uuid> },
}

impl OrchestratorError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub(crate) const fn remote(operation: &'static str, source: ClientError) -> Self {
        Self::RemoteCallFailed { operation, source }
    }
}
