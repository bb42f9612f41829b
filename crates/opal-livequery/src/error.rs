//! Error types for the live-query core.
//!
//! Recoverable failures (batch execution errors, subscriber delivery
//! errors) are recovered locally inside the poll tick and never cross the
//! poller boundary. The crate-level [`Error`] covers the remaining
//! programmer-error conditions.

/// Result type for live-query operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from live-query registry operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A poller's worker state was published more than once. The io cell
    /// is write-once; only the task that won the creation race may fill it.
    #[error("poller worker state already initialized")]
    WorkerAlreadyInitialized,
}

/// A failed multiplexed query execution.
///
/// Cloneable: a single batch failure fans out to every cohort of the
/// batch, and from there to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("source execution failed: {message}")]
pub struct SourceError {
    message: String,
}

impl SourceError {
    /// Creates a source error from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message, as delivered to subscribers.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A failed delivery to a single subscriber.
///
/// Produced by [`OnChange`](crate::subscriber::OnChange) implementations;
/// isolated from sibling subscribers and logged by the push phase.
#[derive(Debug, thiserror::Error)]
#[error("subscriber delivery failed: {message}")]
pub struct DeliveryError {
    message: String,
}

impl DeliveryError {
    /// Creates a delivery error from any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
