//! Error types for dispatch operations.
//!
//! Delivery outcomes are never errors: a failed HTTP attempt is a state
//! transition (retry or dead-letter), not a propagated failure. Errors here
//! represent storage faults, misconfiguration, and lifecycle problems.

use std::time::Duration;

use courier_core::{CoreError, QueueId, WorkerId};
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error type for the dispatch engine.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Storage operation failed.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// A tick was requested for a queue that no longer exists.
    #[error("queue {0} not found")]
    QueueNotFound(QueueId),

    /// A queue references a worker that no longer exists.
    #[error("worker {worker_id} referenced by queue {queue_id} not found")]
    WorkerNotFound {
        /// The missing worker.
        worker_id: WorkerId,
        /// The queue holding the dangling reference.
        queue_id: QueueId,
    },

    /// Invalid engine or HTTP client configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Graceful shutdown did not finish within the timeout.
    #[error("shutdown timed out after {timeout:?}, some tickers may still be running")]
    ShutdownTimeout {
        /// The timeout that was exceeded.
        timeout: Duration,
    },
}

impl DispatchError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_not_found_names_the_queue() {
        let id = QueueId::new();
        let err = DispatchError::QueueNotFound(id);
        assert_eq!(err.to_string(), format!("queue {id} not found"));
    }

    #[test]
    fn storage_errors_pass_through_transparently() {
        let err = DispatchError::from(CoreError::NotFound("queue".to_string()));
        assert_eq!(err.to_string(), "not found: queue");
    }
}
