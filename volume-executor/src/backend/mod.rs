//! Storage backend seam.
//!
//! The executor talks to the storage system only through [`StorageBackend`]:
//! an asynchronous submission that returns a task reference, and a batched
//! status query over many references at once.

mod memory;

pub use memory::{InMemoryBackend, InMemoryBackendOptions};

use thiserror::Error;

use crate::types::{TaskReference, TaskStatus, VolumeOperation};

/// Errors returned synchronously by a backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rejected request: {0}")]
    Rejected(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("task status query failed: {0}")]
    QueryFailed(String),
}

impl BackendError {
    /// Whether the same call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::QueryFailed(_)
        )
    }
}

/// Asynchronous storage operations.
#[tonic::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Identifies the backend instance in attempt records.
    fn endpoint(&self) -> String;

    /// Start `operation` and return the reference of the backend task running it.
    async fn submit(&self, operation: &VolumeOperation) -> Result<TaskReference, BackendError>;

    /// Report the status of every reference the backend knows about.
    ///
    /// References the backend does not recognize are omitted from the result.
    async fn query_tasks(
        &self,
        references: &[TaskReference],
    ) -> Result<Vec<TaskStatus>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(BackendError::Unavailable("connection reset".to_string()).is_retryable());
        assert!(BackendError::QueryFailed("timeout".to_string()).is_retryable());
        assert!(!BackendError::Rejected("quota".to_string()).is_retryable());
        assert!(!BackendError::InvalidRequest("size".to_string()).is_retryable());
    }
}
