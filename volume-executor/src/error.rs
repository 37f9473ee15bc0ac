use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::fault::{Fault, FaultKind};
use crate::idempotency::StoreError;
use crate::types::{OperationKind, TaskReference};

#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("An operation with the given Volume ID {0} already exists")]
    LockConflict(String),

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("backend rejected {operation} request: {source}")]
    Submission {
        operation: OperationKind,
        #[source]
        source: BackendError,
    },

    #[error("failed to check status of task {reference}: {source}")]
    StatusCheck {
        reference: TaskReference,
        #[source]
        source: BackendError,
    },

    #[error("task {reference} failed: {fault}")]
    TaskFault {
        reference: TaskReference,
        fault: Fault,
    },

    #[error("idempotency record error: {0}")]
    Persistence(#[from] StoreError),

    #[error("wait for task {0} was cancelled")]
    Cancelled(TaskReference),

    #[error("timed out after {timeout:?} waiting for task {reference}")]
    Timeout {
        reference: TaskReference,
        timeout: Duration,
    },

    #[error("result conduit for task {0} closed before delivery")]
    ConduitClosed(TaskReference),
}

impl ExecuteError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecuteError::LockConflict(_)
            | ExecuteError::Timeout { .. }
            | ExecuteError::StatusCheck { .. }
            | ExecuteError::ConduitClosed(_) => true,
            ExecuteError::Submission { source, .. } => source.is_retryable(),
            ExecuteError::TaskFault { fault, .. } => fault.kind().is_retryable(),
            ExecuteError::Persistence(e) => e.is_retryable(),
            ExecuteError::InvalidArgument(_) | ExecuteError::Cancelled(_) => false,
        }
    }

    /// Short label used for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            ExecuteError::LockConflict(_) => "lock_conflict",
            ExecuteError::InvalidArgument(_) => "invalid_argument",
            ExecuteError::Submission { .. } => "submission_error",
            ExecuteError::StatusCheck { .. } => "status_check_error",
            ExecuteError::TaskFault { .. } => "task_fault",
            ExecuteError::Persistence(_) => "persistence_error",
            ExecuteError::Cancelled(_) => "cancelled",
            ExecuteError::Timeout { .. } => "timeout",
            ExecuteError::ConduitClosed(_) => "conduit_closed",
        }
    }
}

impl From<ExecuteError> for tonic::Status {
    fn from(err: ExecuteError) -> Self {
        let message = err.to_string();
        match &err {
            // The CSI sidecars retry ABORTED with backoff, which is what a busy volume needs.
            ExecuteError::LockConflict(_) => tonic::Status::aborted(message),
            ExecuteError::InvalidArgument(_) => tonic::Status::invalid_argument(message),
            ExecuteError::Submission { source, .. } if source.is_retryable() => {
                tonic::Status::unavailable(message)
            }
            ExecuteError::Submission { .. } => tonic::Status::invalid_argument(message),
            ExecuteError::StatusCheck { .. } => tonic::Status::unavailable(message),
            ExecuteError::TaskFault { fault, .. } => match fault.kind() {
                FaultKind::NotFound => tonic::Status::not_found(message),
                FaultKind::AlreadyExists => tonic::Status::already_exists(message),
                FaultKind::InvalidState => tonic::Status::failed_precondition(message),
                FaultKind::NotSupported => tonic::Status::unimplemented(message),
                FaultKind::NonStorage => tonic::Status::unavailable(message),
                FaultKind::Internal => tonic::Status::internal(message),
            },
            ExecuteError::Persistence(e) if e.is_retryable() => tonic::Status::aborted(message),
            ExecuteError::Persistence(_) => tonic::Status::internal(message),
            ExecuteError::Cancelled(_) => tonic::Status::cancelled(message),
            ExecuteError::Timeout { .. } => tonic::Status::deadline_exceeded(message),
            ExecuteError::ConduitClosed(_) => tonic::Status::internal(message),
        }
    }
}

/// Errors that prevent the executor services from starting.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("record store not ready: {0}")]
    Bootstrap(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ExecuteError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FAULT_INVALID_STATE, FAULT_NOT_FOUND};

    #[test]
    fn test_lock_conflict_message_and_code() {
        let err = ExecuteError::LockConflict("vol-123".to_string());
        assert_eq!(
            err.to_string(),
            "An operation with the given Volume ID vol-123 already exists"
        );
        assert!(err.is_retryable());

        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::Aborted);
    }

    #[test]
    fn test_task_fault_status_codes() {
        let not_found = ExecuteError::TaskFault {
            reference: "task-1".into(),
            fault: Fault::new(FAULT_NOT_FOUND, "gone"),
        };
        assert!(!not_found.is_retryable());
        assert_eq!(tonic::Status::from(not_found).code(), tonic::Code::NotFound);

        let invalid_state = ExecuteError::TaskFault {
            reference: "task-2".into(),
            fault: Fault::new(FAULT_INVALID_STATE, "busy"),
        };
        assert!(invalid_state.is_retryable());
        assert_eq!(
            tonic::Status::from(invalid_state).code(),
            tonic::Code::FailedPrecondition
        );
    }

    #[test]
    fn test_submission_status_codes() {
        let transient = ExecuteError::Submission {
            operation: OperationKind::CreateVolume,
            source: BackendError::Unavailable("connection refused".to_string()),
        };
        assert!(transient.is_retryable());
        assert_eq!(tonic::Status::from(transient).code(), tonic::Code::Unavailable);

        let rejected = ExecuteError::Submission {
            operation: OperationKind::CreateVolume,
            source: BackendError::InvalidRequest("bad size".to_string()),
        };
        assert!(!rejected.is_retryable());
        assert_eq!(
            tonic::Status::from(rejected).code(),
            tonic::Code::InvalidArgument
        );
    }

    #[test]
    fn test_wait_errors() {
        let timeout = ExecuteError::Timeout {
            reference: "task-9".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.code(), "timeout");
        assert_eq!(
            tonic::Status::from(timeout).code(),
            tonic::Code::DeadlineExceeded
        );

        let cancelled = ExecuteError::Cancelled("task-9".into());
        assert!(!cancelled.is_retryable());
        assert_eq!(tonic::Status::from(cancelled).code(), tonic::Code::Cancelled);
    }
}
