//! Backend fault vocabulary and classification.
//!
//! The backend reports task failures as a fault type string plus a message.
//! Fault types are classified into a small set of kinds that drive whether
//! the executor surfaces the error, treats it as idempotent success, or lets
//! the caller retry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OperationKind, TaskInfo, VolumeOperation};

/// Optional namespace prefix the backend may put in front of fault types.
pub const FAULT_PREFIX: &str = "fault.";
/// Prefix applied to faults that originate outside the storage layer.
pub const NON_STORAGE_FAULT_PREFIX: &str = "fault.nonstorage.";

pub const FAULT_NOT_FOUND: &str = "NotFound";
pub const FAULT_INVALID_STATE: &str = "InvalidState";
pub const FAULT_ALREADY_EXISTS: &str = "AlreadyExists";
pub const FAULT_NOT_SUPPORTED: &str = "NotSupported";
pub const FAULT_INTERNAL: &str = "Internal";
pub const FAULT_INVALID_HOST_STATE: &str = "InvalidHostState";
pub const FAULT_HOST_NOT_CONNECTED: &str = "HostNotConnected";

/// Reported when the backend claims success but returns no result payload.
pub const TASK_INFO_EMPTY_FAULT: &str = "fault.TaskInfoEmpty";

/// Faults caused by host/compute state rather than storage.
pub const NON_STORAGE_FAULTS: &[&str] = &[FAULT_INVALID_HOST_STATE, FAULT_HOST_NOT_CONNECTED];

/// Classification of a backend fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    NotFound,
    InvalidState,
    AlreadyExists,
    NotSupported,
    NonStorage,
    Internal,
}

impl FaultKind {
    /// Whether a later retry of the same request may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FaultKind::InvalidState | FaultKind::NonStorage | FaultKind::Internal
        )
    }
}

/// A fault reported by the backend for an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{fault_type}: {message}")]
pub struct Fault {
    pub fault_type: String,
    pub message: String,
    /// Set on `AlreadyExists` faults when the backend names the existing volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_volume_id: Option<String>,
}

impl Fault {
    pub fn new(fault_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fault_type: fault_type.into(),
            message: message.into(),
            existing_volume_id: None,
        }
    }

    pub fn already_exists(volume_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fault_type: FAULT_ALREADY_EXISTS.to_string(),
            message: message.into(),
            existing_volume_id: Some(volume_id.into()),
        }
    }

    pub fn task_info_empty() -> Self {
        Self::new(
            TASK_INFO_EMPTY_FAULT,
            "backend reported success without a task result",
        )
    }

    pub fn kind(&self) -> FaultKind {
        classify(&self.fault_type)
    }

    /// Fault type as it should appear in logs and metrics labels.
    pub fn reported_type(&self) -> String {
        if is_non_storage_fault(&self.fault_type) {
            add_non_storage_prefix(&self.fault_type)
        } else {
            self.fault_type.clone()
        }
    }
}

fn strip_prefix(fault_type: &str) -> &str {
    fault_type
        .strip_prefix(NON_STORAGE_FAULT_PREFIX)
        .or_else(|| fault_type.strip_prefix(FAULT_PREFIX))
        .unwrap_or(fault_type)
}

/// Classify a fault type string. Unknown types are `Internal`.
pub fn classify(fault_type: &str) -> FaultKind {
    if fault_type.starts_with(NON_STORAGE_FAULT_PREFIX) {
        return FaultKind::NonStorage;
    }
    match strip_prefix(fault_type) {
        FAULT_NOT_FOUND => FaultKind::NotFound,
        FAULT_INVALID_STATE => FaultKind::InvalidState,
        FAULT_ALREADY_EXISTS => FaultKind::AlreadyExists,
        FAULT_NOT_SUPPORTED => FaultKind::NotSupported,
        name if NON_STORAGE_FAULTS.contains(&name) => FaultKind::NonStorage,
        _ => FaultKind::Internal,
    }
}

pub fn is_non_storage_fault(fault_type: &str) -> bool {
    classify(fault_type) == FaultKind::NonStorage
}

/// Prefix a fault type as non-storage. Empty input stays empty.
pub fn add_non_storage_prefix(fault_type: &str) -> String {
    if fault_type.is_empty() || fault_type.starts_with(NON_STORAGE_FAULT_PREFIX) {
        return fault_type.to_string();
    }
    format!("{}{}", NON_STORAGE_FAULT_PREFIX, fault_type)
}

/// Faults that mean the requested end state already holds.
///
/// Returns the result to report instead of the fault:
/// - `AlreadyExists` on a create that names the existing volume
/// - `NotFound` on a delete or detach
pub fn idempotent_success(operation: &VolumeOperation, fault: &Fault) -> Option<TaskInfo> {
    match (operation.kind(), fault.kind()) {
        (OperationKind::CreateVolume, FaultKind::AlreadyExists) => {
            let volume_id = fault.existing_volume_id.clone()?;
            let capacity_bytes = match operation {
                VolumeOperation::CreateVolume { capacity_bytes, .. } => *capacity_bytes,
                _ => 0,
            };
            Some(TaskInfo {
                volume_id: Some(volume_id),
                snapshot_id: None,
                capacity_bytes,
            })
        }
        (OperationKind::DeleteVolume | OperationKind::DetachVolume, FaultKind::NotFound) => {
            Some(TaskInfo {
                volume_id: operation.volume_id().map(str::to_string),
                snapshot_id: None,
                capacity_bytes: 0,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_classify() {
        let cases = [
            (FAULT_NOT_FOUND, FaultKind::NotFound),
            ("fault.NotFound", FaultKind::NotFound),
            (FAULT_INVALID_STATE, FaultKind::InvalidState),
            (FAULT_ALREADY_EXISTS, FaultKind::AlreadyExists),
            (FAULT_NOT_SUPPORTED, FaultKind::NotSupported),
            (FAULT_INVALID_HOST_STATE, FaultKind::NonStorage),
            (FAULT_HOST_NOT_CONNECTED, FaultKind::NonStorage),
            ("fault.nonstorage.VmNotFound", FaultKind::NonStorage),
            (FAULT_INTERNAL, FaultKind::Internal),
            (TASK_INFO_EMPTY_FAULT, FaultKind::Internal),
            ("", FaultKind::Internal),
            ("random.fault.type", FaultKind::Internal),
        ];

        for (fault_type, expected) in cases {
            assert_eq!(classify(fault_type), expected, "classify({fault_type:?})");
        }
    }

    #[test]
    fn test_add_non_storage_prefix() {
        assert_eq!(
            add_non_storage_prefix("InvalidHostState"),
            "fault.nonstorage.InvalidHostState"
        );
        assert_eq!(
            add_non_storage_prefix("vim.fault.NotFound"),
            "fault.nonstorage.vim.fault.NotFound"
        );
        // The fault string is kept as is, dots included
        assert_eq!(
            add_non_storage_prefix("fault.with.dots"),
            "fault.nonstorage.fault.with.dots"
        );
        assert_eq!(
            add_non_storage_prefix("fault.nonstorage.DiskNotDetached"),
            "fault.nonstorage.DiskNotDetached"
        );
        assert_eq!(add_non_storage_prefix(""), "");
    }

    #[test]
    fn test_reported_type() {
        assert_eq!(
            Fault::new(FAULT_HOST_NOT_CONNECTED, "host down").reported_type(),
            "fault.nonstorage.HostNotConnected"
        );
        assert_eq!(Fault::new(FAULT_NOT_FOUND, "x").reported_type(), "NotFound");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FaultKind::InvalidState.is_retryable());
        assert!(FaultKind::NonStorage.is_retryable());
        assert!(FaultKind::Internal.is_retryable());
        assert!(!FaultKind::NotFound.is_retryable());
        assert!(!FaultKind::AlreadyExists.is_retryable());
        assert!(!FaultKind::NotSupported.is_retryable());
    }

    #[test]
    fn test_already_exists_on_create_is_success() {
        let create = VolumeOperation::CreateVolume {
            name: "pvc-1".to_string(),
            capacity_bytes: 4096,
            parameters: HashMap::new(),
        };
        let info = idempotent_success(&create, &Fault::already_exists("vol-9", "exists")).unwrap();
        assert_eq!(info.volume_id.as_deref(), Some("vol-9"));
        assert_eq!(info.capacity_bytes, 4096);

        // Without the existing volume id there is nothing to report.
        let bare = Fault::new(FAULT_ALREADY_EXISTS, "exists");
        assert!(idempotent_success(&create, &bare).is_none());
    }

    #[test]
    fn test_not_found_on_delete_is_success() {
        let delete = VolumeOperation::DeleteVolume {
            volume_id: "vol-1".to_string(),
        };
        let info = idempotent_success(&delete, &Fault::new(FAULT_NOT_FOUND, "gone")).unwrap();
        assert_eq!(info.volume_id.as_deref(), Some("vol-1"));

        let extend = VolumeOperation::ExtendVolume {
            volume_id: "vol-1".to_string(),
            new_capacity_bytes: 10,
        };
        assert!(idempotent_success(&extend, &Fault::new(FAULT_NOT_FOUND, "gone")).is_none());
    }
}
