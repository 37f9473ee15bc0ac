//! Core value types shared by the executor, registry, and dispatcher.
//!
//! Identifiers handed out by the backend are wrapped in newtypes so they
//! cannot be confused with volume keys or instance names at call sites.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fault::Fault;

// ============================================================================
// TaskReference
// ============================================================================

/// Opaque handle returned by the backend for one asynchronous submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskReference(String);

impl TaskReference {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskReference {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// OperationKind
// ============================================================================

/// Kind of volume operation, used for logging, metrics labels and replay checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateVolume,
    ExtendVolume,
    CreateSnapshot,
    AttachVolume,
    DetachVolume,
    DeleteVolume,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateVolume => "create_volume",
            OperationKind::ExtendVolume => "extend_volume",
            OperationKind::CreateSnapshot => "create_snapshot",
            OperationKind::AttachVolume => "attach_volume",
            OperationKind::DetachVolume => "detach_volume",
            OperationKind::DeleteVolume => "delete_volume",
        }
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = OperationKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create_volume" | "create" => Ok(OperationKind::CreateVolume),
            "extend_volume" | "extend" | "expand" => Ok(OperationKind::ExtendVolume),
            "create_snapshot" | "snapshot" => Ok(OperationKind::CreateSnapshot),
            "attach_volume" | "attach" => Ok(OperationKind::AttachVolume),
            "detach_volume" | "detach" => Ok(OperationKind::DetachVolume),
            "delete_volume" | "delete" => Ok(OperationKind::DeleteVolume),
            _ => Err(OperationKindParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown operation kind.
#[derive(Debug, Clone)]
pub struct OperationKindParseError(String);

impl Display for OperationKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown operation kind '{}'", self.0)
    }
}

impl std::error::Error for OperationKindParseError {}

// ============================================================================
// VolumeOperation
// ============================================================================

/// A volume operation as submitted to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeOperation {
    CreateVolume {
        name: String,
        capacity_bytes: i64,
        #[serde(default)]
        parameters: HashMap<String, String>,
    },
    ExtendVolume {
        volume_id: String,
        new_capacity_bytes: i64,
    },
    CreateSnapshot {
        volume_id: String,
        name: String,
    },
    AttachVolume {
        volume_id: String,
        node_id: String,
    },
    DetachVolume {
        volume_id: String,
        node_id: String,
    },
    DeleteVolume {
        volume_id: String,
    },
}

impl VolumeOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            VolumeOperation::CreateVolume { .. } => OperationKind::CreateVolume,
            VolumeOperation::ExtendVolume { .. } => OperationKind::ExtendVolume,
            VolumeOperation::CreateSnapshot { .. } => OperationKind::CreateSnapshot,
            VolumeOperation::AttachVolume { .. } => OperationKind::AttachVolume,
            VolumeOperation::DetachVolume { .. } => OperationKind::DetachVolume,
            VolumeOperation::DeleteVolume { .. } => OperationKind::DeleteVolume,
        }
    }

    /// Volume this operation targets, if it already exists.
    pub fn volume_id(&self) -> Option<&str> {
        match self {
            VolumeOperation::CreateVolume { .. } => None,
            VolumeOperation::ExtendVolume { volume_id, .. }
            | VolumeOperation::CreateSnapshot { volume_id, .. }
            | VolumeOperation::AttachVolume { volume_id, .. }
            | VolumeOperation::DetachVolume { volume_id, .. }
            | VolumeOperation::DeleteVolume { volume_id } => Some(volume_id),
        }
    }

    /// Reject requests the backend could never accept.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            VolumeOperation::CreateVolume {
                name,
                capacity_bytes,
                ..
            } => {
                if name.is_empty() {
                    return Err("volume name is required".to_string());
                }
                if *capacity_bytes <= 0 {
                    return Err("capacity_bytes must be positive".to_string());
                }
            }
            VolumeOperation::ExtendVolume {
                new_capacity_bytes, ..
            } => {
                if *new_capacity_bytes <= 0 {
                    return Err("new_capacity_bytes must be positive".to_string());
                }
            }
            VolumeOperation::CreateSnapshot { name, .. } => {
                if name.is_empty() {
                    return Err("snapshot name is required".to_string());
                }
            }
            VolumeOperation::AttachVolume { node_id, .. }
            | VolumeOperation::DetachVolume { node_id, .. } => {
                if node_id.is_empty() {
                    return Err("node_id is required".to_string());
                }
            }
            VolumeOperation::DeleteVolume { .. } => {}
        }

        match self.volume_id() {
            Some("") => Err("volume_id is required".to_string()),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Task status and outcome
// ============================================================================

/// Result payload reported by the backend for a successful task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub capacity_bytes: i64,
}

/// Backend view of a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    /// Finished successfully; the payload may be missing on a misbehaving backend.
    Success(Option<TaskInfo>),
    Error(Fault),
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Success(_) | TaskState::Error(_))
    }
}

/// One entry of a batched status query response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub reference: TaskReference,
    pub state: TaskState,
}

/// Final result of a task, delivered to its waiter at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub reference: TaskReference,
    pub result: Result<TaskInfo, Fault>,
}

impl TaskOutcome {
    /// Build the outcome for a finished status, or `None` if it is still pending.
    pub fn from_status(status: TaskStatus) -> Option<Self> {
        let result = match status.state {
            TaskState::Queued | TaskState::Running => return None,
            TaskState::Success(Some(info)) => Ok(info),
            TaskState::Success(None) => Err(Fault::task_info_empty()),
            TaskState::Error(fault) => Err(fault),
        };
        Some(Self {
            reference: status.reference,
            result,
        })
    }
}

/// Value returned to the caller of `execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub volume_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub capacity_bytes: i64,
    /// True when the result came from the idempotency record instead of a new submission.
    pub replayed: bool,
}

impl OperationResult {
    pub fn from_info(info: TaskInfo) -> Self {
        Self {
            volume_id: info.volume_id,
            snapshot_id: info.snapshot_id,
            capacity_bytes: info.capacity_bytes,
            replayed: false,
        }
    }
}
