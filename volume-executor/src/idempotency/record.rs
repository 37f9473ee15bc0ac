//! Persisted operation record and its attempt history.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{OperationKind, TaskInfo, TaskReference};

/// Maximum number of attempts kept in `latest_attempts`
pub const MAX_LATEST_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Successful,
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }
}

/// One submission of an operation to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskReference>,
    pub operation_id: String,
    pub endpoint: String,
    /// Unix timestamp in milliseconds
    pub invoked_at: i64,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
}

impl AttemptDetails {
    /// A freshly submitted attempt for task `task_id`.
    pub fn in_progress(task_id: TaskReference, endpoint: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            task_id: Some(task_id),
            operation_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            invoked_at: now_millis(),
            status: AttemptStatus::InProgress,
            error: None,
            operation: Some(operation),
        }
    }

    /// An attempt the backend refused before creating a task.
    pub fn rejected(endpoint: impl Into<String>, operation: OperationKind, error: impl Into<String>) -> Self {
        Self {
            task_id: None,
            operation_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            invoked_at: now_millis(),
            status: AttemptStatus::Failed,
            error: Some(error.into()),
            operation: Some(operation),
        }
    }
}

/// Terminal result of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultUpdate {
    pub task_id: Option<TaskReference>,
    pub endpoint: String,
    pub operation: OperationKind,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub info: Option<TaskInfo>,
}

impl ResultUpdate {
    pub fn succeeded(
        task_id: TaskReference,
        endpoint: impl Into<String>,
        operation: OperationKind,
        info: TaskInfo,
    ) -> Self {
        Self {
            task_id: Some(task_id),
            endpoint: endpoint.into(),
            operation,
            status: AttemptStatus::Successful,
            error: None,
            info: Some(info),
        }
    }

    pub fn failed(
        task_id: TaskReference,
        endpoint: impl Into<String>,
        operation: OperationKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Some(task_id),
            endpoint: endpoint.into(),
            operation,
            status: AttemptStatus::Failed,
            error: Some(error.into()),
            info: None,
        }
    }
}

/// Attempt history of one logical operation, keyed by instance name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub instance_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub capacity_bytes: i64,
    /// Capacity held against quota while the operation is in flight
    #[serde(default)]
    pub reserved_bytes: i64,
    /// Namespace of the object that requested the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_attempt: Option<AttemptDetails>,
    #[serde(default)]
    pub latest_attempts: VecDeque<AttemptDetails>,
    #[serde(default)]
    pub error_count: u32,
}

impl OperationRecord {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            volume_id: None,
            snapshot_id: None,
            capacity_bytes: 0,
            reserved_bytes: 0,
            owner: None,
            first_attempt: None,
            latest_attempts: VecDeque::new(),
            error_count: 0,
        }
    }

    pub fn latest_attempt(&self) -> Option<&AttemptDetails> {
        self.latest_attempts.back()
    }

    /// Append an attempt, evicting the oldest beyond [`MAX_LATEST_ATTEMPTS`].
    pub fn push_attempt(&mut self, attempt: AttemptDetails) {
        if self.first_attempt.is_none() {
            self.first_attempt = Some(attempt.clone());
        }
        if attempt.status == AttemptStatus::Failed {
            self.error_count += 1;
        }
        self.latest_attempts.push_back(attempt);
        while self.latest_attempts.len() > MAX_LATEST_ATTEMPTS {
            self.latest_attempts.pop_front();
        }
    }

    /// Apply a terminal result. Returns `false` when nothing changed.
    pub fn apply_result(&mut self, update: &ResultUpdate) -> bool {
        let matching = self
            .latest_attempts
            .iter_mut()
            .rev()
            .find(|attempt| update.task_id.is_some() && attempt.task_id == update.task_id);

        match matching {
            Some(attempt) if attempt.status == update.status && attempt.error == update.error => {
                return false;
            }
            Some(attempt) => {
                attempt.status = update.status;
                attempt.error = update.error.clone();
                if update.status == AttemptStatus::Failed {
                    self.error_count += 1;
                }
            }
            None => self.push_attempt(AttemptDetails {
                task_id: update.task_id.clone(),
                operation_id: Uuid::new_v4().to_string(),
                endpoint: update.endpoint.clone(),
                invoked_at: now_millis(),
                status: update.status,
                error: update.error.clone(),
                operation: Some(update.operation),
            }),
        }

        if let Some(info) = &update.info {
            if info.volume_id.is_some() {
                self.volume_id = info.volume_id.clone();
            }
            if info.snapshot_id.is_some() {
                self.snapshot_id = info.snapshot_id.clone();
            }
            self.capacity_bytes = info.capacity_bytes;
        }
        if update.status.is_terminal() {
            self.reserved_bytes = 0;
        }
        true
    }

    /// Result recorded by the latest successful attempt of `operation`.
    pub fn recorded_success(&self, operation: OperationKind) -> Option<TaskInfo> {
        let latest = self.latest_attempt()?;
        if latest.status != AttemptStatus::Successful || latest.operation != Some(operation) {
            return None;
        }
        Some(TaskInfo {
            volume_id: self.volume_id.clone(),
            snapshot_id: self.snapshot_id.clone(),
            capacity_bytes: self.capacity_bytes,
        })
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(task: &str) -> AttemptDetails {
        AttemptDetails::in_progress(task.into(), "memory://local", OperationKind::CreateVolume)
    }

    #[test]
    fn test_ring_keeps_latest_ten() {
        let mut record = OperationRecord::new("pvc-1");
        for i in 0..25 {
            record.push_attempt(attempt(&format!("task-{i}")));
        }

        assert_eq!(record.latest_attempts.len(), MAX_LATEST_ATTEMPTS);
        assert_eq!(
            record.latest_attempts.front().unwrap().task_id.as_ref().unwrap().as_str(),
            "task-15"
        );
        assert_eq!(
            record.latest_attempt().unwrap().task_id.as_ref().unwrap().as_str(),
            "task-24"
        );
        // The first attempt is never evicted or replaced
        assert_eq!(
            record.first_attempt.as_ref().unwrap().task_id.as_ref().unwrap().as_str(),
            "task-0"
        );
    }

    #[test]
    fn test_failed_attempts_count_errors() {
        let mut record = OperationRecord::new("pvc-1");
        record.push_attempt(AttemptDetails::rejected(
            "memory://local",
            OperationKind::CreateVolume,
            "unavailable",
        ));
        record.push_attempt(attempt("task-1"));
        assert_eq!(record.error_count, 1);
    }

    #[test]
    fn test_apply_result_updates_matching_attempt() {
        let mut record = OperationRecord::new("pvc-1");
        record.reserved_bytes = 4096;
        record.push_attempt(attempt("task-1"));

        let update = ResultUpdate::succeeded(
            "task-1".into(),
            "memory://local",
            OperationKind::CreateVolume,
            TaskInfo {
                volume_id: Some("vol-1".to_string()),
                snapshot_id: None,
                capacity_bytes: 4096,
            },
        );
        assert!(record.apply_result(&update));

        assert_eq!(record.latest_attempts.len(), 1);
        assert_eq!(record.latest_attempt().unwrap().status, AttemptStatus::Successful);
        assert_eq!(record.volume_id.as_deref(), Some("vol-1"));
        assert_eq!(record.reserved_bytes, 0);

        // Recording the same terminal status again changes nothing
        let before = record.clone();
        assert!(!record.apply_result(&update));
        assert_eq!(record, before);
    }

    #[test]
    fn test_apply_result_without_attempt_appends() {
        let mut record = OperationRecord::new("pvc-1");
        let update = ResultUpdate::failed(
            "task-9".into(),
            "memory://local",
            OperationKind::ExtendVolume,
            "InvalidState: busy",
        );
        assert!(record.apply_result(&update));
        assert_eq!(record.latest_attempts.len(), 1);
        assert_eq!(record.error_count, 1);
        assert!(record.first_attempt.is_some());
    }

    #[test]
    fn test_recorded_success_matches_operation() {
        let mut record = OperationRecord::new("pvc-1");
        record.push_attempt(attempt("task-1"));
        assert!(record.recorded_success(OperationKind::CreateVolume).is_none());

        record.apply_result(&ResultUpdate::succeeded(
            "task-1".into(),
            "memory://local",
            OperationKind::CreateVolume,
            TaskInfo {
                volume_id: Some("vol-1".to_string()),
                snapshot_id: None,
                capacity_bytes: 1,
            },
        ));
        assert_eq!(
            record
                .recorded_success(OperationKind::CreateVolume)
                .unwrap()
                .volume_id
                .as_deref(),
            Some("vol-1")
        );
        assert!(record.recorded_success(OperationKind::DeleteVolume).is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let mut record = OperationRecord::new("pvc-json");
        record.push_attempt(attempt("task-1"));
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["instance_name"], "pvc-json");
        assert_eq!(json["latest_attempts"][0]["status"], "in_progress");
        assert_eq!(json["latest_attempts"][0]["task_id"], "task-1");
        assert!(json.get("volume_id").is_none());
    }
}
