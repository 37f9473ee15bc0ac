//! In-memory simulated storage backend.
//!
//! Tasks complete after a fixed latency and are evaluated against a small
//! volume table the first time they are observed finished. The result is
//! cached, so repeated status queries for the same task agree. Hooks let
//! tests inject poll failures, submission failures and task faults.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use super::{BackendError, StorageBackend};
use crate::fault::{FAULT_INVALID_STATE, FAULT_NOT_FOUND, Fault};
use crate::idempotency::{OperationRecord, OwnerLookup};
use crate::types::{TaskInfo, TaskReference, TaskState, TaskStatus, VolumeOperation};

#[derive(Debug, Clone)]
pub struct InMemoryBackendOptions {
    pub endpoint: String,
    /// Time between submission and the task reporting finished
    pub task_latency: Duration,
}

impl Default for InMemoryBackendOptions {
    fn default() -> Self {
        Self {
            endpoint: "memory://local".to_string(),
            task_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct SimTask {
    operation: VolumeOperation,
    submitted_at: Instant,
    forced_fault: Option<Fault>,
    result: Option<Result<TaskInfo, Fault>>,
}

#[derive(Debug)]
struct SimVolume {
    name: String,
    capacity_bytes: i64,
    attached_nodes: HashSet<String>,
}

#[derive(Debug, Default)]
struct BackendState {
    tasks: HashMap<TaskReference, SimTask>,
    volumes: HashMap<String, SimVolume>,
    /// Volume name to volume id
    names: HashMap<String, String>,
    fail_polls: u32,
    fail_submissions: u32,
    next_fault: Option<Fault>,
}

impl BackendState {
    fn apply(&mut self, operation: &VolumeOperation) -> Result<TaskInfo, Fault> {
        match operation {
            VolumeOperation::CreateVolume {
                name,
                capacity_bytes,
                ..
            } => {
                if let Some(existing) = self.names.get(name) {
                    return Err(Fault::already_exists(
                        existing.clone(),
                        format!("volume {name} already exists"),
                    ));
                }
                let volume_id = format!("vol-{}", Uuid::new_v4());
                self.names.insert(name.clone(), volume_id.clone());
                self.volumes.insert(
                    volume_id.clone(),
                    SimVolume {
                        name: name.clone(),
                        capacity_bytes: *capacity_bytes,
                        attached_nodes: HashSet::new(),
                    },
                );
                Ok(TaskInfo {
                    volume_id: Some(volume_id),
                    snapshot_id: None,
                    capacity_bytes: *capacity_bytes,
                })
            }
            VolumeOperation::ExtendVolume {
                volume_id,
                new_capacity_bytes,
            } => {
                let volume = self.volume_mut(volume_id)?;
                if *new_capacity_bytes < volume.capacity_bytes {
                    return Err(Fault::new(
                        FAULT_INVALID_STATE,
                        format!(
                            "cannot shrink volume {volume_id} from {} to {new_capacity_bytes} bytes",
                            volume.capacity_bytes
                        ),
                    ));
                }
                volume.capacity_bytes = *new_capacity_bytes;
                Ok(TaskInfo {
                    volume_id: Some(volume_id.clone()),
                    snapshot_id: None,
                    capacity_bytes: *new_capacity_bytes,
                })
            }
            VolumeOperation::CreateSnapshot { volume_id, .. } => {
                let capacity_bytes = self.volume_mut(volume_id)?.capacity_bytes;
                Ok(TaskInfo {
                    volume_id: Some(volume_id.clone()),
                    snapshot_id: Some(format!("snap-{}", Uuid::new_v4())),
                    capacity_bytes,
                })
            }
            VolumeOperation::AttachVolume { volume_id, node_id } => {
                let volume = self.volume_mut(volume_id)?;
                volume.attached_nodes.insert(node_id.clone());
                Ok(TaskInfo {
                    volume_id: Some(volume_id.clone()),
                    snapshot_id: None,
                    capacity_bytes: volume.capacity_bytes,
                })
            }
            VolumeOperation::DetachVolume { volume_id, node_id } => {
                let volume = self.volume_mut(volume_id)?;
                if !volume.attached_nodes.remove(node_id) {
                    return Err(Fault::new(
                        FAULT_NOT_FOUND,
                        format!("volume {volume_id} is not attached to {node_id}"),
                    ));
                }
                Ok(TaskInfo {
                    volume_id: Some(volume_id.clone()),
                    snapshot_id: None,
                    capacity_bytes: volume.capacity_bytes,
                })
            }
            VolumeOperation::DeleteVolume { volume_id } => {
                let volume = self.volume_mut(volume_id)?;
                if !volume.attached_nodes.is_empty() {
                    return Err(Fault::new(
                        FAULT_INVALID_STATE,
                        format!("volume {volume_id} is still attached"),
                    ));
                }
                if let Some(volume) = self.volumes.remove(volume_id) {
                    self.names.remove(&volume.name);
                }
                Ok(TaskInfo {
                    volume_id: Some(volume_id.clone()),
                    snapshot_id: None,
                    capacity_bytes: 0,
                })
            }
        }
    }

    fn volume_mut(&mut self, volume_id: &str) -> Result<&mut SimVolume, Fault> {
        self.volumes
            .get_mut(volume_id)
            .ok_or_else(|| Fault::new(FAULT_NOT_FOUND, format!("volume {volume_id} not found")))
    }
}

/// Simulated backend keeping all state in process memory.
#[derive(Debug)]
pub struct InMemoryBackend {
    options: InMemoryBackendOptions,
    state: Mutex<BackendState>,
    submissions: AtomicUsize,
    polls: AtomicUsize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(InMemoryBackendOptions::default())
    }
}

impl InMemoryBackend {
    pub fn new(options: InMemoryBackendOptions) -> Self {
        Self {
            options,
            state: Mutex::new(BackendState::default()),
            submissions: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(task_latency: Duration) -> Self {
        Self::new(InMemoryBackendOptions {
            task_latency,
            ..Default::default()
        })
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of accepted submissions.
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Number of batched status queries served, including failed ones.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Fail the next `count` status queries.
    pub fn fail_next_polls(&self, count: u32) {
        self.state().fail_polls = count;
    }

    /// Reject the next `count` submissions as unavailable.
    pub fn fail_next_submissions(&self, count: u32) {
        self.state().fail_submissions = count;
    }

    /// Make the next submitted task finish with `fault`.
    pub fn inject_fault(&self, fault: Fault) {
        self.state().next_fault = Some(fault);
    }

    /// Drop all knowledge of a task, as a restarted backend would.
    pub fn forget_task(&self, reference: &TaskReference) -> bool {
        self.state().tasks.remove(reference).is_some()
    }

    pub fn volume_exists(&self, volume_id: &str) -> bool {
        self.state().volumes.contains_key(volume_id)
    }

    pub fn volume_capacity(&self, volume_id: &str) -> Option<i64> {
        self.state()
            .volumes
            .get(volume_id)
            .map(|volume| volume.capacity_bytes)
    }

    pub fn volume_count(&self) -> usize {
        self.state().volumes.len()
    }
}

#[tonic::async_trait]
impl StorageBackend for InMemoryBackend {
    fn endpoint(&self) -> String {
        self.options.endpoint.clone()
    }

    async fn submit(&self, operation: &VolumeOperation) -> Result<TaskReference, BackendError> {
        operation.validate().map_err(BackendError::InvalidRequest)?;

        let mut state = self.state();
        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err(BackendError::Unavailable(
                "simulated submission failure".to_string(),
            ));
        }

        let reference = TaskReference::new(format!("task-{}", Uuid::new_v4()));
        let forced_fault = state.next_fault.take();
        state.tasks.insert(
            reference.clone(),
            SimTask {
                operation: operation.clone(),
                submitted_at: Instant::now(),
                forced_fault,
                result: None,
            },
        );
        self.submissions.fetch_add(1, Ordering::SeqCst);

        debug!(task = %reference, operation = %operation.kind(), "Accepted submission");
        Ok(reference)
    }

    async fn query_tasks(
        &self,
        references: &[TaskReference],
    ) -> Result<Vec<TaskStatus>, BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state();
        if state.fail_polls > 0 {
            state.fail_polls -= 1;
            return Err(BackendError::QueryFailed(
                "simulated status query failure".to_string(),
            ));
        }

        let mut statuses = Vec::with_capacity(references.len());
        for reference in references {
            let Some(task) = state.tasks.get(reference) else {
                continue;
            };
            let cached = task.result.clone();
            let running = task.submitted_at.elapsed() < self.options.task_latency;
            let operation = task.operation.clone();
            let forced_fault = task.forced_fault.clone();

            let result = match cached {
                Some(result) => result,
                None if running => {
                    statuses.push(TaskStatus {
                        reference: reference.clone(),
                        state: TaskState::Running,
                    });
                    continue;
                }
                None => {
                    let result = match forced_fault {
                        Some(fault) => Err(fault),
                        None => state.apply(&operation),
                    };
                    if let Some(task) = state.tasks.get_mut(reference) {
                        task.result = Some(result.clone());
                    }
                    result
                }
            };

            statuses.push(TaskStatus {
                reference: reference.clone(),
                state: match result {
                    Ok(info) => TaskState::Success(Some(info)),
                    Err(fault) => TaskState::Error(fault),
                },
            });
        }
        Ok(statuses)
    }
}

#[tonic::async_trait]
impl OwnerLookup for InMemoryBackend {
    /// A record is owned while its volume exists. Records that never got a
    /// volume id are left alone.
    async fn owner_exists(&self, record: &OperationRecord) -> Result<bool, BackendError> {
        Ok(match &record.volume_id {
            Some(volume_id) => self.volume_exists(volume_id),
            None => true,
        })
    }
}
