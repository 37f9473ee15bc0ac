//! Volume operation entry point.
//!
//! [`VolumeOperationExecutor::execute`] serializes operations per volume key,
//! consults the idempotency record, submits to the backend when needed, and
//! waits for the dispatcher to deliver the task outcome. [`ExecutorServices`]
//! wires the shared registries and background loops together.

use std::slice;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, StorageBackend};
use crate::backoff::{Backoff, retry_if};
use crate::config::ExecutorConfig;
use crate::dispatcher::TaskDispatcher;
use crate::error::{ExecuteError, Result, StartupError};
use crate::fault::idempotent_success;
use crate::idempotency::{
    AttemptDetails, AttemptStatus, IdempotencyStore, OperationRecord, OwnerLookup, RecordStore,
    Reservation, ResultUpdate, validate_name,
};
use crate::lock::VolumeLocks;
use crate::metrics::{self, OperationTimer};
use crate::registry::TaskRegistry;
use crate::types::{
    OperationKind, OperationResult, TaskOutcome, TaskReference, TaskState, VolumeOperation,
};

/// Create parameter naming the namespace that owns the new volume
pub const OWNER_NAMESPACE_PARAMETER: &str = "csi.storage.k8s.io/pvc/namespace";

pub struct VolumeOperationExecutor {
    locks: Arc<VolumeLocks>,
    registry: Arc<TaskRegistry>,
    backend: Arc<dyn StorageBackend>,
    records: Arc<IdempotencyStore>,
    submit_backoff: Backoff,
    operation_timeout: Duration,
    shutdown: CancellationToken,
}

impl VolumeOperationExecutor {
    pub fn new(
        locks: Arc<VolumeLocks>,
        registry: Arc<TaskRegistry>,
        backend: Arc<dyn StorageBackend>,
        records: Arc<IdempotencyStore>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            locks,
            registry,
            backend,
            records,
            submit_backoff: config.submit_backoff,
            operation_timeout: config.operation_timeout(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that ends waits started through [`execute`](Self::execute).
    pub fn with_shutdown_token(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn locks(&self) -> &Arc<VolumeLocks> {
        &self.locks
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Run `operation` against the volume identified by `volume_key`.
    ///
    /// `instance_name` identifies the logical request: repeating a request
    /// with the same instance name returns the recorded result or re-attaches
    /// to the task already in flight instead of submitting again.
    pub async fn execute(
        &self,
        volume_key: &str,
        instance_name: &str,
        operation: VolumeOperation,
    ) -> Result<OperationResult> {
        let shutdown = self.shutdown.clone();
        self.execute_with_cancel(volume_key, instance_name, operation, &shutdown)
            .await
    }

    /// Like [`execute`](Self::execute), giving up the wait when `cancel` fires.
    ///
    /// A cancelled or timed out wait leaves the backend task running; its
    /// outcome is picked up by the next request with the same instance name.
    pub async fn execute_with_cancel(
        &self,
        volume_key: &str,
        instance_name: &str,
        operation: VolumeOperation,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let kind = operation.kind();
        let timer = OperationTimer::new(kind.as_str());

        let result = self.run(volume_key, instance_name, &operation, cancel).await;

        match &result {
            Ok(outcome) => {
                if outcome.replayed {
                    metrics::record_replay(kind.as_str());
                }
                info!(
                    volume_key = %volume_key,
                    instance = %instance_name,
                    operation = %kind,
                    volume_id = ?outcome.volume_id,
                    replayed = outcome.replayed,
                    "Volume operation completed"
                );
                timer.success();
            }
            Err(ExecuteError::LockConflict(_)) => {
                warn!(
                    volume_key = %volume_key,
                    operation = %kind,
                    "Volume operation rejected, another operation is in progress"
                );
                timer.failure("lock_conflict");
            }
            Err(e) => {
                error!(
                    volume_key = %volume_key,
                    instance = %instance_name,
                    operation = %kind,
                    error = %e,
                    "Volume operation failed"
                );
                timer.failure(e.code());
            }
        }

        result
    }

    async fn run(
        &self,
        volume_key: &str,
        instance_name: &str,
        operation: &VolumeOperation,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        if volume_key.is_empty() {
            return Err(ExecuteError::InvalidArgument(
                "volume key is required".to_string(),
            ));
        }
        if instance_name.is_empty() {
            return Err(ExecuteError::InvalidArgument(
                "instance name is required".to_string(),
            ));
        }
        // Instance names key the persisted record; reject ones it cannot store.
        validate_name(instance_name).map_err(|e| ExecuteError::InvalidArgument(e.to_string()))?;
        operation.validate().map_err(ExecuteError::InvalidArgument)?;

        let kind = operation.kind();
        let Some(_guard) = self.locks.try_lock(volume_key) else {
            metrics::record_lock_conflict(kind.as_str());
            return Err(ExecuteError::LockConflict(volume_key.to_string()));
        };

        if let Some(record) = self.records.load(instance_name).await? {
            if let Some(info) = record.recorded_success(kind) {
                debug!(instance = %instance_name, "Returning recorded result");
                return Ok(OperationResult {
                    replayed: true,
                    ..OperationResult::from_info(info)
                });
            }
            if let Some(reference) = in_progress_task(&record, kind) {
                if let Some(result) = self
                    .resume(instance_name, operation, reference, cancel)
                    .await?
                {
                    return Ok(result);
                }
            }
        }

        let reference = self.submit(instance_name, operation).await?;
        let pending = self.registry.register(reference.clone(), kind);
        self.records
            .record_attempt(
                instance_name,
                AttemptDetails::in_progress(reference.clone(), self.backend.endpoint(), kind),
                &reservation(operation),
            )
            .await?;

        debug!(
            instance = %instance_name,
            task = %reference,
            "Waiting for task"
        );
        let outcome = pending.wait(self.operation_timeout, cancel).await?;
        self.complete(instance_name, operation, outcome).await
    }

    async fn submit(
        &self,
        instance_name: &str,
        operation: &VolumeOperation,
    ) -> Result<TaskReference> {
        let kind = operation.kind();
        let submitted = retry_if(
            &self.submit_backoff,
            kind.as_str(),
            || self.backend.submit(operation),
            BackendError::is_retryable,
        )
        .await;

        match submitted {
            Ok(reference) => {
                info!(
                    instance = %instance_name,
                    operation = %kind,
                    task = %reference,
                    "Submitted volume operation"
                );
                Ok(reference)
            }
            Err(source) => {
                let attempt =
                    AttemptDetails::rejected(self.backend.endpoint(), kind, source.to_string());
                if let Err(e) = self
                    .records
                    .record_attempt(instance_name, attempt, &Reservation::default())
                    .await
                {
                    warn!(instance = %instance_name, error = %e, "Failed to record rejected attempt");
                }
                Err(ExecuteError::Submission {
                    operation: kind,
                    source,
                })
            }
        }
    }

    /// Pick up a task submitted by an earlier request.
    ///
    /// Returns `None` when the backend no longer knows the task and the
    /// operation has to be submitted again.
    async fn resume(
        &self,
        instance_name: &str,
        operation: &VolumeOperation,
        reference: TaskReference,
        cancel: &CancellationToken,
    ) -> Result<Option<OperationResult>> {
        let statuses = retry_if(
            &self.submit_backoff,
            "query_tasks",
            || self.backend.query_tasks(slice::from_ref(&reference)),
            BackendError::is_retryable,
        )
        .await
        .map_err(|source| ExecuteError::StatusCheck {
            reference: reference.clone(),
            source,
        })?;

        let Some(status) = statuses.into_iter().find(|s| s.reference == reference) else {
            warn!(
                instance = %instance_name,
                task = %reference,
                "Backend no longer knows in-progress task, resubmitting"
            );
            return Ok(None);
        };

        if let TaskState::Queued | TaskState::Running = status.state {
            info!(instance = %instance_name, task = %reference, "Re-attaching to running task");
            let pending = self.registry.register(reference, operation.kind());
            let outcome = pending.wait(self.operation_timeout, cancel).await?;
            return self.complete(instance_name, operation, outcome).await.map(Some);
        }

        match TaskOutcome::from_status(status) {
            Some(outcome) => {
                // Another waiter on this task would never be served now.
                self.registry.delete(&outcome.reference);
                debug!(instance = %instance_name, task = %outcome.reference, "Task finished while unattended");
                self.complete(instance_name, operation, outcome).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Persist a delivered outcome and turn it into the caller's result.
    async fn complete(
        &self,
        instance_name: &str,
        operation: &VolumeOperation,
        outcome: TaskOutcome,
    ) -> Result<OperationResult> {
        let kind = operation.kind();
        let endpoint = self.backend.endpoint();
        let TaskOutcome { reference, result } = outcome;

        let info = match result {
            Ok(info) => info,
            Err(fault) => match idempotent_success(operation, &fault) {
                Some(info) => {
                    info!(
                        instance = %instance_name,
                        task = %reference,
                        fault = %fault.reported_type(),
                        "Target state already reached, treating fault as success"
                    );
                    info
                }
                None => {
                    let update =
                        ResultUpdate::failed(reference.clone(), endpoint, kind, fault.to_string());
                    if let Err(e) = self.records.record_result(instance_name, &update).await {
                        warn!(instance = %instance_name, error = %e, "Failed to record task fault");
                    }
                    return Err(ExecuteError::TaskFault { reference, fault });
                }
            },
        };

        if kind == OperationKind::DeleteVolume {
            self.records.delete(instance_name).await?;
        } else {
            let update = ResultUpdate::succeeded(reference, endpoint, kind, info.clone());
            self.records.record_result(instance_name, &update).await?;
        }

        Ok(OperationResult::from_info(info))
    }
}

fn in_progress_task(record: &OperationRecord, kind: OperationKind) -> Option<TaskReference> {
    let latest = record.latest_attempt()?;
    if latest.status != AttemptStatus::InProgress || latest.operation != Some(kind) {
        return None;
    }
    latest.task_id.clone()
}

fn reservation(operation: &VolumeOperation) -> Reservation {
    match operation {
        VolumeOperation::CreateVolume {
            capacity_bytes,
            parameters,
            ..
        } => Reservation {
            owner: parameters.get(OWNER_NAMESPACE_PARAMETER).cloned(),
            reserved_bytes: *capacity_bytes,
        },
        VolumeOperation::ExtendVolume {
            new_capacity_bytes, ..
        } => Reservation {
            owner: None,
            reserved_bytes: *new_capacity_bytes,
        },
        _ => Reservation::default(),
    }
}

/// Running executor with its dispatcher and record cleanup loops.
pub struct ExecutorServices {
    executor: Arc<VolumeOperationExecutor>,
    dispatcher: JoinHandle<()>,
    cleanup: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ExecutorServices {
    /// Validate `config`, wait for the record store, and start background loops.
    ///
    /// Record cleanup only runs when `owners` is given.
    pub async fn start(
        config: ExecutorConfig,
        backend: Arc<dyn StorageBackend>,
        store: Arc<dyn RecordStore>,
        owners: Option<Arc<dyn OwnerLookup>>,
    ) -> std::result::Result<Self, StartupError> {
        config.validate()?;

        let records = Arc::new(IdempotencyStore::new(store, config.store_backoff));
        records.bootstrap(&config.bootstrap_backoff).await?;

        let cancel = CancellationToken::new();
        let registry = Arc::new(TaskRegistry::new());
        let locks = Arc::new(VolumeLocks::new());

        let dispatcher = TaskDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&backend),
            config.dispatcher.clone(),
            config.poll_backoff,
        )
        .spawn(cancel.child_token());

        let cleanup = owners.map(|owners| {
            Arc::clone(&records).spawn_cleanup(owners, config.cleanup_interval(), cancel.child_token())
        });

        info!(
            endpoint = %backend.endpoint(),
            poll_interval_ms = config.dispatcher.poll_interval_ms,
            operation_timeout_secs = config.operation_timeout_secs,
            "Volume operation executor started"
        );

        let executor = VolumeOperationExecutor::new(locks, registry, backend, records, &config)
            .with_shutdown_token(cancel.child_token());

        Ok(Self {
            executor: Arc::new(executor),
            dispatcher,
            cleanup,
            cancel,
        })
    }

    pub fn executor(&self) -> Arc<VolumeOperationExecutor> {
        Arc::clone(&self.executor)
    }

    /// Stop background loops and end outstanding waits.
    pub async fn shutdown(self) {
        info!("Shutting down volume operation executor");
        self.cancel.cancel();

        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "Task dispatcher terminated abnormally");
        }
        if let Some(cleanup) = self.cleanup {
            if let Err(e) = cleanup.await {
                error!(error = %e, "Record cleanup terminated abnormally");
            }
        }
        info!("Volume operation executor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::DispatcherConfig;
    use crate::idempotency::InMemoryRecordStore;
    use std::collections::HashMap;

    fn test_config() -> ExecutorConfig {
        let fast = Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(5), 3);
        ExecutorConfig {
            dispatcher: DispatcherConfig {
                poll_interval_ms: 5,
                ..Default::default()
            },
            submit_backoff: fast,
            poll_backoff: fast,
            store_backoff: fast,
            bootstrap_backoff: fast,
            operation_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn create(name: &str, namespace: &str) -> VolumeOperation {
        VolumeOperation::CreateVolume {
            name: name.to_string(),
            capacity_bytes: 1 << 20,
            parameters: HashMap::from([(
                OWNER_NAMESPACE_PARAMETER.to_string(),
                namespace.to_string(),
            )]),
        }
    }

    #[test]
    fn test_reservation_for_operations() {
        let r = reservation(&create("pvc-1", "team-a"));
        assert_eq!(r.owner.as_deref(), Some("team-a"));
        assert_eq!(r.reserved_bytes, 1 << 20);

        let r = reservation(&VolumeOperation::DeleteVolume {
            volume_id: "vol-1".to_string(),
        });
        assert_eq!(r, Reservation::default());
    }

    #[tokio::test]
    async fn test_start_execute_shutdown() {
        let backend = Arc::new(InMemoryBackend::default());
        let store = Arc::new(InMemoryRecordStore::new());
        let services = ExecutorServices::start(test_config(), backend.clone(), store.clone(), None)
            .await
            .unwrap();

        let executor = services.executor();
        let result = executor
            .execute("pvc-1", "pvc-1", create("pvc-1", "team-a"))
            .await
            .unwrap();
        assert!(!result.replayed);
        let volume_id = result.volume_id.unwrap();
        assert!(backend.volume_exists(&volume_id));

        let record = store.get("pvc-1").await.unwrap().unwrap().value;
        assert_eq!(record.owner.as_deref(), Some("team-a"));
        assert_eq!(record.reserved_bytes, 0);
        assert_eq!(
            record.latest_attempt().unwrap().status,
            AttemptStatus::Successful
        );
        assert!(!executor.locks().is_held("pvc-1"));

        services.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = test_config();
        config.dispatcher.batch_size = 0;
        let result = ExecutorServices::start(
            config,
            Arc::new(InMemoryBackend::default()),
            Arc::new(InMemoryRecordStore::new()),
            None,
        )
        .await;
        assert!(matches!(result, Err(StartupError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_fails_when_store_never_ready() {
        let store = Arc::new(InMemoryRecordStore::new());
        store.fail_ready_checks(100);
        let result = ExecutorServices::start(
            test_config(),
            Arc::new(InMemoryBackend::default()),
            store,
            None,
        )
        .await;
        assert!(matches!(result, Err(StartupError::Bootstrap(_))));
    }

    #[tokio::test]
    async fn test_rejects_invalid_request_before_locking() {
        let backend = Arc::new(InMemoryBackend::default());
        let services = ExecutorServices::start(
            test_config(),
            backend.clone(),
            Arc::new(InMemoryRecordStore::new()),
            None,
        )
        .await
        .unwrap();
        let executor = services.executor();

        let err = executor
            .execute(
                "vol-1",
                "extend-vol-1",
                VolumeOperation::ExtendVolume {
                    volume_id: "vol-1".to_string(),
                    new_capacity_bytes: -1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::InvalidArgument(_)));
        assert_eq!(executor.locks().held_count(), 0);
        assert_eq!(backend.submission_count(), 0);

        services.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_unstorable_instance_name_before_submit() {
        let backend = Arc::new(InMemoryBackend::default());
        let store = Arc::new(InMemoryRecordStore::new());
        let services =
            ExecutorServices::start(test_config(), backend.clone(), store.clone(), None)
                .await
                .unwrap();
        let executor = services.executor();

        let err = executor
            .execute(
                "pvc-1",
                "a/b",
                VolumeOperation::CreateVolume {
                    name: "pvc-1".to_string(),
                    capacity_bytes: 1 << 30,
                    parameters: HashMap::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::InvalidArgument(_)));
        assert_eq!(backend.submission_count(), 0);
        assert_eq!(executor.registry().count(), 0);
        assert!(store.is_empty());

        services.shutdown().await;
    }
}
