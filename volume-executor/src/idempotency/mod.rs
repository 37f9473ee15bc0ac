//! Idempotency records for volume operations.
//!
//! Each logical operation, identified by its instance name, keeps a record of
//! its submissions to the backend. The executor consults the record before
//! submitting so a repeated request is answered from history or re-attaches
//! to the task already in flight instead of creating a duplicate.
//!
//! Every write is a read-modify-write against a versioned [`RecordStore`];
//! concurrent modification is retried with backoff.

mod file;
mod memory;
mod record;
mod store;

pub use file::FileRecordStore;
pub use memory::InMemoryRecordStore;
pub use record::{
    AttemptDetails, AttemptStatus, MAX_LATEST_ATTEMPTS, OperationRecord, ResultUpdate,
};
pub use store::{RecordStore, StoreError, Versioned};
pub(crate) use store::validate_name;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendError;
use crate::backoff::{Backoff, retry_if, retry_on_error};
use crate::metrics;
use store::Result;

/// Decides whether the object that requested an operation still exists.
#[tonic::async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn owner_exists(&self, record: &OperationRecord) -> std::result::Result<bool, BackendError>;
}

/// Quota bookkeeping stored alongside an in-flight attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    pub owner: Option<String>,
    pub reserved_bytes: i64,
}

/// Versioned, conflict-retrying access to operation records.
pub struct IdempotencyStore {
    store: Arc<dyn RecordStore>,
    backoff: Backoff,
}

impl IdempotencyStore {
    /// `backoff` bounds the retries of a write that lost a version race.
    pub fn new(store: Arc<dyn RecordStore>, backoff: Backoff) -> Self {
        Self { store, backoff }
    }

    /// Wait for the underlying store to become usable.
    pub async fn bootstrap(&self, backoff: &Backoff) -> Result<()> {
        retry_on_error(backoff, "record_store_ready", || self.store.ensure_ready()).await?;
        info!("Idempotency record store ready");
        Ok(())
    }

    pub async fn load(&self, instance_name: &str) -> Result<Option<OperationRecord>> {
        Ok(self
            .store
            .get(instance_name)
            .await?
            .map(|versioned| versioned.value))
    }

    /// Append `attempt` to the record, creating the record if needed.
    pub async fn record_attempt(
        &self,
        instance_name: &str,
        attempt: AttemptDetails,
        reservation: &Reservation,
    ) -> Result<OperationRecord> {
        self.mutate(instance_name, |record| {
            if attempt.status == AttemptStatus::InProgress {
                record.reserved_bytes = reservation.reserved_bytes;
                if reservation.owner.is_some() {
                    record.owner = reservation.owner.clone();
                }
            }
            record.push_attempt(attempt.clone());
            true
        })
        .await
    }

    /// Store the terminal result of an attempt.
    ///
    /// Recording a status the attempt already has is a no-op.
    pub async fn record_result(
        &self,
        instance_name: &str,
        update: &ResultUpdate,
    ) -> Result<OperationRecord> {
        self.mutate(instance_name, |record| record.apply_result(update))
            .await
    }

    pub async fn delete(&self, instance_name: &str) -> Result<bool> {
        let deleted = self.store.delete(instance_name).await?;
        if deleted {
            debug!(instance = %instance_name, "Deleted operation record");
        }
        Ok(deleted)
    }

    /// Apply `change` with optimistic concurrency, retrying lost races.
    ///
    /// `change` returns `false` when it left the record untouched, in which
    /// case nothing is written.
    async fn mutate<F>(&self, instance_name: &str, change: F) -> Result<OperationRecord>
    where
        F: Fn(&mut OperationRecord) -> bool + Send + Sync,
    {
        let result = retry_if(
            &self.backoff,
            "record_store_write",
            || self.try_mutate(instance_name, &change),
            StoreError::is_conflict,
        )
        .await;

        match result {
            Err(e) if e.is_conflict() => {
                Err(StoreError::ConflictRetriesExhausted(instance_name.to_string()))
            }
            other => other,
        }
    }

    async fn try_mutate<F>(&self, instance_name: &str, change: &F) -> Result<OperationRecord>
    where
        F: Fn(&mut OperationRecord) -> bool + Send + Sync,
    {
        match self.store.get(instance_name).await? {
            Some(Versioned {
                resource_version,
                mut value,
            }) => {
                if change(&mut value) {
                    // A record deleted since the read is retried through the create path.
                    self.store
                        .update(&value, resource_version)
                        .await
                        .map_err(|e| match e {
                            StoreError::NotFound(name) => StoreError::Conflict(name),
                            other => other,
                        })?;
                }
                Ok(value)
            }
            None => {
                let mut record = OperationRecord::new(instance_name);
                if change(&mut record) {
                    // Losing a create race is handled like a version conflict.
                    self.store.create(&record).await?;
                }
                Ok(record)
            }
        }
    }

    /// Delete records whose owning object is gone. Returns how many were removed.
    ///
    /// Records with an attempt still in progress are kept, as are records
    /// whose owner could not be checked.
    pub async fn cleanup(&self, owners: &dyn OwnerLookup) -> Result<usize> {
        let mut removed = 0;

        for Versioned {
            resource_version,
            value: record,
        } in self.store.list().await?
        {
            let in_flight = record
                .latest_attempt()
                .is_some_and(|attempt| attempt.status == AttemptStatus::InProgress);
            if in_flight {
                continue;
            }

            match owners.owner_exists(&record).await {
                Ok(true) => {}
                Ok(false) => {
                    match self
                        .store
                        .delete_at_version(&record.instance_name, resource_version)
                        .await
                    {
                        Ok(true) => {
                            debug!(instance = %record.instance_name, "Removed orphaned operation record");
                            removed += 1;
                        }
                        Ok(false) => {}
                        Err(e) if e.is_conflict() => {
                            debug!(
                                instance = %record.instance_name,
                                "Operation record changed during cleanup, keeping record"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    warn!(
                        instance = %record.instance_name,
                        error = %e,
                        "Failed to check record owner, keeping record"
                    );
                }
            }
        }

        metrics::record_records_cleaned(removed);
        Ok(removed)
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `cancel` fires.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        owners: Arc<dyn OwnerLookup>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so cleanup starts one interval in.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Record cleanup stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        match self.cleanup(owners.as_ref()).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Cleaned up operation records"),
                            Err(e) => warn!(error = %e, "Operation record cleanup failed"),
                        }
                    }
                }
            }
        })
    }
}
