//! Background poller that resolves pending tasks.
//!
//! The dispatcher is the only party that resolves entries in the
//! [`TaskRegistry`]. Each round snapshots the registry, queries the backend in
//! batches, hands finished outcomes to their waiters, and purges abandoned
//! entries that have outlived their grace period.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::StorageBackend;
use crate::backoff::{Backoff, retry_on_error};
use crate::config::DispatcherConfig;
use crate::metrics;
use crate::registry::{Delivery, TaskRegistry};
use crate::types::{TaskOutcome, TaskReference};

/// What one poll round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// References sent to the backend
    pub queried: usize,
    /// Outcomes handed to a live waiter
    pub delivered: usize,
    /// Finished tasks whose waiter had given up
    pub abandoned_resolved: usize,
    /// Abandoned entries removed after the grace period
    pub purged: usize,
    /// Batches whose status query failed after retries
    pub failed_batches: usize,
}

pub struct TaskDispatcher {
    registry: Arc<TaskRegistry>,
    backend: Arc<dyn StorageBackend>,
    config: DispatcherConfig,
    poll_backoff: Backoff,
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        backend: Arc<dyn StorageBackend>,
        config: DispatcherConfig,
        poll_backoff: Backoff,
    ) -> Self {
        Self {
            registry,
            backend,
            config,
            poll_backoff,
        }
    }

    /// Run one poll round.
    ///
    /// A batch whose query still fails after retries leaves its tasks pending
    /// for the next round. Tasks the backend does not report stay pending.
    pub async fn poll_once(&self) -> PollSummary {
        let mut summary = PollSummary::default();

        let references: Vec<TaskReference> = self
            .registry
            .get_all()
            .into_iter()
            .map(|details| details.reference)
            .collect();

        for batch in references.chunks(self.config.batch_size.max(1)) {
            summary.queried += batch.len();

            let statuses = match retry_on_error(&self.poll_backoff, "query_tasks", || {
                self.backend.query_tasks(batch)
            })
            .await
            {
                Ok(statuses) => {
                    metrics::record_poll("success");
                    statuses
                }
                Err(e) => {
                    metrics::record_poll("failure");
                    error!(
                        batch_size = batch.len(),
                        error = %e,
                        "Task status query failed, leaving batch pending"
                    );
                    summary.failed_batches += 1;
                    continue;
                }
            };

            for status in statuses {
                let Some(outcome) = TaskOutcome::from_status(status) else {
                    continue;
                };
                let reference = outcome.reference.clone();
                let delivery = self.registry.resolve(outcome);
                metrics::record_resolution(delivery.as_str());

                match delivery {
                    Delivery::Delivered => summary.delivered += 1,
                    Delivery::Abandoned => summary.abandoned_resolved += 1,
                    Delivery::ReceiverDropped | Delivery::Unknown => {}
                }
                debug!(task = %reference, delivery = delivery.as_str(), "Resolved task");
            }
        }

        let purged = self
            .registry
            .purge_abandoned(self.config.abandon_grace_period());
        if !purged.is_empty() {
            info!(
                count = purged.len(),
                "Purged abandoned tasks past their grace period"
            );
            metrics::record_abandoned_purged(purged.len());
        }
        summary.purged = purged.len();

        summary
    }

    /// Poll every `poll_interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                poll_interval_ms = self.config.poll_interval_ms,
                batch_size = self.config.batch_size,
                "Task dispatcher started"
            );

            let mut ticker = tokio::time::interval(self.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(pending = self.registry.count(), "Task dispatcher stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if self.registry.count() == 0 {
                            continue;
                        }
                        let summary = self.poll_once().await;
                        debug!(?summary, "Dispatcher poll complete");
                    }
                }
            }
        })
    }
}
