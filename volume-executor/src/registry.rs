//! Registry of pending backend tasks.
//!
//! Every in-flight submission is tracked here from registration until the
//! dispatcher resolves it or the purge pass removes it as abandoned. All
//! accessors, including [`TaskRegistry::count`], go through the same
//! `RwLock`; the lock is only held inside these synchronous methods and never
//! across an await point.
//!
//! Each entry owns the sending half of a `oneshot` channel. Delivery removes
//! the entry and consumes the sender in the same step, so an outcome can be
//! delivered at most once. Waiters that give up only flag their entry as
//! abandoned; deletion belongs to the dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecuteError, Result};
use crate::metrics;
use crate::types::{OperationKind, TaskOutcome, TaskReference};

/// Snapshot of a pending task's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDetails {
    pub reference: TaskReference,
    pub operation: OperationKind,
    /// Set when the waiting caller gave up before the task resolved.
    pub abandoned: bool,
    pub registered_at: Instant,
}

impl TaskDetails {
    pub fn new(reference: TaskReference, operation: OperationKind) -> Self {
        Self {
            reference,
            operation,
            abandoned: false,
            registered_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

#[derive(Debug)]
struct TaskEntry {
    details: TaskDetails,
    conduit: Option<oneshot::Sender<TaskOutcome>>,
}

/// What happened to an outcome handed to [`TaskRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to a live waiter.
    Delivered,
    /// The waiter was gone without having flagged the entry; outcome dropped.
    ReceiverDropped,
    /// The entry was abandoned; removed without delivery.
    Abandoned,
    /// No entry for this reference.
    Unknown,
}

impl Delivery {
    pub fn as_str(self) -> &'static str {
        match self {
            Delivery::Delivered => "delivered",
            Delivery::ReceiverDropped => "receiver_dropped",
            Delivery::Abandoned => "abandoned",
            Delivery::Unknown => "unknown",
        }
    }
}

/// Concurrency-safe map from task reference to pending task state.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskReference, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves the map consistent, so poisoning is recoverable.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskReference, TaskEntry>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskReference, TaskEntry>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the details for `reference`.
    ///
    /// An existing entry keeps its result conduit.
    pub fn upsert(&self, reference: TaskReference, details: TaskDetails) {
        let mut tasks = self.write();
        match tasks.get_mut(&reference) {
            Some(entry) => entry.details = details,
            None => {
                tasks.insert(
                    reference,
                    TaskEntry {
                        details,
                        conduit: None,
                    },
                );
            }
        }
        metrics::set_pending_tasks(tasks.len());
    }

    pub fn get(&self, reference: &TaskReference) -> Option<TaskDetails> {
        self.read().get(reference).map(|entry| entry.details.clone())
    }

    /// Independent copy of every tracked task.
    pub fn get_all(&self) -> Vec<TaskDetails> {
        self.read()
            .values()
            .map(|entry| entry.details.clone())
            .collect()
    }

    pub fn delete(&self, reference: &TaskReference) {
        let mut tasks = self.write();
        tasks.remove(reference);
        metrics::set_pending_tasks(tasks.len());
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Track a newly submitted task and return the handle its caller waits on.
    ///
    /// Registering a reference that is already tracked replaces its conduit and
    /// clears the abandoned flag, which is how a resumed operation re-attaches
    /// to a task left behind by an earlier caller.
    pub fn register(
        self: &Arc<Self>,
        reference: TaskReference,
        operation: OperationKind,
    ) -> PendingTask {
        let (sender, receiver) = oneshot::channel();
        {
            let mut tasks = self.write();
            let replaced = tasks.insert(
                reference.clone(),
                TaskEntry {
                    details: TaskDetails::new(reference.clone(), operation),
                    conduit: Some(sender),
                },
            );
            if replaced.is_some() {
                debug!(task = %reference, "Re-registered existing task");
            }
            metrics::set_pending_tasks(tasks.len());
        }

        PendingTask {
            reference,
            receiver,
            registry: Arc::clone(self),
            settled: false,
        }
    }

    /// Flag `reference` as abandoned. Returns `false` if it is not tracked.
    pub fn mark_abandoned(&self, reference: &TaskReference) -> bool {
        match self.write().get_mut(reference) {
            Some(entry) => {
                entry.details.abandoned = true;
                entry.conduit = None;
                true
            }
            None => false,
        }
    }

    /// Remove the entry for a finished task and hand its outcome to the waiter.
    ///
    /// Never blocks and never panics: the conduit has capacity one and is
    /// consumed here, and a send to a departed receiver is simply dropped.
    pub fn resolve(&self, outcome: TaskOutcome) -> Delivery {
        let entry = {
            let mut tasks = self.write();
            let entry = tasks.remove(&outcome.reference);
            metrics::set_pending_tasks(tasks.len());
            entry
        };

        let Some(entry) = entry else {
            return Delivery::Unknown;
        };
        if entry.details.abandoned {
            debug!(task = %outcome.reference, "Purged abandoned task on completion");
            return Delivery::Abandoned;
        }
        match entry.conduit {
            Some(sender) => match sender.send(outcome) {
                Ok(()) => Delivery::Delivered,
                Err(outcome) => {
                    warn!(task = %outcome.reference, "Waiter went away before delivery");
                    Delivery::ReceiverDropped
                }
            },
            None => Delivery::ReceiverDropped,
        }
    }

    /// Remove abandoned entries registered more than `grace_period` ago.
    pub fn purge_abandoned(&self, grace_period: Duration) -> Vec<TaskReference> {
        let mut purged = Vec::new();
        let mut tasks = self.write();
        tasks.retain(|reference, entry| {
            let expired = entry.details.abandoned && entry.details.age() >= grace_period;
            if expired {
                purged.push(reference.clone());
            }
            !expired
        });
        metrics::set_pending_tasks(tasks.len());
        purged
    }
}

/// Receiving side of a registered task.
///
/// Dropping an unfinished handle flags the task abandoned, so a caller whose
/// future is cancelled never leaves a live waiter entry behind.
#[derive(Debug)]
pub struct PendingTask {
    reference: TaskReference,
    receiver: oneshot::Receiver<TaskOutcome>,
    registry: Arc<TaskRegistry>,
    settled: bool,
}

impl PendingTask {
    pub fn reference(&self) -> &TaskReference {
        &self.reference
    }

    /// Wait for the dispatcher to deliver this task's outcome.
    ///
    /// On timeout or cancellation the entry is flagged abandoned and left in
    /// the registry for the dispatcher to clean up.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let result = tokio::select! {
            received = &mut self.receiver => match received {
                Ok(outcome) => Ok(outcome),
                Err(_) => Err(ExecuteError::ConduitClosed(self.reference.clone())),
            },
            _ = tokio::time::sleep(timeout) => Err(ExecuteError::Timeout {
                reference: self.reference.clone(),
                timeout,
            }),
            _ = cancel.cancelled() => Err(ExecuteError::Cancelled(self.reference.clone())),
        };

        if let Err(ExecuteError::Timeout { .. } | ExecuteError::Cancelled(_)) = &result {
            // The outcome may have landed between the timer firing and now.
            if let Ok(outcome) = self.receiver.try_recv() {
                self.settled = true;
                return Ok(outcome);
            }
            self.abandon();
        }
        self.settled = true;
        result
    }

    fn abandon(&mut self) {
        if self.registry.mark_abandoned(&self.reference) {
            warn!(task = %self.reference, "Stopped waiting for task, marked abandoned");
        }
        self.settled = true;
    }
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        if !self.settled {
            self.abandon();
        }
    }
}
