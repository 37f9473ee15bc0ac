//! Prometheus metrics for the volume operation executor
//!
//! Provides metrics for monitoring volume operations, per-volume lock
//! contention, the task dispatcher, and idempotency record maintenance.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of volume operations by type and status
    pub const VOLUME_OPERATIONS_TOTAL: &str = "volume_operations_total";
    /// Histogram: Duration of volume operations in seconds
    pub const VOLUME_OPERATION_DURATION_SECONDS: &str = "volume_operation_duration_seconds";
    /// Counter: Operations rejected because the volume was already busy
    pub const LOCK_CONFLICTS_TOTAL: &str = "volume_lock_conflicts_total";
    /// Counter: Operations answered from the idempotency record without resubmission
    pub const REPLAYED_OPERATIONS_TOTAL: &str = "volume_replayed_operations_total";
    /// Gauge: Tasks currently tracked by the task registry
    pub const PENDING_TASKS: &str = "volume_pending_tasks";
    /// Counter: Dispatcher batched status queries by result
    pub const DISPATCHER_POLLS_TOTAL: &str = "volume_dispatcher_polls_total";
    /// Counter: Task outcomes handled by the dispatcher by delivery result
    pub const TASK_RESOLUTIONS_TOTAL: &str = "volume_task_resolutions_total";
    /// Counter: Abandoned tasks purged after their grace period
    pub const ABANDONED_TASKS_PURGED_TOTAL: &str = "volume_abandoned_tasks_purged_total";
    /// Counter: Idempotency records removed by cleanup
    pub const RECORDS_CLEANED_TOTAL: &str = "volume_records_cleaned_total";
    /// Counter: Number of retried calls
    pub const RETRIES_TOTAL: &str = "volume_retries_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a volume operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::VOLUME_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::VOLUME_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record an operation rejected by the per-volume lock
pub fn record_lock_conflict(operation: &str) {
    counter!(names::LOCK_CONFLICTS_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record an operation answered from its idempotency record
pub fn record_replay(operation: &str) {
    counter!(names::REPLAYED_OPERATIONS_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Set the number of tasks in the registry
pub fn set_pending_tasks(count: usize) {
    gauge!(names::PENDING_TASKS).set(count as f64);
}

/// Record one batched status query
pub fn record_poll(status: &str) {
    counter!(names::DISPATCHER_POLLS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record how a finished task was handled
pub fn record_resolution(delivery: &str) {
    counter!(names::TASK_RESOLUTIONS_TOTAL, "delivery" => delivery.to_string()).increment(1);
}

/// Record abandoned tasks removed by the purge pass
pub fn record_abandoned_purged(count: usize) {
    counter!(names::ABANDONED_TASKS_PURGED_TOTAL).increment(count as u64);
}

/// Record idempotency records removed by cleanup
pub fn record_records_cleaned(count: usize) {
    counter!(names::RECORDS_CLEANED_TOTAL).increment(count as u64);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::new("create_volume");
        std::thread::sleep(std::time::Duration::from_millis(10));
        // No recorder is installed in tests; recording must still be a no-op
        timer.failure("lock_conflict");
    }

    #[test]
    fn test_helpers_without_recorder() {
        set_pending_tasks(3);
        record_poll("success");
        record_resolution("delivered");
        record_abandoned_purged(0);
        record_lock_conflict("create_volume");
    }
}
