//! Volume Operation Executor soak harness
//!
//! Drives concurrent volume operations through the executor against the
//! in-memory simulated backend, with idempotency records kept on disk.
//! Workers deliberately share volume keys so lock conflicts, replays and
//! abandoned waits all occur under load.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

use volume_executor::backend::InMemoryBackendOptions;
use volume_executor::idempotency::OwnerLookup;
use volume_executor::{
    ExecuteError, ExecutorConfig, ExecutorServices, FileRecordStore, InMemoryBackend,
    VolumeOperation, VolumeOperationExecutor,
};

const GIB: i64 = 1 << 30;
const MIB: i64 = 1 << 20;

/// CLI arguments for the soak harness
#[derive(Parser, Debug)]
#[command(name = "volume-executor")]
#[command(about = "Soak test harness for the volume operation executor")]
struct Args {
    /// How long to run, in seconds
    #[arg(long, default_value = "30")]
    duration_secs: u64,

    /// Number of concurrent workers
    #[arg(long, default_value = "16")]
    workers: usize,

    /// Number of distinct volume keys shared by the workers
    #[arg(long, default_value = "4")]
    volumes: usize,

    /// Directory for idempotency records
    #[arg(
        long,
        env = "VOLUME_EXECUTOR_RECORD_DIR",
        default_value = "/tmp/volume-executor/records"
    )]
    record_dir: PathBuf,

    /// Simulated backend task latency in milliseconds
    #[arg(long, default_value = "50")]
    task_latency_ms: u64,

    /// Executor configuration file (JSON); flags below override it
    #[arg(long, env = "VOLUME_EXECUTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Dispatcher poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Maximum task references per status query
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seconds a caller waits for its task before abandoning it
    #[arg(long)]
    operation_timeout_secs: Option<u64>,

    /// Prometheus metrics listen address (disabled if not set)
    #[arg(long, env = "VOLUME_EXECUTOR_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default)]
struct SoakStats {
    succeeded: AtomicU64,
    replayed: AtomicU64,
    lock_conflicts: AtomicU64,
    abandoned: AtomicU64,
    failed: AtomicU64,
}

impl SoakStats {
    fn record(&self, result: &Result<volume_executor::OperationResult, ExecuteError>) {
        let counter = match result {
            Ok(outcome) if outcome.replayed => &self.replayed,
            Ok(_) => &self.succeeded,
            Err(ExecuteError::LockConflict(_)) => &self.lock_conflicts,
            Err(ExecuteError::Cancelled(_) | ExecuteError::Timeout { .. }) => &self.abandoned,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(addr) = args.metrics_addr {
        volume_executor::metrics::init_metrics(addr)
            .map_err(|e| format!("Failed to initialize metrics: {}", e))?;
    }

    let mut config = match &args.config {
        Some(path) => ExecutorConfig::load(path).await?,
        None => ExecutorConfig::default(),
    };
    if let Some(poll_interval_ms) = args.poll_interval_ms {
        config.dispatcher.poll_interval_ms = poll_interval_ms;
    }
    if let Some(batch_size) = args.batch_size {
        config.dispatcher.batch_size = batch_size;
    }
    if let Some(operation_timeout_secs) = args.operation_timeout_secs {
        config.operation_timeout_secs = operation_timeout_secs;
    }

    if args.workers == 0 || args.volumes == 0 {
        return Err("--workers and --volumes must be positive".into());
    }

    info!(
        workers = args.workers,
        volumes = args.volumes,
        duration_secs = args.duration_secs,
        record_dir = %args.record_dir.display(),
        task_latency_ms = args.task_latency_ms,
        "Starting volume executor soak run"
    );

    let backend = Arc::new(InMemoryBackend::new(InMemoryBackendOptions {
        task_latency: Duration::from_millis(args.task_latency_ms),
        ..Default::default()
    }));
    let store = Arc::new(FileRecordStore::new(&args.record_dir));
    let owners: Arc<dyn OwnerLookup> = backend.clone();
    let services = ExecutorServices::start(config, backend.clone(), store, Some(owners)).await?;

    let cancel = CancellationToken::new();
    let stats = Arc::new(SoakStats::default());
    let started = Instant::now();

    let mut workers = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        workers.push(tokio::spawn(run_worker(
            worker,
            args.volumes,
            services.executor(),
            Arc::clone(&stats),
            cancel.clone(),
        )));
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {
            info!("Soak duration elapsed");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping workers...");
        }
    }
    cancel.cancel();

    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker terminated abnormally");
        }
    }

    let executor = services.executor();
    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        succeeded = stats.succeeded.load(Ordering::Relaxed),
        replayed = stats.replayed.load(Ordering::Relaxed),
        lock_conflicts = stats.lock_conflicts.load(Ordering::Relaxed),
        abandoned = stats.abandoned.load(Ordering::Relaxed),
        failed = stats.failed.load(Ordering::Relaxed),
        submissions = backend.submission_count(),
        status_queries = backend.poll_count(),
        pending_tasks = executor.registry().count(),
        held_locks = executor.locks().held_count(),
        "Soak run complete"
    );

    drop(executor);
    services.shutdown().await;
    Ok(())
}

/// Cycle through the operation mix on volume slots shared with other workers.
async fn run_worker(
    worker: usize,
    volumes: usize,
    executor: Arc<VolumeOperationExecutor>,
    stats: Arc<SoakStats>,
    cancel: CancellationToken,
) {
    let node_id = format!("node-{worker}");
    // Slot to (volume id, last known capacity)
    let mut volumes_seen: HashMap<usize, (String, i64)> = HashMap::new();
    let mut iteration: u64 = 0;

    while !cancel.is_cancelled() {
        let slot = (worker + iteration as usize) % volumes;
        let volume_key = format!("pvc-soak-{slot}");

        let (instance_name, operation) = match (volumes_seen.get(&slot), iteration % 5) {
            (Some((volume_id, capacity_bytes)), 1) => {
                let new_capacity_bytes = capacity_bytes + MIB;
                (
                    format!("{volume_key}-extend-{new_capacity_bytes}"),
                    VolumeOperation::ExtendVolume {
                        volume_id: volume_id.clone(),
                        new_capacity_bytes,
                    },
                )
            }
            (Some((volume_id, _)), 2) => (
                format!("{volume_key}-snap-{worker}-{iteration}"),
                VolumeOperation::CreateSnapshot {
                    volume_id: volume_id.clone(),
                    name: format!("snap-{worker}-{iteration}"),
                },
            ),
            (Some((volume_id, _)), 3) => (
                format!("{volume_key}-{node_id}"),
                VolumeOperation::AttachVolume {
                    volume_id: volume_id.clone(),
                    node_id: node_id.clone(),
                },
            ),
            (Some((volume_id, _)), 4) => (
                format!("{volume_key}-{node_id}"),
                VolumeOperation::DetachVolume {
                    volume_id: volume_id.clone(),
                    node_id: node_id.clone(),
                },
            ),
            _ => (
                volume_key.clone(),
                VolumeOperation::CreateVolume {
                    name: volume_key.clone(),
                    capacity_bytes: GIB,
                    parameters: HashMap::new(),
                },
            ),
        };

        let result = executor
            .execute_with_cancel(&volume_key, &instance_name, operation, &cancel)
            .await;
        stats.record(&result);

        match result {
            Ok(outcome) => {
                if let Some(volume_id) = outcome.volume_id {
                    let capacity_bytes = outcome.capacity_bytes.max(GIB);
                    volumes_seen.insert(slot, (volume_id, capacity_bytes));
                }
            }
            Err(ExecuteError::LockConflict(_)) => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(e) => debug!(worker, error = %e, "Soak operation failed"),
        }
        iteration += 1;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use signal::unix::{Signal, SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    async fn recv(signal: Option<&mut Signal>) {
        match signal {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    tokio::select! {
        _ = recv(sigterm.as_mut()) => {
            info!("Received SIGTERM");
        }
        _ = recv(sigint.as_mut()) => {
            info!("Received SIGINT");
        }
    }
}
