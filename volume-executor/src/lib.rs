//! Volume Operation Executor Library
//!
//! Executes long-running volume operations (create, extend, snapshot, attach,
//! detach, delete) against an asynchronous storage backend.
//!
//! This library provides:
//! - Per-volume non-blocking operation locks
//! - A registry of pending backend tasks with single-delivery result conduits
//! - A background dispatcher that batches task status queries
//! - Persisted idempotency records so repeated requests are not resubmitted
//! - Bounded exponential backoff helpers shared by all backend and store calls

pub mod backend;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod fault;
pub mod idempotency;
pub mod lock;
pub mod metrics;
pub mod registry;
pub mod types;

pub use backend::{BackendError, InMemoryBackend, StorageBackend};
pub use config::{DispatcherConfig, ExecutorConfig};
pub use dispatcher::TaskDispatcher;
pub use error::{ExecuteError, StartupError};
pub use executor::{ExecutorServices, VolumeOperationExecutor};
pub use idempotency::{FileRecordStore, IdempotencyStore, InMemoryRecordStore, RecordStore};
pub use lock::VolumeLocks;
pub use registry::TaskRegistry;
pub use types::{OperationKind, OperationResult, TaskReference, VolumeOperation};
