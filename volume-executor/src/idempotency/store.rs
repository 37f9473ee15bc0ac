//! Persistence seam for operation records.

use thiserror::Error;

use super::record::OperationRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("record {0} was modified concurrently")]
    Conflict(String),

    #[error("gave up updating record {0} after repeated concurrent modifications")]
    ConflictRetriesExhausted(String),

    #[error("invalid record name: {0}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::AlreadyExists(_))
    }

    /// Whether the caller may retry the whole operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(_) | StoreError::ConflictRetriesExhausted(_) | StoreError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored value and the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub resource_version: u64,
    pub value: T,
}

/// Versioned record storage with compare-and-swap updates.
#[tonic::async_trait]
pub trait RecordStore: Send + Sync {
    /// Fail until the store can serve reads and writes.
    async fn ensure_ready(&self) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<Versioned<OperationRecord>>>;

    /// Store a new record. Fails with `AlreadyExists` if one is present.
    async fn create(&self, record: &OperationRecord) -> Result<u64>;

    /// Replace a record last read at `expected_version`.
    ///
    /// Fails with `Conflict` if the stored version differs and `NotFound` if
    /// the record is gone.
    async fn update(&self, record: &OperationRecord, expected_version: u64) -> Result<u64>;

    /// Remove a record. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Remove a record only if it is still at `expected_version`.
    ///
    /// Fails with `Conflict` if the record changed since it was read and
    /// returns `false` if it is already gone.
    async fn delete_at_version(&self, name: &str, expected_version: u64) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Versioned<OperationRecord>>>;
}

/// Record names become file names, so only a conservative character set is allowed.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}
