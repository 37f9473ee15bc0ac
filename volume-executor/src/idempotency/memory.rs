//! In-process record store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::record::OperationRecord;
use super::store::{RecordStore, Result, StoreError, Versioned, validate_name};

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, Versioned<OperationRecord>>>,
    injected_conflicts: AtomicU32,
    unready_checks: AtomicU32,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Versioned<OperationRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` writes with `Conflict`.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Report not-ready for the next `count` readiness checks.
    pub fn fail_ready_checks(&self, count: u32) {
        self.unready_checks.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[tonic::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn ensure_ready(&self) -> Result<()> {
        if Self::take_one(&self.unready_checks) {
            return Err(StoreError::Io(std::io::Error::other(
                "record store not ready",
            )));
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Versioned<OperationRecord>>> {
        validate_name(name)?;
        Ok(self.records().get(name).cloned())
    }

    async fn create(&self, record: &OperationRecord) -> Result<u64> {
        validate_name(&record.instance_name)?;
        if Self::take_one(&self.injected_conflicts) {
            return Err(StoreError::AlreadyExists(record.instance_name.clone()));
        }

        let mut records = self.records();
        if records.contains_key(&record.instance_name) {
            return Err(StoreError::AlreadyExists(record.instance_name.clone()));
        }
        records.insert(
            record.instance_name.clone(),
            Versioned {
                resource_version: 1,
                value: record.clone(),
            },
        );
        Ok(1)
    }

    async fn update(&self, record: &OperationRecord, expected_version: u64) -> Result<u64> {
        if Self::take_one(&self.injected_conflicts) {
            return Err(StoreError::Conflict(record.instance_name.clone()));
        }

        let mut records = self.records();
        let stored = records
            .get_mut(&record.instance_name)
            .ok_or_else(|| StoreError::NotFound(record.instance_name.clone()))?;
        if stored.resource_version != expected_version {
            return Err(StoreError::Conflict(record.instance_name.clone()));
        }
        stored.resource_version += 1;
        stored.value = record.clone();
        Ok(stored.resource_version)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.records().remove(name).is_some())
    }

    async fn delete_at_version(&self, name: &str, expected_version: u64) -> Result<bool> {
        let mut records = self.records();
        match records.get(name) {
            None => Ok(false),
            Some(stored) if stored.resource_version != expected_version => {
                Err(StoreError::Conflict(name.to_string()))
            }
            Some(_) => Ok(records.remove(name).is_some()),
        }
    }

    async fn list(&self) -> Result<Vec<Versioned<OperationRecord>>> {
        Ok(self.records().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versioned_updates() {
        let store = InMemoryRecordStore::new();
        let mut record = OperationRecord::new("pvc-1");
        let version = store.create(&record).await.unwrap();
        assert_eq!(version, 1);
        assert!(matches!(
            store.create(&record).await,
            Err(StoreError::AlreadyExists(_))
        ));

        record.capacity_bytes = 10;
        let version = store.update(&record, version).await.unwrap();
        assert_eq!(version, 2);

        // A writer holding the old version loses
        assert!(matches!(
            store.update(&record, 1).await,
            Err(StoreError::Conflict(_))
        ));

        let stored = store.get("pvc-1").await.unwrap().unwrap();
        assert_eq!(stored.resource_version, 2);
        assert_eq!(stored.value.capacity_bytes, 10);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = InMemoryRecordStore::new();
        assert!(matches!(
            store.update(&OperationRecord::new("pvc-x"), 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = InMemoryRecordStore::new();
        store.inject_conflicts(1);
        let record = OperationRecord::new("pvc-2");
        assert!(store.create(&record).await.is_err());
        assert!(store.create(&record).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = InMemoryRecordStore::new();
        store.create(&OperationRecord::new("pvc-a")).await.unwrap();
        store.create(&OperationRecord::new("pvc-b")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        assert!(store.delete("pvc-a").await.unwrap());
        assert!(!store.delete("pvc-a").await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_at_version() {
        let store = InMemoryRecordStore::new();
        let mut record = OperationRecord::new("pvc-v");
        let v1 = store.create(&record).await.unwrap();
        record.capacity_bytes = 1;
        store.update(&record, v1).await.unwrap();

        // A stale version leaves the record in place
        assert!(matches!(
            store.delete_at_version("pvc-v", v1).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.get("pvc-v").await.unwrap().is_some());

        assert!(store.delete_at_version("pvc-v", v1 + 1).await.unwrap());
        assert!(!store.delete_at_version("pvc-v", v1 + 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_rejects_invalid_name() {
        let store = InMemoryRecordStore::new();
        assert!(matches!(
            store.get("a/b").await,
            Err(StoreError::InvalidName(_))
        ));
    }
}
