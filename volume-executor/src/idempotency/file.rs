//! Directory-backed record store.
//!
//! Each record lives in `<dir>/<instance_name>.json` together with its
//! resource version. Writes use the crash-safe pattern:
//! 1. Write to `<name>.json.new` and sync
//! 2. Restrict permissions to 0600
//! 3. Rename over `<name>.json` (atomic on POSIX)
//!
//! Version checks are serialized by an in-process mutex, so one directory
//! must not be shared by several processes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::record::OperationRecord;
use super::store::{RecordStore, Result, StoreError, Versioned, validate_name};

const RECORD_EXTENSION: &str = ".json";
const PROBE_FILE: &str = ".ready-probe";

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    resource_version: u64,
    record: OperationRecord,
}

#[derive(Debug)]
pub struct FileRecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}{RECORD_EXTENSION}")))
    }

    async fn read(&self, path: &Path) -> Result<Option<StoredRecord>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, stored: &StoredRecord) -> Result<()> {
        let mut new_path = path.as_os_str().to_owned();
        new_path.push(".new");
        let new_path = PathBuf::from(new_path);

        let content = serde_json::to_string_pretty(stored)?;
        let mut file = tokio::fs::File::create(&new_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&new_path, perms).await?;
        }

        tokio::fs::rename(&new_path, path).await?;
        Ok(())
    }
}

#[tonic::async_trait]
impl RecordStore for FileRecordStore {
    async fn ensure_ready(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let probe = self.dir.join(PROBE_FILE);
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;

        debug!(dir = %self.dir.display(), "Record store ready");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Versioned<OperationRecord>>> {
        let path = self.record_path(name)?;
        Ok(self.read(&path).await?.map(|stored| Versioned {
            resource_version: stored.resource_version,
            value: stored.record,
        }))
    }

    async fn create(&self, record: &OperationRecord) -> Result<u64> {
        let path = self.record_path(&record.instance_name)?;
        let _guard = self.write_lock.lock().await;

        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists(record.instance_name.clone()));
        }
        let stored = StoredRecord {
            resource_version: 1,
            record: record.clone(),
        };
        self.write(&path, &stored).await?;
        Ok(stored.resource_version)
    }

    async fn update(&self, record: &OperationRecord, expected_version: u64) -> Result<u64> {
        let path = self.record_path(&record.instance_name)?;
        let _guard = self.write_lock.lock().await;

        let current = self
            .read(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(record.instance_name.clone()))?;
        if current.resource_version != expected_version {
            return Err(StoreError::Conflict(record.instance_name.clone()));
        }

        let stored = StoredRecord {
            resource_version: current.resource_version + 1,
            record: record.clone(),
        };
        self.write(&path, &stored).await?;
        Ok(stored.resource_version)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.record_path(name)?;
        let _guard = self.write_lock.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_at_version(&self, name: &str, expected_version: u64) -> Result<bool> {
        let path = self.record_path(name)?;
        let _guard = self.write_lock.lock().await;

        match self.read(&path).await? {
            None => Ok(false),
            Some(current) if current.resource_version != expected_version => {
                Err(StoreError::Conflict(name.to_string()))
            }
            Some(_) => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn list(&self) -> Result<Vec<Versioned<OperationRecord>>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(RECORD_EXTENSION) && !name.starts_with('.'));
            if !is_record {
                continue;
            }

            match self.read(&path).await {
                Ok(Some(stored)) => records.push(Versioned {
                    resource_version: stored.resource_version,
                    value: stored.record,
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::record::AttemptDetails;
    use crate::types::OperationKind;
    use tempfile::TempDir;

    async fn ready_store() -> (TempDir, FileRecordStore) {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::new(dir.path().join("records"));
        store.ensure_ready().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_ensure_ready_creates_dir() {
        let (_dir, store) = ready_store().await;
        assert!(store.dir().is_dir());
        assert!(!store.dir().join(PROBE_FILE).exists());
    }

    #[tokio::test]
    async fn test_round_trip_and_permissions() {
        let (_dir, store) = ready_store().await;
        let mut record = OperationRecord::new("pvc-1");
        record.push_attempt(AttemptDetails::in_progress(
            "task-1".into(),
            "memory://local",
            OperationKind::CreateVolume,
        ));

        let version = store.create(&record).await.unwrap();
        let loaded = store.get("pvc-1").await.unwrap().unwrap();
        assert_eq!(loaded.resource_version, version);
        assert_eq!(loaded.value, record);

        let path = store.dir().join("pvc-1.json");
        assert!(path.exists());
        assert!(!store.dir().join("pvc-1.json.new").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::metadata(&path).unwrap().permissions();
            assert_eq!(perms.mode() & 0o777, 0o600, "File should be 0600");
        }
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let (_dir, store) = ready_store().await;
        let mut record = OperationRecord::new("pvc-2");
        let v1 = store.create(&record).await.unwrap();

        record.capacity_bytes = 100;
        let v2 = store.update(&record, v1).await.unwrap();
        assert_eq!(v2, v1 + 1);

        assert!(matches!(
            store.update(&record, v1).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.create(&record).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let (dir, store) = ready_store().await;
        store.create(&OperationRecord::new("pvc-3")).await.unwrap();
        drop(store);

        let reopened = FileRecordStore::new(dir.path().join("records"));
        reopened.ensure_ready().await.unwrap();
        assert!(reopened.get("pvc-3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_skips_leftovers_and_garbage() {
        let (_dir, store) = ready_store().await;
        store.create(&OperationRecord::new("pvc-a")).await.unwrap();
        store.create(&OperationRecord::new("pvc-b")).await.unwrap();

        // An interrupted write leaves a .new file behind; it is not a record.
        tokio::fs::write(store.dir().join("pvc-c.json.new"), b"{}")
            .await
            .unwrap();
        tokio::fs::write(store.dir().join("broken.json"), b"not json")
            .await
            .unwrap();

        let mut names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.value.instance_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["pvc-a", "pvc-b"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, store) = ready_store().await;
        store.create(&OperationRecord::new("pvc-d")).await.unwrap();
        assert!(store.delete("pvc-d").await.unwrap());
        assert!(!store.delete("pvc-d").await.unwrap());
        assert!(store.get("pvc-d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_at_version() {
        let (_dir, store) = ready_store().await;
        let mut record = OperationRecord::new("pvc-e");
        let v1 = store.create(&record).await.unwrap();
        record.capacity_bytes = 1;
        let v2 = store.update(&record, v1).await.unwrap();

        assert!(matches!(
            store.delete_at_version("pvc-e", v1).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.get("pvc-e").await.unwrap().is_some());

        assert!(store.delete_at_version("pvc-e", v2).await.unwrap());
        assert!(!store.delete_at_version("pvc-e", v2).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (_dir, store) = ready_store().await;
        assert!(matches!(
            store.get("../escape").await,
            Err(StoreError::InvalidName(_))
        ));
    }
}
