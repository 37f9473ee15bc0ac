//! Per-volume operation locks.
//!
//! A volume key present in the set means an operation is in progress for that
//! volume. Acquisition is a test-and-set under a short-lived mutex and never
//! waits for the current holder: a busy volume is reported back to the caller,
//! which owns its own retry and timeout policy.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Registry of volumes with an operation in progress.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    locks: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    // The set is valid after every critical section, so a poisoned mutex
    // still guards consistent data.
    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `volume_key`. Returns `false` immediately if it is already held.
    pub fn try_acquire(&self, volume_key: &str) -> bool {
        self.held().insert(volume_key.to_string())
    }

    /// Release `volume_key`. Releasing a key that is not held is a no-op.
    pub fn release(&self, volume_key: &str) {
        self.held().remove(volume_key);
    }

    /// Claim `volume_key` and return a guard that releases it on drop.
    pub fn try_lock(self: &Arc<Self>, volume_key: &str) -> Option<VolumeLockGuard> {
        if !self.try_acquire(volume_key) {
            return None;
        }
        debug!(volume_key = %volume_key, "Acquired volume lock");
        Some(VolumeLockGuard {
            locks: Arc::clone(self),
            volume_key: volume_key.to_string(),
        })
    }

    pub fn is_held(&self, volume_key: &str) -> bool {
        self.held().contains(volume_key)
    }

    pub fn held_count(&self) -> usize {
        self.held().len()
    }
}

/// Holds a volume lock until dropped.
#[derive(Debug)]
pub struct VolumeLockGuard {
    locks: Arc<VolumeLocks>,
    volume_key: String,
}

impl VolumeLockGuard {
    pub fn volume_key(&self) -> &str {
        &self.volume_key
    }
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.volume_key);
        debug!(volume_key = %self.volume_key, "Released volume lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_try_acquire_twice() {
        let locks = VolumeLocks::new();
        assert!(locks.try_acquire("vol-123"));
        assert!(!locks.try_acquire("vol-123"));
    }

    #[test]
    fn test_release_then_acquire() {
        let locks = VolumeLocks::new();
        assert!(locks.try_acquire("vol-456"));
        locks.release("vol-456");
        assert!(locks.try_acquire("vol-456"));
    }

    #[test]
    fn test_release_unknown_key_is_noop() {
        let locks = VolumeLocks::new();
        locks.release("non-existent-vol");
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn test_multiple_volumes_independent() {
        let locks = VolumeLocks::new();
        let volumes = ["vol-1", "vol-2", "vol-3"];

        for vol in volumes {
            assert!(locks.try_acquire(vol), "first acquire of {vol}");
        }
        for vol in volumes {
            assert!(!locks.try_acquire(vol), "{vol} should be held");
        }
        for vol in volumes {
            locks.release(vol);
        }
        for vol in volumes {
            assert!(locks.try_acquire(vol), "{vol} should be free again");
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let locks = Arc::new(VolumeLocks::new());
        {
            let guard = locks.try_lock("vol-guard").unwrap();
            assert_eq!(guard.volume_key(), "vol-guard");
            assert!(locks.is_held("vol-guard"));
            assert!(locks.try_lock("vol-guard").is_none());
        }
        assert!(!locks.is_held("vol-guard"));
        assert!(locks.try_lock("vol-guard").is_some());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let locks = Arc::new(VolumeLocks::new());
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let locks = locks.clone();
                let successes = successes.clone();
                std::thread::spawn(move || {
                    if locks.try_acquire("concurrent-vol") {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_distinct_keys_all_succeed() {
        let locks = Arc::new(VolumeLocks::new());
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let locks = locks.clone();
                let successes = successes.clone();
                std::thread::spawn(move || {
                    if locks.try_acquire(&format!("vol-{i}")) {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(successes.load(Ordering::SeqCst), 100);
        assert_eq!(locks.held_count(), 100);
    }
}
