//! Per-mount-pod mutual exclusion.
//!
//! Multiple workload mounts can legitimately share one mount pod, and their
//! mount/unmount calls must not interleave writes to that pod's source mount
//! or credential directory. [`PodLockRegistry`] hands out one async lock per
//! mount pod UID, reference-counted so entries disappear as soon as nobody
//! holds or waits for them.
//!
//! Registry bookkeeping runs under its own short-lived mutex, distinct from
//! the per-pod lock, so it never blocks on in-flight mount work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

/// Reference-counted set of per-mount-pod locks, keyed by pod UID.
///
/// Constructor-injected and owned by the mounter instance; never
/// process-global, so independent instances (e.g. in tests) do not share
/// state.
#[derive(Default)]
pub struct PodLockRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl PodLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `pod_uid`, creating it on first use.
    ///
    /// The returned guard serializes all callers using the same UID and
    /// releases its registry reference on drop.
    pub async fn lock(&self, pod_uid: &str) -> PodLockGuard<'_> {
        let lock = {
            let mut entries = self.entries.lock().expect("pod lock registry poisoned");
            let entry = entries.entry(pod_uid.to_owned()).or_insert_with(|| Entry {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };

        let guard = lock.lock_owned().await;
        PodLockGuard {
            registry: self,
            pod_uid: pod_uid.to_owned(),
            _guard: guard,
        }
    }

    fn release(&self, pod_uid: &str) {
        let mut entries = self.entries.lock().expect("pod lock registry poisoned");
        if let Some(entry) = entries.get_mut(pod_uid) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(pod_uid);
            }
        }
    }

    /// Number of live lock entries, i.e. pods with a holder or waiter.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("pod lock registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock for one mount pod. Dropping releases both the lock and its
/// registry reference.
pub struct PodLockGuard<'a> {
    registry: &'a PodLockRegistry,
    pod_uid: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for PodLockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.pod_uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn entry_removed_when_last_guard_drops() {
        let registry = PodLockRegistry::new();
        {
            let _guard = registry.lock("uid-1").await;
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn same_uid_serializes() {
        let registry = Arc::new(PodLockRegistry::new());
        let concurrent = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let concurrent = Arc::clone(&concurrent);
            tasks.push(tokio::spawn(async move {
                let _guard = registry.lock("uid-1").await;
                let level = concurrent.fetch_add(1, Ordering::SeqCst);
                assert_eq!(level, 0, "lock held by more than one task");
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn different_uids_do_not_block_each_other() {
        let registry = PodLockRegistry::new();
        let _a = registry.lock("uid-a").await;
        // Must complete immediately even while uid-a is held.
        let b = tokio::time::timeout(Duration::from_millis(100), registry.lock("uid-b"))
            .await
            .expect("lock for a different uid should not block");
        assert_eq!(registry.len(), 2);
        drop(b);
        assert_eq!(registry.len(), 1);
    }
}
