// Cache Manager
// Per-key exclusive leases over a cache store

use crate::cache::store::{CacheKey, CacheStore};

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = Arc<DashMap<PathBuf, Arc<Mutex<()>>>>;

/// Serialises writers per cache location and recovers from unreadable entries.
///
/// Locks are keyed by the on-disk location of an entry rather than the key
/// itself, and a lock is dropped from the table once nobody holds or waits
/// for it.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    locks: LockTable,
    scratch_root: PathBuf,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            locks: Arc::new(DashMap::new()),
            scratch_root: std::env::temp_dir().join("relay-cache-scratch"),
        }
    }

    /// Directory used when the store cannot even reset an entry
    pub fn with_scratch_root(mut self, root: impl AsRef<Path>) -> Self {
        self.scratch_root = root.as_ref().to_path_buf();
        self
    }

    /// Take the exclusive lease for `key`, waiting for any current holder.
    ///
    /// A read failure never fails the job: the entry is reset, or failing
    /// that a scratch directory is handed out, and a warning is logged.
    pub async fn lease(&self, key: &CacheKey) -> CacheLease {
        let lock_path = key.relative_path();
        let lock = self
            .locks
            .entry(lock_path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;

        let (location, fallback) = match self.store.get(key).await {
            Ok(location) => (location, false),
            Err(error) => {
                tracing::warn!(cache_key = %key, %error, "cache read failed, starting from an empty cache");
                (self.fallback_location(key).await, true)
            }
        };

        CacheLease {
            key: key.clone(),
            location,
            fallback,
            store: self.store.clone(),
            locks: self.locks.clone(),
            lock_path,
            _guard: guard,
        }
    }

    async fn fallback_location(&self, key: &CacheKey) -> PathBuf {
        match self.store.reset(key).await {
            Ok(location) => location,
            Err(error) => {
                tracing::warn!(cache_key = %key, %error, "cache reset failed, using scratch directory");
                let scratch = self.scratch_root.join(key.relative_path());
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                if let Err(error) = tokio::fs::create_dir_all(&scratch).await {
                    tracing::warn!(path = %scratch.display(), %error, "failed to create scratch cache directory");
                }
                scratch
            }
        }
    }

    /// Whether someone currently holds the lease for `key`
    pub fn is_leased(&self, key: &CacheKey) -> bool {
        self.locks
            .get(&key.relative_path())
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of locations with a live lock entry
    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive use of one cache location. The lock is released on drop.
pub struct CacheLease {
    key: CacheKey,
    location: PathBuf,
    fallback: bool,
    store: Arc<dyn CacheStore>,
    locks: LockTable,
    lock_path: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl CacheLease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// The stored entry was unreadable and this lease started empty
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Persist the entry after a successful run. Write errors are logged only.
    pub async fn commit(self) {
        if let Err(error) = self.store.put(&self.key, &self.location).await {
            tracing::warn!(cache_key = %self.key, %error, "failed to write cache entry");
        }
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        // One reference is the table's, one is our guard's. Anything more is a waiter.
        self.locks
            .remove_if(&self.lock_path, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{CacheError, FsCacheStore};
    use async_trait::async_trait;
    use std::time::Duration;

    fn key(job: &str) -> CacheKey {
        CacheKey::new("relay", "main", job)
    }

    #[tokio::test]
    async fn test_same_key_is_serialised() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CacheManager::new(Arc::new(FsCacheStore::new(dir.path()))));

        let first = manager.lease(&key("build")).await;
        assert!(manager.is_leased(&key("build")));

        let contender = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.lease(&key("build")).await.location().to_path_buf() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        let location = first.location().to_path_buf();
        first.commit().await;

        let second = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, location);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(Arc::new(FsCacheStore::new(dir.path())));

        let _build = manager.lease(&key("build")).await;
        let audit = tokio::time::timeout(Duration::from_secs(1), manager.lease(&key("audit"))).await;
        assert!(audit.is_ok());
    }

    #[tokio::test]
    async fn test_corrupted_entry_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsCacheStore::new(dir.path()));
        let manager = CacheManager::new(store.clone());

        let lease = manager.lease(&key("build")).await;
        tokio::fs::write(lease.location().join("stale"), b"x").await.unwrap();
        lease.commit().await;

        let marker = dir.path().join(key("build").relative_path()).join("entry.json");
        std::fs::write(marker, "garbage").unwrap();

        let lease = manager.lease(&key("build")).await;
        assert!(lease.is_fallback());
        assert!(lease.location().is_dir());
        assert!(!lease.location().join("stale").exists());

        // Committing repairs the entry
        lease.commit().await;
        assert!(!manager.lease(&key("build")).await.is_fallback());
    }

    #[tokio::test]
    async fn test_keys_with_matching_slugs_do_not_share_a_lease() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(Arc::new(FsCacheStore::new(dir.path())));

        let underscore = manager.lease(&key("build_a")).await;
        tokio::fs::write(underscore.location().join("artifact"), b"underscore")
            .await
            .unwrap();

        let dash = tokio::time::timeout(Duration::from_secs(1), manager.lease(&key("build-a")))
            .await
            .unwrap();
        assert_ne!(underscore.location(), dash.location());
        assert!(!dash.is_fallback());
        assert!(!dash.location().join("artifact").exists());

        underscore.commit().await;
        dash.commit().await;

        let again = manager.lease(&key("build_a")).await;
        assert!(!again.is_fallback());
        assert_eq!(
            tokio::fs::read(again.location().join("artifact")).await.unwrap(),
            b"underscore"
        );
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CacheManager::new(Arc::new(FsCacheStore::new(dir.path()))));

        for job in ["build", "audit", "test"] {
            manager.lease(&key(job)).await.commit().await;
        }
        drop(manager.lease(&key("lint")).await);
        assert_eq!(manager.tracked_locks(), 0);

        let first = manager.lease(&key("build")).await;
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.lease(&key("build")).await.commit().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The waiter keeps the entry alive when the holder lets go
        drop(first);
        assert_eq!(manager.tracked_locks(), 1);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.tracked_locks(), 0);
        assert!(!manager.is_leased(&key("build")));
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
            Err(CacheError::Corrupted {
                path: key.relative_path(),
                reason: "unreadable".to_string(),
            })
        }

        async fn put(&self, _key: &CacheKey, _location: &Path) -> Result<(), CacheError> {
            Err(CacheError::Io(std::io::Error::other("read-only")))
        }

        async fn reset(&self, _key: &CacheKey) -> Result<PathBuf, CacheError> {
            Err(CacheError::Io(std::io::Error::other("read-only")))
        }
    }

    #[tokio::test]
    async fn test_broken_store_uses_scratch_and_swallows_write_errors() {
        let scratch = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(Arc::new(BrokenStore)).with_scratch_root(scratch.path());

        let lease = manager.lease(&key("build")).await;
        assert!(lease.is_fallback());
        assert!(lease.location().starts_with(scratch.path()));
        assert!(lease.location().is_dir());

        lease.commit().await;
        assert!(!manager.is_leased(&key("build")));
    }
}
