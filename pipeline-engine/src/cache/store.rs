// Cache Store
// Persists cache entries keyed by (project, ref, job)

use crate::resolve::resolver::slugify;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode cache marker: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identity of one persisted build cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub project: String,
    pub git_ref: String,
    pub job: String,
}

impl CacheKey {
    pub fn new(project: impl Into<String>, git_ref: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            git_ref: git_ref.into(),
            job: job.into(),
        }
    }

    /// Relative location, one directory per component.
    ///
    /// Each directory is the component's slug followed by a short digest of
    /// the raw text, so keys that slugify alike still get distinct entries.
    pub fn relative_path(&self) -> PathBuf {
        [&self.project, &self.git_ref, &self.job]
            .into_iter()
            .map(|part| {
                let digest = Sha256::digest(part.as_bytes());
                let suffix = hex::encode(&digest[..4]);
                match slugify(part) {
                    slug if slug.is_empty() => format!("_-{}", suffix),
                    slug => format!("{}-{}", slug, suffix),
                }
            })
            .collect()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.project, self.git_ref, self.job)
    }
}

/// Backing store for cache entries
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Location holding the entry's contents, created if absent
    async fn get(&self, key: &CacheKey) -> Result<PathBuf, CacheError>;

    /// Record that `location` holds a complete entry for `key`
    async fn put(&self, key: &CacheKey, location: &Path) -> Result<(), CacheError>;

    /// Drop whatever the entry holds and return an empty location
    async fn reset(&self, key: &CacheKey) -> Result<PathBuf, CacheError>;
}

/// Marker written next to each entry's data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMarker {
    key: CacheKey,
    updated_at: DateTime<Utc>,
    runs: u64,
}

const MARKER_FILE: &str = "entry.json";
const DATA_DIR: &str = "data";

/// Cache entries as directories under a root
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    async fn read_marker(&self, key: &CacheKey) -> Result<Option<EntryMarker>, CacheError> {
        let path = self.entry_dir(key).join(MARKER_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let marker: EntryMarker =
            serde_json::from_str(&content).map_err(|e| CacheError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if &marker.key != key {
            return Err(CacheError::Corrupted {
                path,
                reason: format!("marker belongs to {}", marker.key),
            });
        }
        Ok(Some(marker))
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        let data = self.entry_dir(key).join(DATA_DIR);
        let marker = self.read_marker(key).await?;

        if marker.is_some() && !data.is_dir() {
            return Err(CacheError::Corrupted {
                path: data,
                reason: "data directory is missing".to_string(),
            });
        }

        tokio::fs::create_dir_all(&data).await?;
        Ok(data)
    }

    async fn put(&self, key: &CacheKey, location: &Path) -> Result<(), CacheError> {
        let entry = self.entry_dir(key);
        if !location.starts_with(&entry) {
            return Err(CacheError::Corrupted {
                path: location.to_path_buf(),
                reason: format!("location is outside the entry for {}", key),
            });
        }

        // A corrupted previous marker only loses the run counter
        let runs = match self.read_marker(key).await {
            Ok(Some(marker)) => marker.runs,
            _ => 0,
        };
        let marker = EntryMarker {
            key: key.clone(),
            updated_at: Utc::now(),
            runs: runs + 1,
        };

        let tmp = entry.join(format!("{}.tmp", MARKER_FILE));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&marker)?).await?;
        tokio::fs::rename(&tmp, entry.join(MARKER_FILE)).await?;
        Ok(())
    }

    async fn reset(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        let entry = self.entry_dir(key);
        match tokio::fs::remove_dir_all(&entry).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let data = entry.join(DATA_DIR);
        tokio::fs::create_dir_all(&data).await?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new("relay", "feature/Remote_Build", "cargo_remote_build")
    }

    #[test]
    fn test_relative_path_is_sanitised() {
        let path = key().relative_path();
        let parts: Vec<_> = path.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("relay-"));
        assert!(parts[1].starts_with("feature-remote-build-"));
        assert!(parts[2].starts_with("cargo-remote-build-"));

        let dotted = CacheKey::new("p", "../..", "j").relative_path();
        assert!(dotted.components().all(|c| matches!(c, std::path::Component::Normal(_))));
        assert!(dotted.iter().nth(1).unwrap().to_string_lossy().starts_with("_-"));
    }

    #[test]
    fn test_keys_that_slugify_alike_get_distinct_paths() {
        let pairs = [
            (CacheKey::new("relay", "main", "build_a"), CacheKey::new("relay", "main", "build-a")),
            (CacheKey::new("relay", "Main", "build"), CacheKey::new("relay", "main", "build")),
            (CacheKey::new("relay", "feature/x", "build"), CacheKey::new("relay", "feature-x", "build")),
        ];
        for (a, b) in pairs {
            assert_ne!(a.relative_path(), b.relative_path(), "{} vs {}", a, b);
        }
        assert_eq!(key().relative_path(), key().relative_path());
    }

    #[tokio::test]
    async fn test_colliding_slugs_keep_separate_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path());
        let underscore = CacheKey::new("relay", "main", "build_a");
        let dash = CacheKey::new("relay", "main", "build-a");

        let first = store.get(&underscore).await.unwrap();
        tokio::fs::write(first.join("artifact"), b"a").await.unwrap();
        store.put(&underscore, &first).await.unwrap();

        let second = store.get(&dash).await.unwrap();
        assert_ne!(first, second);
        store.put(&dash, &second).await.unwrap();

        let again = store.get(&underscore).await.unwrap();
        assert_eq!(tokio::fs::read(again.join("artifact")).await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_get_put_roundtrip_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path());

        let location = store.get(&key()).await.unwrap();
        tokio::fs::write(location.join("artifact"), b"built").await.unwrap();
        store.put(&key(), &location).await.unwrap();
        store.put(&key(), &location).await.unwrap();

        let again = store.get(&key()).await.unwrap();
        assert_eq!(again, location);
        assert_eq!(tokio::fs::read(again.join("artifact")).await.unwrap(), b"built");

        let marker = store.read_marker(&key()).await.unwrap().unwrap();
        assert_eq!(marker.runs, 2);
    }

    #[tokio::test]
    async fn test_garbage_marker_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path());

        let location = store.get(&key()).await.unwrap();
        store.put(&key(), &location).await.unwrap();
        let marker = dir.path().join(key().relative_path()).join(MARKER_FILE);
        std::fs::write(&marker, "{ not json").unwrap();

        assert!(matches!(
            store.get(&key()).await,
            Err(CacheError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_empties_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path());

        let location = store.get(&key()).await.unwrap();
        tokio::fs::write(location.join("stale"), b"x").await.unwrap();

        let fresh = store.reset(&key()).await.unwrap();
        assert!(fresh.is_dir());
        assert!(!fresh.join("stale").exists());
    }

    #[tokio::test]
    async fn test_put_outside_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path());
        assert!(store.put(&key(), Path::new("/tmp/elsewhere")).await.is_err());
    }
}
