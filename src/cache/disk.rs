//! Disk-persisted cache tier
//!
//! Layout:
//! ```text
//! {cache_dir}/
//! ├── 3f9a…e1.json      one file per key, name = SHA-256 of the key
//! ├── 77c0…4b.json
//! └── failed_models/    separate DiskCache instances live in subdirectories
//! ```
//!
//! A file's modification time is its write time. Entries older than the
//! validity window read as misses but are only deleted by [`DiskCache::clear_expired`].

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON file cache with mtime-based expiry
///
/// Every I/O or decode failure is logged and reported as a miss; callers
/// never see an error from this type.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    validity: Duration,
}

impl DiskCache {
    /// Open a cache rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>, validity: Duration) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!(dir = ?dir, error = %e, "Failed to create cache directory");
        }
        Self { dir, validity }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// File backing `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{digest}.json"))
    }

    fn is_expired(&self, modified: SystemTime) -> bool {
        // A timestamp in the future counts as freshly written
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > self.validity)
            .unwrap_or(false)
    }

    /// Read `key`, treating missing, expired and corrupt files as misses
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_with_mtime(key).await.map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), also returning the file's write time
    pub async fn get_with_mtime(&self, key: &str) -> Option<(Value, SystemTime)> {
        let path = self.path_for(key);

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Failed to stat cache file");
                return None;
            }
        };

        let modified = match metadata.modified() {
            Ok(modified) if self.is_expired(modified) => return None,
            Ok(modified) => modified,
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Cache file has no modification time");
                return None;
            }
        };

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Error reading cache file");
                return None;
            }
        };

        match serde_json::from_slice::<Value>(&content) {
            Ok(value) => Some((value, modified)),
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Corrupt cache file");
                None
            }
        }
    }

    /// Write `key` as a whole-file replace
    pub async fn set(&self, key: &str, value: &Value) {
        let path = self.path_for(key);

        let content = match serde_json::to_vec(value) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize cache value");
                return;
            }
        };

        if let Err(e) = write_replace(&path, &content).await {
            tracing::error!(path = ?path, error = %e, "Error writing cache file");
        }
    }

    pub async fn remove(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(e) = fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::error!(path = ?path, error = %e, "Error removing cache file");
        }
    }

    /// Delete every cache file in this directory
    pub async fn clear(&self) {
        for path in self.entries().await {
            if let Err(e) = fs::remove_file(&path).await {
                tracing::error!(path = ?path, error = %e, "Error clearing cache file");
            }
        }
    }

    /// Delete expired cache files, returning how many were removed
    pub async fn clear_expired(&self) -> usize {
        let mut removed = 0;
        for path in self.entries().await {
            let expired = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => self.is_expired(modified),
                Err(e) => {
                    tracing::error!(path = ?path, error = %e, "Failed to stat cache file");
                    continue;
                }
            };

            if expired {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::error!(path = ?path, error = %e, "Error clearing expired cache file")
                    }
                }
            }
        }

        tracing::debug!(dir = ?self.dir, removed, "Swept expired cache entries");
        removed
    }

    /// Total size of cache files in bytes
    pub async fn size_bytes(&self) -> u64 {
        let mut size = 0;
        for path in self.entries().await {
            if let Ok(metadata) = fs::metadata(&path).await {
                size += metadata.len();
            }
        }
        size
    }

    pub async fn item_count(&self) -> usize {
        self.entries().await.len()
    }

    /// `*.json` files directly under the cache directory (subdirectories excluded)
    async fn entries(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(dir = ?self.dir, error = %e, "Failed to list cache directory");
                return paths;
            }
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }

        paths
    }
}

/// Write to a uniquely named temp file, then rename over the target
async fn write_replace(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp = path.with_extension(format!("{}.{seq}.tmp", std::process::id()));

    fs::write(&temp, content).await?;
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(())
}
