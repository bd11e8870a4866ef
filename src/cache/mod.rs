//! Two-tier response cache
//!
//! Provides:
//! - Deterministic request signatures ([`cache_key`])
//! - An in-process LRU tier ([`MemoryCache`])
//! - A disk tier with mtime-based expiry ([`DiskCache`])
//! - [`ResponseCache`], which reads memory then disk and writes both
//!
//! The disk tier is authoritative. The memory tier only accelerates reads
//! within one process.

pub mod disk;
pub mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Get the default cache directory
///
/// Checks in order:
/// 1. `$MODEL_SCOUT_CACHE_DIR`
/// 2. `$XDG_CACHE_HOME/model-scout`
/// 3. the platform cache directory (`~/.cache/model-scout` on Linux)
/// 4. `.model_scout_cache` in the working directory
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MODEL_SCOUT_CACHE_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("model-scout");
    }

    dirs::cache_dir()
        .map(|d| d.join("model-scout"))
        .unwrap_or_else(|| PathBuf::from(".model_scout_cache"))
}

/// Recursively sort object keys so logically equal values serialize identically
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Digest of `(method, url, params, body)`
///
/// Object keys are sorted before hashing, so parameter order never changes
/// the key. The method is upper-cased.
pub fn cache_key(method: &str, url: &str, params: &Value, body: &Value) -> String {
    let signature = Value::Array(vec![
        Value::String(method.to_ascii_uppercase()),
        Value::String(url.to_string()),
        canonicalize(params),
        canonicalize(body),
    ]);
    hex::encode(Sha256::digest(signature.to_string().as_bytes()))
}

#[derive(Clone)]
struct MemoryEntry {
    value: Value,
    written_at: SystemTime,
}

/// Memory LRU in front of a disk cache
pub struct ResponseCache {
    memory: MemoryCache<MemoryEntry>,
    disk: DiskCache,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, validity: Duration, memory_capacity: usize) -> Self {
        let disk = DiskCache::new(dir, validity);
        tracing::debug!(
            dir = ?disk.dir(),
            validity_secs = validity.as_secs(),
            memory_capacity,
            "Initialized response cache"
        );

        Self {
            memory: MemoryCache::new(memory_capacity),
            disk,
        }
    }

    pub fn dir(&self) -> &Path {
        self.disk.dir()
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    fn is_fresh(&self, entry: &MemoryEntry) -> bool {
        SystemTime::now()
            .duration_since(entry.written_at)
            .map(|age| age <= self.disk.validity())
            .unwrap_or(true)
    }

    /// Look up `key` in memory, then on disk
    ///
    /// Disk hits are promoted into the memory tier, keeping the file's
    /// write time so both tiers expire together.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.memory.get(key) {
            if self.is_fresh(&entry) {
                return Some(entry.value);
            }
            self.memory.remove(key);
        }

        let (value, written_at) = self.disk.get_with_mtime(key).await?;
        self.memory.put(
            key,
            MemoryEntry {
                value: value.clone(),
                written_at,
            },
        );
        Some(value)
    }

    /// Like [`get`](Self::get), returning `default` on a miss
    pub async fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).await.unwrap_or(default)
    }

    /// Typed lookup; a value that does not decode as `T` is a miss
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                tracing::error!(error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Write `value` to both tiers
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize cache value");
                return;
            }
        };

        self.memory.put(
            key,
            MemoryEntry {
                value: value.clone(),
                written_at: SystemTime::now(),
            },
        );
        self.disk.set(key, &value).await;
    }

    pub async fn remove(&self, key: &str) {
        self.memory.remove(key);
        self.disk.remove(key).await;
    }

    pub async fn clear(&self) {
        self.memory.clear();
        self.disk.clear().await;
    }

    /// Sweep expired disk entries
    pub async fn clear_expired(&self) -> usize {
        self.disk.clear_expired().await
    }

    pub async fn size_bytes(&self) -> u64 {
        self.disk.size_bytes().await
    }

    pub async fn item_count(&self) -> usize {
        self.disk.item_count().await
    }
}
