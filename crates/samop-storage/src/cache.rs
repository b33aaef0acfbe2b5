//! Short-TTL per-partition result cache.
//!
//! Backends report errors; [`PartitionCache`] swallows them so a broken cache only
//! ever costs a network call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use samop_core::{PartitionSuccess, ResolvedParams};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const PARTITION_CACHE_TTL: Duration = Duration::from_secs(900);

const KEY_PREFIX: &str = "sam_opps";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("cache backend: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError>;
    async fn put(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError>;
    async fn forget(&self, key: &str) -> Result<bool, CacheError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    expires_at: DateTime<Utc>,
    value: JsonValue,
}

/// Process-local backend. Last write wins under concurrent writers.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Utc::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Also drops every expired entry; keys roll over with the date window so
    /// stale ones are rarely read again.
    async fn put(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = expiry_from_now(ttl)?;
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(key.to_string(), MemoryEntry { expires_at, value });
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileCacheRecord {
    expires_at: DateTime<Utc>,
    value: JsonValue,
}

/// One JSON file per key, written with a temp-file rename so readers never see
/// a partial entry.
#[derive(Debug, Clone)]
pub struct FileCacheBackend {
    root: PathBuf,
}

impl FileCacheBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect::<String>();
        self.root.join(format!("{file}.json"))
    }
}

#[async_trait]
impl CacheBackend for FileCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: FileCacheRecord = serde_json::from_slice(&bytes)?;
        if record.expires_at <= Utc::now() {
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    async fn put(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).await?;
        let record = FileCacheRecord {
            expires_at: expiry_from_now(ttl)?,
            value,
        };
        let bytes = serde_json::to_vec(&record)?;
        let path = self.path_for(key);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<bool, CacheError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn expiry_from_now(ttl: Duration) -> Result<DateTime<Utc>, CacheError> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| CacheError::Backend(e.to_string()))?;
    Ok(Utc::now() + ttl)
}

/// Partition-keyed view over a [`CacheBackend`].
#[derive(Clone)]
pub struct PartitionCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl PartitionCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            ttl: PARTITION_CACHE_TTL,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()))
    }

    /// Key over the partition plus only those parameters that change what the
    /// API returns. Limit, keywords and cache control are excluded.
    pub fn cache_key(partition: &str, params: &ResolvedParams) -> String {
        let material = format!(
            "place={}|days_back={}|ptype={}|from={}|to={}|set_aside={}",
            params.place.as_deref().unwrap_or(""),
            params.days_back,
            params.notice_type_codes.join(","),
            params.posted_from.format("%Y-%m-%d"),
            params.posted_to.format("%Y-%m-%d"),
            params.set_aside_codes.join(","),
        );
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{KEY_PREFIX}:{partition}:{}", &digest[..32])
    }

    pub async fn get(&self, partition: &str, params: &ResolvedParams) -> Option<PartitionSuccess> {
        let key = Self::cache_key(partition, params);
        let value = match self.backend.get(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                warn!(partition, error = %err, "cache read failed; treating as miss");
                return None;
            }
        };
        match serde_json::from_value::<PartitionSuccess>(value) {
            Ok(mut entry) => {
                entry.cached = true;
                debug!(partition, count = entry.count, "cache hit");
                Some(entry)
            }
            Err(err) => {
                warn!(partition, error = %err, "cache entry undecodable; treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, partition: &str, params: &ResolvedParams, result: &PartitionSuccess) -> bool {
        let key = Self::cache_key(partition, params);
        let stored = PartitionSuccess {
            cached: false,
            ..result.clone()
        };
        let outcome = match serde_json::to_value(&stored) {
            Ok(value) => self.backend.put(&key, value, self.ttl).await,
            Err(err) => Err(CacheError::from(err)),
        };
        match outcome {
            Ok(()) => true,
            Err(err) => {
                warn!(partition, error = %err, "cache write failed");
                false
            }
        }
    }

    pub async fn forget(&self, partition: &str, params: &ResolvedParams) -> bool {
        let key = Self::cache_key(partition, params);
        match self.backend.forget(&key).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(partition, error = %err, "cache invalidation failed");
                false
            }
        }
    }
}
