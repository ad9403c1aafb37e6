//! Download cache for remote schemas, rule sources and catalogs
//!
//! Two tiers: a bounded `moka` map for the current process and a `cacache`
//! content store on disk shared between runs. Both are keyed by the canonical
//! URL. Expiry information travels in the cacache index entry's metadata.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, ValidationError};
use crate::http_client::Download;

/// Cache configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Cache directory path
    pub directory: PathBuf,
    /// Time-to-live for downloaded resources in hours
    pub ttl_hours: u64,
    /// Maximum number of entries in memory cache
    pub max_memory_entries: u64,
    /// Memory cache TTL in seconds
    pub memory_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("label-validator"),
            ttl_hours: 24,
            max_memory_entries: 1000,
            memory_ttl_seconds: 3600,
        }
    }
}

/// What the disk tier records next to each body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResourceMetadata {
    fn for_download(url: &str, download: &Download, ttl: Duration) -> Self {
        let fetched_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24));
        Self {
            url: url.to_string(),
            fetched_at,
            expires_at: fetched_at + ttl,
            etag: download.etag.clone(),
            last_modified: download.last_modified.clone(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// A remote resource body together with its metadata
#[derive(Debug, Clone)]
pub struct CachedResource {
    pub data: Arc<Vec<u8>>,
    pub metadata: ResourceMetadata,
}

/// Outcome of [`ResourceCache::prune_expired`]
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub removed: u64,
    pub freed_bytes: u64,
    pub errors: Vec<String>,
}

fn cache_error(action: &str, err: impl std::fmt::Display) -> ValidationError {
    ValidationError::Cache(format!("{} disk cache: {}", action, err))
}

/// Two-tier cache of downloaded resources: memory first, then disk
pub struct ResourceCache {
    memory: Cache<String, Arc<CachedResource>>,
    directory: PathBuf,
    ttl: Duration,
}

impl ResourceCache {
    pub fn new(config: CacheConfig) -> Self {
        let memory = Cache::builder()
            .max_capacity(config.max_memory_entries)
            .time_to_live(Duration::from_secs(config.memory_ttl_seconds))
            .build();

        Self {
            memory,
            directory: config.directory,
            ttl: Duration::from_secs(config.ttl_hours * 3600),
        }
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    /// Fresh copy of `url`, if either tier has one. Expired disk entries are
    /// dropped on sight.
    pub fn get(&self, url: &str) -> Result<Option<Arc<CachedResource>>> {
        if let Some(resource) = self.memory.get(url) {
            debug!(%url, "memory cache hit");
            return Ok(Some(resource));
        }

        let Some(metadata) = self.disk_metadata(url)? else {
            return Ok(None);
        };
        if metadata.is_expired() {
            debug!(%url, expired_at = %metadata.expires_at, "disk cache entry expired");
            self.remove(url)?;
            return Ok(None);
        }

        let data = match cacache::read_sync(&self.directory, url) {
            Ok(data) => data,
            Err(cacache::Error::EntryNotFound(_, _)) => return Ok(None),
            Err(e) => return Err(cache_error("read from", e)),
        };
        debug!(%url, bytes = data.len(), "disk cache hit");

        let resource = Arc::new(CachedResource {
            data: Arc::new(data),
            metadata,
        });
        self.memory.insert(url.to_string(), resource.clone());
        Ok(Some(resource))
    }

    /// Record a fresh download of `url` in both tiers.
    pub fn store(&self, url: &str, download: Download) -> Result<Arc<CachedResource>> {
        let metadata = ResourceMetadata::for_download(url, &download, self.ttl);
        let recorded = serde_json::to_value(&metadata).map_err(|e| cache_error("encode", e))?;

        let mut writer = cacache::WriteOpts::new()
            .size(download.data.len())
            .metadata(recorded)
            .open_sync(&self.directory, url)
            .map_err(|e| cache_error("open", e))?;
        writer
            .write_all(&download.data)
            .map_err(|e| cache_error("write to", e))?;
        writer.commit().map_err(|e| cache_error("commit to", e))?;

        let resource = Arc::new(CachedResource {
            data: Arc::new(download.data),
            metadata,
        });
        self.memory.insert(url.to_string(), resource.clone());
        Ok(resource)
    }

    pub fn remove(&self, url: &str) -> Result<()> {
        self.memory.invalidate(url);
        cacache::remove_sync(&self.directory, url).map_err(|e| cache_error("remove from", e))
    }

    pub fn contains(&self, url: &str) -> Result<bool> {
        if self.memory.contains_key(url) {
            return Ok(true);
        }
        Ok(self.disk_metadata(url)?.is_some_and(|m| !m.is_expired()))
    }

    /// Delete expired disk entries. Memory entries age out on their own.
    pub fn prune_expired(&self) -> PruneReport {
        let mut report = PruneReport::default();
        for entry in cacache::index::ls(&self.directory) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.errors.push(format!("unreadable index entry: {}", e));
                    continue;
                }
            };
            let expired = serde_json::from_value::<ResourceMetadata>(entry.metadata.clone())
                .map(|m| m.is_expired())
                .unwrap_or(true);
            if !expired {
                continue;
            }
            match self.remove(&entry.key) {
                Ok(()) => {
                    report.removed += 1;
                    report.freed_bytes += entry.size as u64;
                }
                Err(e) => report.errors.push(format!("{}: {}", entry.key, e)),
            }
        }
        if report.removed > 0 {
            debug!(removed = report.removed, bytes = report.freed_bytes, "pruned disk cache");
        }
        report
    }

    fn disk_metadata(&self, url: &str) -> Result<Option<ResourceMetadata>> {
        let Some(entry) =
            cacache::metadata_sync(&self.directory, url).map_err(|e| cache_error("index", e))?
        else {
            return Ok(None);
        };
        match serde_json::from_value(entry.metadata) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!(%url, error = %e, "discarding disk cache entry with unreadable metadata");
                Ok(None)
            }
        }
    }
}
