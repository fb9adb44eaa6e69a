//! # In-Process Fallback Cache
//!
//! Bounded fallback used when the networked backend is unconfigured or
//! unreachable. Enforces a total-size budget by evicting the
//! least-recently-accessed entry (ties broken by oldest creation time) until
//! a new entry fits. Never wrapped by the circuit breaker: it cannot fail the
//! way a network backend can.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{CacheEntry, CacheKey, CacheStats, ResultCache};
use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

pub struct MemoryResultCache {
    entries: Mutex<HashMap<String, StoredEntry>>,
    config: CacheConfig,
}

impl MemoryResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn total_size(entries: &HashMap<String, StoredEntry>) -> u64 {
        entries.values().map(|stored| stored.entry.size_bytes).sum()
    }

    /// Evict least-recently-accessed entries (oldest creation time breaks
    /// ties) until `incoming_bytes` fits inside the budget.
    fn evict_for(entries: &mut HashMap<String, StoredEntry>, budget: u64, incoming_bytes: u64) {
        while Self::total_size(entries) + incoming_bytes > budget {
            let victim = entries
                .iter()
                .min_by_key(|(_, stored)| {
                    (stored.entry.last_accessed_at, stored.entry.created_at)
                })
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    if let Some(evicted) = entries.remove(&key) {
                        debug!(
                            key = %key,
                            size_bytes = evicted.entry.size_bytes,
                            "Evicted cache entry for size budget"
                        );
                    }
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let artifact_path = {
            let mut entries = self.entries.lock();
            let stored = entries.get(key.as_str())?;
            if stored.expires_at <= Instant::now() {
                entries.remove(key.as_str());
                debug!(key = %key, "Cache entry expired");
                return None;
            }
            stored.entry.artifact_path.clone()
        };

        // Integrity check outside the lock; a concurrent delete racing this
        // read may resolve either way.
        if tokio::fs::metadata(&artifact_path).await.is_err() {
            warn!(
                key = %key,
                path = %artifact_path.display(),
                "Cached artifact no longer exists, evicting"
            );
            self.entries.lock().remove(key.as_str());
            return None;
        }

        let mut entries = self.entries.lock();
        let stored = entries.get_mut(key.as_str())?;
        stored.entry.touch();
        stored.expires_at = Instant::now() + self.config.default_ttl;
        Some(stored.entry.clone())
    }

    async fn set(
        &self,
        key: &CacheKey,
        artifact_path: &Path,
        metadata: HashMap<String, serde_json::Value>,
        ttl: Option<Duration>,
    ) -> bool {
        let file_meta = match tokio::fs::metadata(artifact_path).await {
            Ok(meta) if meta.len() > 0 => meta,
            Ok(_) => {
                warn!(path = %artifact_path.display(), "Refusing to cache empty artifact");
                return false;
            }
            Err(e) => {
                warn!(
                    path = %artifact_path.display(),
                    error = %e,
                    "Refusing to cache missing artifact"
                );
                return false;
            }
        };

        let size_bytes = file_meta.len();
        if size_bytes > self.config.max_size_bytes {
            warn!(
                key = %key,
                size_bytes,
                budget = self.config.max_size_bytes,
                "Artifact larger than the whole cache budget, not caching"
            );
            return false;
        }

        let mtime = file_meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let entry = CacheEntry::new(artifact_path.to_path_buf(), size_bytes, mtime, metadata);
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        let mut entries = self.entries.lock();
        entries.remove(key.as_str());
        Self::evict_for(&mut entries, self.config.max_size_bytes, size_bytes);
        entries.insert(
            key.as_str().to_string(),
            StoredEntry {
                entry,
                expires_at: Instant::now() + ttl,
            },
        );

        debug!(key = %key, size_bytes, "Cached result in-process");
        true
    }

    async fn delete(&self, key: &CacheKey) {
        self.entries.lock().remove(key.as_str());
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> u64 {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.contains(pattern));
        (before - entries.len()) as u64
    }

    async fn clear(&self) -> u64 {
        let mut entries = self.entries.lock();
        let removed = entries.len() as u64;
        entries.clear();
        if removed > 0 {
            info!(removed, "Cleared in-process cache");
        }
        removed
    }

    async fn cleanup_expired(&self) -> u64 {
        let candidates: Vec<(String, CacheEntry, Instant)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|(key, stored)| (key.clone(), stored.entry.clone(), stored.expires_at))
                .collect()
        };

        let now = Instant::now();
        let mut removed = 0;
        for (key, entry, expires_at) in candidates {
            let stale = if expires_at <= now {
                true
            } else {
                match tokio::fs::metadata(&entry.artifact_path).await {
                    Ok(meta) => {
                        let mtime = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0);
                        mtime > entry.artifact_mtime
                    }
                    Err(_) => true,
                }
            };

            if stale && self.entries.lock().remove(&key).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Cleaned up stale in-process cache entries");
        }
        removed
    }

    async fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            available: true,
            entry_count: entries.len() as u64,
            total_size_bytes: Self::total_size(&entries),
            compressed_entries: 0,
            circuit_breaker_state: None,
            circuit_breaker_failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn cache_with_budget(budget: u64) -> MemoryResultCache {
        MemoryResultCache::new(CacheConfig {
            max_size_bytes: budget,
            ..CacheConfig::default()
        })
    }

    fn write_artifact(dir: &TempDir, name: &str, bytes: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0xCD; bytes]).unwrap();
        path
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_fingerprint(name)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, "cards.pdf", 128);
        let cache = cache_with_budget(1024);

        assert!(cache.set(&key("k1"), &artifact, HashMap::new(), None).await);

        let entry = cache.get(&key("k1")).await.expect("hit");
        assert_eq!(entry.artifact_path, artifact);
        assert_eq!(entry.size_bytes, 128);
        assert_eq!(entry.access_count, 1);
    }

    #[tokio::test]
    async fn missing_artifact_is_evicted_on_get() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, "cards.pdf", 64);
        let cache = cache_with_budget(1024);

        assert!(cache.set(&key("k1"), &artifact, HashMap::new(), None).await);
        std::fs::remove_file(&artifact).unwrap();

        assert!(cache.get(&key("k1")).await.is_none());
        assert_eq!(cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn refuses_missing_or_empty_artifacts() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_budget(1024);

        let missing = dir.path().join("nope.pdf");
        assert!(!cache.set(&key("k1"), &missing, HashMap::new(), None).await);

        let empty = write_artifact(&dir, "empty.pdf", 0);
        assert!(!cache.set(&key("k2"), &empty, HashMap::new(), None).await);
    }

    #[tokio::test]
    async fn evicts_least_recently_accessed_first() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_budget(300);

        let a = write_artifact(&dir, "a.pdf", 100);
        let b = write_artifact(&dir, "b.pdf", 100);
        let c = write_artifact(&dir, "c.pdf", 100);
        let d = write_artifact(&dir, "d.pdf", 100);

        assert!(cache.set(&key("a"), &a, HashMap::new(), None).await);
        assert!(cache.set(&key("b"), &b, HashMap::new(), None).await);
        assert!(cache.set(&key("c"), &c, HashMap::new(), None).await);

        // Refresh B and C so A stays the least recently accessed.
        assert!(cache.get(&key("b")).await.is_some());
        assert!(cache.get(&key("c")).await.is_some());

        assert!(cache.set(&key("d"), &d, HashMap::new(), None).await);

        assert!(cache.get(&key("a")).await.is_none());
        assert!(cache.get(&key("b")).await.is_some());
        assert!(cache.get(&key("c")).await.is_some());
        assert!(cache.get(&key("d")).await.is_some());
    }

    #[tokio::test]
    async fn ttl_expiry_is_enforced_on_read() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, "cards.pdf", 32);
        let cache = cache_with_budget(1024);

        assert!(
            cache
                .set(
                    &key("k1"),
                    &artifact,
                    HashMap::new(),
                    Some(Duration::from_millis(20)),
                )
                .await
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&key("k1")).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_by_pattern_and_clear() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, "cards.pdf", 32);
        let cache = cache_with_budget(1024);

        assert!(cache.set(&key("user1-job1"), &artifact, HashMap::new(), None).await);
        assert!(cache.set(&key("user1-job2"), &artifact, HashMap::new(), None).await);
        assert!(cache.set(&key("user2-job1"), &artifact, HashMap::new(), None).await);

        assert_eq!(cache.invalidate_by_pattern("user1").await, 2);
        assert_eq!(cache.stats().await.entry_count, 1);

        assert_eq!(cache.clear().await, 1);
        assert_eq!(cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn stats_are_well_formed() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, "cards.pdf", 256);
        let cache = cache_with_budget(1024);

        assert!(cache.set(&key("k1"), &artifact, HashMap::new(), None).await);

        let stats = cache.stats().await;
        assert!(stats.available);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size_bytes, 256);
        assert!(stats.circuit_breaker_state.is_none());
    }
}
