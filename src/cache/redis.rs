//! # Networked Result Cache
//!
//! Redis-backed implementation of [`ResultCache`]. Every backend call goes
//! through the circuit breaker; any failure degrades to a miss or a no-op at
//! this boundary so cache unavailability costs performance, never
//! correctness.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{CacheEntry, CacheError, CacheKey, CacheStats, ResultCache};
use crate::config::{BackendConfig, CacheConfig};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};

pub struct RedisResultCache {
    manager: ConnectionManager,
    breaker: CircuitBreaker,
    config: CacheConfig,
}

impl RedisResultCache {
    /// Connect to the backend and probe it once. An unreachable backend is a
    /// construction-time error; the caller falls back to the in-process
    /// cache.
    pub async fn connect(
        url: &str,
        backend: &BackendConfig,
        cache: &CacheConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::backend_unavailable(format!("invalid backend url: {e}")))?;

        let manager = tokio::time::timeout(backend.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout {
                operation: "connect".to_string(),
                timeout_secs: backend.connect_timeout.as_secs(),
            })??;

        let mut conn = manager.clone();
        tokio::time::timeout(
            backend.connect_timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| CacheError::Timeout {
            operation: "ping".to_string(),
            timeout_secs: backend.connect_timeout.as_secs(),
        })??;

        info!(key_prefix = %cache.key_prefix, "Connected to cache backend");

        Ok(Self {
            manager,
            breaker: CircuitBreaker::new("cache_backend", breaker_config),
            config: cache.clone(),
        })
    }

    fn full_key(&self, key: &CacheKey) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    async fn delete_raw(&self, full_key: &str) {
        let result = self
            .breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                conn.del::<_, u64>(full_key)
                    .await
                    .map_err(CacheError::from)
            })
            .await;

        if let Err(e) = result {
            warn!(key = %full_key, error = %e, "Cache delete failed");
        }
    }

    async fn fetch_raw(&self, full_key: &str) -> Option<Vec<u8>> {
        match self
            .breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                conn.get::<_, Option<Vec<u8>>>(full_key)
                    .await
                    .map_err(CacheError::from)
            })
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache get failed, treating as miss");
                None
            }
        }
    }

    async fn store_raw(&self, full_key: &str, bytes: &[u8], ttl: Duration) -> bool {
        let result = self
            .breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                conn.set_ex::<_, _, ()>(full_key, bytes, ttl.as_secs())
                    .await
                    .map_err(CacheError::from)
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache set failed");
                false
            }
        }
    }

    async fn delete_matching(&self, pattern: String) -> u64 {
        let result = self
            .breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                let keys: Vec<String> = conn.keys(&pattern).await.map_err(CacheError::from)?;
                if keys.is_empty() {
                    return Ok(0);
                }
                conn.del::<_, u64>(&keys).await.map_err(CacheError::from)
            })
            .await;

        match result {
            Ok(removed) => removed,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Cache invalidation failed");
                0
            }
        }
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let full_key = self.full_key(key);
        let bytes = self.fetch_raw(&full_key).await?;

        let mut entry = match CacheEntry::decode(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                // Unknown version or corrupt payload: fail closed as a miss.
                warn!(key = %full_key, error = %e, "Undecodable cache entry, evicting");
                self.delete_raw(&full_key).await;
                return None;
            }
        };

        if tokio::fs::metadata(&entry.artifact_path).await.is_err() {
            warn!(
                key = %full_key,
                path = %entry.artifact_path.display(),
                "Cached artifact no longer exists, evicting"
            );
            self.delete_raw(&full_key).await;
            return None;
        }

        entry.touch();
        // Refresh the TTL with the updated bookkeeping. The hit stands even
        // if the refresh write fails.
        match entry.encode(self.config.compression_threshold) {
            Ok(encoded) => {
                self.store_raw(&full_key, &encoded, self.config.default_ttl)
                    .await;
            }
            Err(e) => warn!(key = %full_key, error = %e, "Failed to re-encode entry for TTL refresh"),
        }

        Some(entry)
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

        let mtime = file_meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let entry = CacheEntry::new(
            artifact_path.to_path_buf(),
            file_meta.len(),
            mtime,
            metadata,
        );
        let encoded = match entry.encode(self.config.compression_threshold) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode cache entry");
                return false;
            }
        };

        let full_key = self.full_key(key);
        let stored = self
            .store_raw(&full_key, &encoded, ttl.unwrap_or(self.config.default_ttl))
            .await;
        if stored {
            debug!(
                key = %full_key,
                size_bytes = entry.size_bytes,
                compressed = encoded.get(2) == Some(&1),
                "Cached result"
            );
        }
        stored
    }

    async fn delete(&self, key: &CacheKey) {
        let full_key = self.full_key(key);
        self.delete_raw(&full_key).await;
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> u64 {
        self.delete_matching(format!("{}:*{}*", self.config.key_prefix, pattern))
            .await
    }

    async fn clear(&self) -> u64 {
        let removed = self
            .delete_matching(format!("{}:*", self.config.key_prefix))
            .await;
        if removed > 0 {
            info!(removed, "Cleared cache backend entries");
        }
        removed
    }

    async fn cleanup_expired(&self) -> u64 {
        let pattern = format!("{}:*", self.config.key_prefix);
        let result = self
            .breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                let keys: Vec<String> = conn.keys(&pattern).await.map_err(CacheError::from)?;

                let mut removed = 0u64;
                for key in keys {
                    let Some(bytes) =
                        conn.get::<_, Option<Vec<u8>>>(&key).await.map_err(CacheError::from)?
                    else {
                        continue;
                    };
                    let stale = match CacheEntry::decode(&bytes) {
                        Ok(entry) => match tokio::fs::metadata(&entry.artifact_path).await {
                            Ok(meta) => {
                                let mtime = meta
                                    .modified()
                                    .ok()
                                    .and_then(|t| {
                                        t.duration_since(std::time::UNIX_EPOCH).ok()
                                    })
                                    .map(|d| d.as_secs() as i64)
                                    .unwrap_or(0);
                                mtime > entry.artifact_mtime
                            }
                            Err(_) => true,
                        },
                        Err(_) => true,
                    };
                    if stale {
                        conn.del::<_, u64>(&key).await.map_err(CacheError::from)?;
                        removed += 1;
                    }
                }
                Ok::<_, CacheError>(removed)
            })
            .await;

        match result {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "Cleaned up stale cache entries");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "Cache cleanup failed");
                0
            }
        }
    }

    async fn stats(&self) -> CacheStats {
        let snapshot = self.breaker.snapshot();
        let pattern = format!("{}:*", self.config.key_prefix);

        let result = self
            .breaker
            .call(|| async {
                let mut conn = self.manager.clone();
                let keys: Vec<String> = conn.keys(&pattern).await.map_err(CacheError::from)?;

                let mut total_size = 0u64;
                let mut compressed = 0u64;
                let mut decodable = 0u64;
                for key in &keys {
                    let Some(bytes) =
                        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(CacheError::from)?
                    else {
                        continue;
                    };
                    if let Ok(entry) = CacheEntry::decode(&bytes) {
                        decodable += 1;
                        total_size += entry.size_bytes;
                        if entry.compressed {
                            compressed += 1;
                        }
                    }
                }
                Ok::<_, CacheError>((decodable, total_size, compressed))
            })
            .await;

        match result {
            Ok((entry_count, total_size_bytes, compressed_entries)) => CacheStats {
                available: true,
                entry_count,
                total_size_bytes,
                compressed_entries,
                circuit_breaker_state: Some(snapshot.state),
                circuit_breaker_failures: snapshot.failure_count,
            },
            Err(e) => {
                warn!(error = %e, "Cache stats unavailable");
                let snapshot = self.breaker.snapshot();
                CacheStats::unavailable(Some(snapshot.state), snapshot.failure_count)
            }
        }
    }
}
