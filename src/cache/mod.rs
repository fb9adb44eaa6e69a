//! # Result Cache
//!
//! Content-addressed store for rendered artifacts. The primary backend is the
//! networked key-value store, accessed exclusively through the circuit
//! breaker; a bounded in-process fallback takes over when the networked
//! backend is unconfigured or unreachable at construction time.
//!
//! Backend failures never escape this module: a failing `get` degrades to a
//! miss, a failing `set` to a no-op, and `stats` always returns a well-formed
//! snapshot with `available = false`.

pub mod entry;
pub mod key;
pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BackendConfig, CacheConfig};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerError, CircuitState};

pub use entry::{CacheEntry, CACHE_FORMAT_VERSION};
pub use key::{hash_input_bytes, CacheKey, JobParams};
pub use memory::MemoryResultCache;
pub use redis::RedisResultCache;

/// Cache subsystem errors. These are absorbed at the `ResultCache` boundary
/// and surface to callers only through logs and the stats snapshot.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("Cache operation timed out after {timeout_secs}s: {operation}")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("Cached artifact no longer resolves: {path}")]
    IntegrityFailure { path: String },

    #[error("Cache entry serialization error: {message}")]
    Serialization { message: String },

    #[error("Cache entry format version mismatch: found {found}, expected {expected}")]
    FormatVersionMismatch { found: u16, expected: u16 },
}

impl CacheError {
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn integrity_failure(path: impl Into<String>) -> Self {
        Self::IntegrityFailure { path: path.into() }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::serialization(err.to_string())
    }
}

impl From<::redis::RedisError> for CacheError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_timeout() {
            CacheError::Timeout {
                operation: "backend call".to_string(),
                timeout_secs: 0,
            }
        } else {
            CacheError::backend_unavailable(err.to_string())
        }
    }
}

impl From<CircuitBreakerError<CacheError>> for CacheError {
    fn from(err: CircuitBreakerError<CacheError>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { component } => CacheError::CircuitOpen { component },
            CircuitBreakerError::OperationFailed(inner) => inner,
        }
    }
}

/// Always-well-formed cache statistics, safe to serialize for the HTTP layer
/// even when the backend is unreachable.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub available: bool,
    pub entry_count: u64,
    pub total_size_bytes: u64,
    pub compressed_entries: u64,
    pub circuit_breaker_state: Option<CircuitState>,
    pub circuit_breaker_failures: u32,
}

impl CacheStats {
    pub fn unavailable(state: Option<CircuitState>, failures: u32) -> Self {
        Self {
            available: false,
            entry_count: 0,
            total_size_bytes: 0,
            compressed_entries: 0,
            circuit_breaker_state: state,
            circuit_breaker_failures: failures,
        }
    }
}

/// Content-addressed artifact cache.
///
/// One interface, two concrete implementations selected once at construction:
/// the breaker-protected networked store and the bounded in-process fallback.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Look up an entry. Backend failures and integrity failures both degrade
    /// to a miss; a confirmed hit refreshes last-access bookkeeping and
    /// extends the TTL.
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Store an entry for an existing, non-empty artifact. Returns whether
    /// the entry was stored.
    async fn set(
        &self,
        key: &CacheKey,
        artifact_path: &Path,
        metadata: HashMap<String, serde_json::Value>,
        ttl: Option<Duration>,
    ) -> bool;

    /// Remove one entry. Must not fail for a non-existent key.
    async fn delete(&self, key: &CacheKey);

    /// Remove every entry whose key contains `pattern`. Returns the number
    /// removed.
    async fn invalidate_by_pattern(&self, pattern: &str) -> u64;

    /// Remove all entries. Returns the number removed.
    async fn clear(&self) -> u64;

    /// Drop entries whose artifact vanished or was replaced on disk.
    async fn cleanup_expired(&self) -> u64;

    /// Statistics snapshot, well-formed even when the backend is down.
    async fn stats(&self) -> CacheStats;
}

/// Build the result cache for the configured backend.
///
/// The networked implementation is chosen only when a backend URL is
/// configured and answers a connection probe; anything else falls back to the
/// in-process cache. The decision is made once, here.
pub async fn connect(
    backend: &BackendConfig,
    cache: &CacheConfig,
    breaker: &CircuitBreakerConfig,
) -> Arc<dyn ResultCache> {
    if let Some(url) = &backend.url {
        match RedisResultCache::connect(url, backend, cache, breaker.clone()).await {
            Ok(redis_cache) => {
                info!(backend = "redis", "📦 Result cache initialized");
                return Arc::new(redis_cache);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Cache backend not available, falling back to in-process cache"
                );
            }
        }
    } else {
        info!("No cache backend configured, using in-process cache");
    }

    Arc::new(MemoryResultCache::new(cache.clone()))
}
