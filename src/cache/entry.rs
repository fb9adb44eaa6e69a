//! # Cache Entries and the Wire Envelope
//!
//! A cache entry references a rendered artifact on durable storage plus the
//! bookkeeping needed for TTL refresh and eviction decisions. Entries are
//! stored behind an explicit versioned envelope (format version + compression
//! flag) that is checked on every read, so format changes fail closed as a
//! cache miss instead of deserializing garbage.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::CacheError;

/// Bumped whenever the serialized entry layout changes. Readers refuse any
/// other version.
pub const CACHE_FORMAT_VERSION: u16 = 2;

/// Envelope header: version (big-endian u16) + compression flag byte.
const ENVELOPE_HEADER_LEN: usize = 3;

/// One cached rendering result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Location of the rendered artifact on durable storage.
    pub artifact_path: PathBuf,
    pub size_bytes: u64,
    /// Artifact modification time (unix seconds) at caching time; a newer
    /// mtime on disk means the artifact was replaced and the entry is stale.
    pub artifact_mtime: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub metadata: HashMap<String, serde_json::Value>,
    pub compressed: bool,
}

impl CacheEntry {
    pub fn new(
        artifact_path: PathBuf,
        size_bytes: u64,
        artifact_mtime: i64,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            artifact_path,
            size_bytes,
            artifact_mtime,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            metadata,
            compressed: false,
        }
    }

    /// Record a confirmed hit.
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count += 1;
    }

    /// Serialize into the versioned envelope, gzip-compressing payloads that
    /// exceed `compression_threshold`.
    pub fn encode(&self, compression_threshold: usize) -> Result<Vec<u8>, CacheError> {
        let mut entry = self.clone();
        let json = serde_json::to_vec(&entry)?;

        let (compressed, payload) = if json.len() > compression_threshold {
            entry.compressed = true;
            let json = serde_json::to_vec(&entry)?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&json)
                .and_then(|()| encoder.finish())
                .map(|bytes| (true, bytes))
                .map_err(|e| CacheError::serialization(format!("gzip encode failed: {e}")))?
        } else {
            (false, json)
        };

        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
        buf.extend_from_slice(&CACHE_FORMAT_VERSION.to_be_bytes());
        buf.push(u8::from(compressed));
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a stored envelope, refusing unknown versions and malformed
    /// payloads.
    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(CacheError::serialization("envelope shorter than header"));
        }

        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if version != CACHE_FORMAT_VERSION {
            return Err(CacheError::FormatVersionMismatch {
                found: version,
                expected: CACHE_FORMAT_VERSION,
            });
        }

        let compressed = match bytes[2] {
            0 => false,
            1 => true,
            flag => {
                return Err(CacheError::serialization(format!(
                    "unknown compression flag: {flag}"
                )))
            }
        };

        let payload = &bytes[ENVELOPE_HEADER_LEN..];
        let entry: CacheEntry = if compressed {
            let mut decoder = GzDecoder::new(payload);
            let mut json = Vec::new();
            decoder
                .read_to_end(&mut json)
                .map_err(|e| CacheError::serialization(format!("gzip decode failed: {e}")))?;
            serde_json::from_slice(&json)?
        } else {
            serde_json::from_slice(payload)?
        };

        Ok(entry)
    }
}
