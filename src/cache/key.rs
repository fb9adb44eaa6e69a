//! # Cache Key Generation
//!
//! Deterministic fingerprints for cacheable rendering work. Two requests
//! with identical parameters and input content must collide on the same key
//! regardless of the order multi-valued options or files arrived in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::entry::CACHE_FORMAT_VERSION;

/// Fingerprint of one unit of cacheable work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-computed fingerprint (e.g. read back from the store).
    pub fn from_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self(fingerprint.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonicalizable job parameters for fingerprinting.
///
/// `options` holds the scalar rendering options (card size, paper size, ppi,
/// quality, ...); `skip_indices` the positions excluded from the sheet;
/// `input_hashes` the content hashes of every uploaded input, grouped by
/// input kind (fronts, backs, double-sided).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParams {
    pub options: BTreeMap<String, serde_json::Value>,
    pub skip_indices: Vec<u32>,
    pub input_hashes: BTreeMap<String, Vec<String>>,
}

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn option(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn skip_indices(mut self, indices: Vec<u32>) -> Self {
        self.skip_indices = indices;
        self
    }

    pub fn input(mut self, kind: impl Into<String>, hashes: Vec<String>) -> Self {
        self.input_hashes.insert(kind.into(), hashes);
        self
    }

    /// Generate the deterministic fingerprint for these parameters.
    ///
    /// Multi-valued lists are sorted before hashing, and the map types keep
    /// their keys ordered, so logically identical requests with differently
    /// ordered inputs produce the same key. The cache format version is part
    /// of the hashed material, so format bumps invalidate wholesale.
    pub fn generate_key(&self) -> CacheKey {
        let mut canonical = self.clone();
        canonical.skip_indices.sort_unstable();
        canonical.skip_indices.dedup();
        for hashes in canonical.input_hashes.values_mut() {
            hashes.sort_unstable();
        }

        let mut hasher = Sha256::new();
        // BTreeMap serialization is key-ordered, which makes the JSON stable.
        let serialized =
            serde_json::to_vec(&canonical).expect("canonical job params always serialize");
        hasher.update(&serialized);
        hasher.update(CACHE_FORMAT_VERSION.to_be_bytes());

        let digest = hasher.finalize();
        let mut fingerprint = String::with_capacity(32);
        for byte in &digest[..16] {
            fingerprint.push_str(&format!("{byte:02x}"));
        }
        CacheKey(fingerprint)
    }
}

/// Content hash of one uploaded input file's bytes.
pub fn hash_input_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
