//! Cache Entry Types
//!
//! The unit of cached state: an encoded payload plus the access metadata
//! driving expiry, eviction scoring, and cross-process version comparison.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::codec::Encoding;

/// Fast non-cryptographic hash (FxHash algorithm). Used for content
/// fingerprints compared across processes during consistency audits.
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Composite key: a key unique within its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    /// Logical grouping enabling bulk operations
    pub namespace: String,
    /// Key within the namespace
    pub key: String,
}

impl EntryKey {
    /// Create a new entry key
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Dependency token naming this specific entry (`namespace/key`).
    pub fn dependency_token(&self) -> String {
        format!("{}/{}", self.namespace, self.key)
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// A cached value with its access metadata.
///
/// Timestamps are engine-clock milliseconds. Access metadata is atomic so
/// the read path can update it under a shared (read) namespace lock.
pub struct CacheEntry {
    /// Stored payload, possibly transformed
    payload: Bytes,
    /// Representation of `payload`
    encoding: Encoding,
    /// Size of the decoded value in bytes
    raw_size: u64,
    /// Creation timestamp
    created_at: u64,
    /// Logical expiry; the entry is absent from `now >= expires_at`
    expires_at: u64,
    /// Last access timestamp
    last_accessed: AtomicU64,
    /// Monotonically increasing access counter
    access_count: AtomicU64,
    /// Monotonic version, incremented on every overwrite of the same key
    version: u64,
    /// FxHash of the decoded value
    content_hash: u64,
    /// Namespace or `namespace/key` tokens whose invalidation cascades here
    dependencies: HashSet<String>,
    /// Opaque tags carried for auditing and reporting
    tags: Vec<String>,
}

impl CacheEntry {
    /// Create a new entry.
    ///
    /// `expires_at` must be strictly greater than `created_at`; the store
    /// guarantees this by always computing it as `created_at + ttl` with a
    /// validated non-zero TTL.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payload: Bytes,
        encoding: Encoding,
        raw_size: u64,
        content_hash: u64,
        created_at: u64,
        expires_at: u64,
        version: u64,
        dependencies: HashSet<String>,
        tags: Vec<String>,
    ) -> Self {
        debug_assert!(expires_at > created_at);
        Self {
            payload,
            encoding,
            raw_size,
            created_at,
            expires_at,
            last_accessed: AtomicU64::new(created_at),
            access_count: AtomicU64::new(0),
            version,
            content_hash,
            dependencies,
            tags,
        }
    }

    /// Stored payload (zero-copy)
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload representation
    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// True when a non-raw representation is stored
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.encoding.is_compressed()
    }

    /// Bytes occupied by the stored payload
    #[inline]
    pub fn stored_size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Size of the decoded value
    #[inline]
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    /// Creation timestamp (millis)
    #[inline]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Expiry timestamp (millis)
    #[inline]
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Entry version
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Content fingerprint of the decoded value
    #[inline]
    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }

    /// Dependency tokens
    #[inline]
    pub fn dependencies(&self) -> &HashSet<String> {
        &self.dependencies
    }

    /// Opaque tags
    #[inline]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Logical absence check: past expiry the entry is a miss even while
    /// physically present until swept.
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Record an access, returning the new count.
    #[inline]
    pub fn record_access(&self, now: u64) -> u64 {
        self.last_accessed.store(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Access count
    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Last access timestamp (millis)
    #[inline]
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    /// Composite eviction value: recency-weighted frequency,
    /// `access_count / (seconds_since_access + 1)`. Lower scores evict
    /// first; ties break to the oldest `created_at`.
    pub fn eviction_score(&self, now: u64) -> f64 {
        let idle_secs = now.saturating_sub(self.last_accessed()) as f64 / 1000.0;
        self.access_count() as f64 / (idle_secs + 1.0)
    }

    /// Replace the stored representation in place (High-pressure compression
    /// pass). All metadata is preserved.
    pub fn with_payload(&self, payload: Bytes, encoding: Encoding) -> Self {
        Self {
            payload,
            encoding,
            raw_size: self.raw_size,
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed: AtomicU64::new(self.last_accessed()),
            access_count: AtomicU64::new(self.access_count()),
            version: self.version,
            content_hash: self.content_hash,
            dependencies: self.dependencies.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            encoding: self.encoding,
            raw_size: self.raw_size,
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed: AtomicU64::new(self.last_accessed()),
            access_count: AtomicU64::new(self.access_count()),
            version: self.version,
            content_hash: self.content_hash,
            dependencies: self.dependencies.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("encoding", &self.encoding)
            .field("stored_size", &self.stored_size())
            .field("raw_size", &self.raw_size)
            .field("version", &self.version)
            .field("expires_at", &self.expires_at)
            .field("access_count", &self.access_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(created_at: u64, expires_at: u64) -> CacheEntry {
        let data = Bytes::from_static(b"payload");
        CacheEntry::new(
            data.clone(),
            Encoding::Raw,
            data.len() as u64,
            fx_hash(&data),
            created_at,
            expires_at,
            1,
            HashSet::new(),
            Vec::new(),
        )
    }

    #[test]
    fn test_fx_hash_deterministic() {
        assert_eq!(fx_hash(b"abc"), fx_hash(b"abc"));
        assert_ne!(fx_hash(b"abc"), fx_hash(b"abd"));
        assert_ne!(fx_hash(b""), fx_hash(b"\0"));
    }

    #[test]
    fn test_entry_key() {
        let key = EntryKey::new("dashboard", "stats");
        assert_eq!(key.to_string(), "dashboard/stats");
        assert_eq!(key.dependency_token(), "dashboard/stats");
        assert_eq!(key, EntryKey::new("dashboard", "stats"));
        assert_ne!(key, EntryKey::new("dashboard", "other"));
    }

    #[test]
    fn test_expiry_boundary() {
        let entry = make_entry(1_000, 2_000);
        assert!(!entry.is_expired(1_999));
        assert!(entry.is_expired(2_000)); // now >= expires_at
        assert!(entry.is_expired(3_000));
    }

    #[test]
    fn test_access_tracking() {
        let entry = make_entry(1_000, 10_000);
        assert_eq!(entry.access_count(), 0);
        assert_eq!(entry.last_accessed(), 1_000);

        assert_eq!(entry.record_access(1_500), 1);
        assert_eq!(entry.record_access(1_800), 2);
        assert_eq!(entry.access_count(), 2);
        assert_eq!(entry.last_accessed(), 1_800);
    }

    #[test]
    fn test_eviction_score_prefers_hot_entries() {
        let hot = make_entry(1_000, 100_000);
        let cold = make_entry(1_000, 100_000);

        for _ in 0..10 {
            hot.record_access(2_000);
        }
        cold.record_access(2_000);

        let now = 5_000;
        assert!(hot.eviction_score(now) > cold.eviction_score(now));
    }

    #[test]
    fn test_eviction_score_decays_with_idleness() {
        let entry = make_entry(1_000, 1_000_000);
        entry.record_access(2_000);

        let fresh = entry.eviction_score(2_000);
        let stale = entry.eviction_score(500_000);
        assert!(stale < fresh);
    }

    #[test]
    fn test_clone_preserves_counters() {
        let entry = make_entry(1_000, 10_000);
        entry.record_access(2_000);
        entry.record_access(3_000);

        let cloned = entry.clone();
        assert_eq!(cloned.access_count(), 2);
        assert_eq!(cloned.last_accessed(), 3_000);
        assert_eq!(cloned.version(), 1);
    }

    #[test]
    fn test_with_payload_preserves_metadata() {
        let entry = make_entry(1_000, 10_000);
        entry.record_access(2_000);

        let repacked = entry.with_payload(Bytes::from_static(b"x"), Encoding::Rle);
        assert_eq!(repacked.stored_size(), 1);
        assert_eq!(repacked.raw_size(), 7);
        assert_eq!(repacked.access_count(), 2);
        assert_eq!(repacked.expires_at(), 10_000);
        assert!(repacked.is_compressed());
    }
}
