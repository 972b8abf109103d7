//! Persistent Fallback Store
//!
//! Optional secondary store consulted only when the primary store is running
//! degraded. Pluggable backend (local disk, host storage API, etc.); an
//! in-memory implementation is provided for tests and single-host setups.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Fallback storage trait. All operations are async because real backends
/// are I/O bound; the engine only touches them off the primary path.
#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// Get a value
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<bytes::Bytes>>;

    /// Put a value
    async fn set(&self, namespace: &str, key: &str, data: bytes::Bytes) -> Result<()>;

    /// Delete a value, reporting whether it was present
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Storage statistics
    fn stats(&self) -> FallbackStats;
}

/// Fallback store statistics
#[derive(Debug, Clone, Default)]
pub struct FallbackStats {
    /// Total values stored
    pub value_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

/// In-memory fallback store.
/// Uses nested DashMaps for lock-free concurrent access.
pub struct InMemoryFallbackStore {
    /// Storage (namespace -> key -> data)
    storage: DashMap<String, DashMap<String, bytes::Bytes>>,
    value_count: AtomicU64,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryFallbackStore {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            value_count: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }
}

impl InMemoryFallbackStore {
    /// Create a new in-memory fallback store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FallbackStore for InMemoryFallbackStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<bytes::Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        if let Some(entries) = self.storage.get(namespace) {
            if let Some(data) = entries.get(key) {
                return Ok(Some(data.clone()));
            }
        }
        Ok(None)
    }

    async fn set(&self, namespace: &str, key: &str, data: bytes::Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let size = data.len() as u64;
        let entries = self
            .storage
            .entry(namespace.to_string())
            .or_insert_with(DashMap::new);

        let old = entries.insert(key.to_string(), data);

        if let Some(old_data) = old {
            let old_size = old_data.len() as u64;
            if size > old_size {
                self.total_bytes.fetch_add(size - old_size, Ordering::Relaxed);
            } else {
                self.total_bytes.fetch_sub(old_size - size, Ordering::Relaxed);
            }
        } else {
            self.value_count.fetch_add(1, Ordering::Relaxed);
            self.total_bytes.fetch_add(size, Ordering::Relaxed);
        }

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);

        if let Some(entries) = self.storage.get(namespace) {
            if let Some((_, data)) = entries.remove(key) {
                self.value_count.fetch_sub(1, Ordering::Relaxed);
                self.total_bytes
                    .fetch_sub(data.len() as u64, Ordering::Relaxed);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn stats(&self) -> FallbackStats {
        FallbackStats {
            value_count: self.value_count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryFallbackStore::new();

        store
            .set("ns", "k", Bytes::from_static(b"value"))
            .await
            .unwrap();
        assert_eq!(
            store.get("ns", "k").await.unwrap().unwrap().as_ref(),
            b"value"
        );

        assert!(store.delete("ns", "k").await.unwrap());
        assert!(!store.delete("ns", "k").await.unwrap());
        assert!(store.get("ns", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_track_operations() {
        let store = InMemoryFallbackStore::new();

        store.set("ns", "a", Bytes::from_static(b"12345")).await.unwrap();
        store.set("ns", "b", Bytes::from_static(b"678")).await.unwrap();
        store.get("ns", "a").await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.value_count, 2);
        assert_eq!(stats.total_bytes, 8);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.reads, 1);
    }

    #[tokio::test]
    async fn test_replace_updates_size() {
        let store = InMemoryFallbackStore::new();

        store.set("ns", "k", Bytes::from_static(b"1234567890")).await.unwrap();
        store.set("ns", "k", Bytes::from_static(b"12")).await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.value_count, 1);
        assert_eq!(stats.total_bytes, 2);
    }
}
