//! Cache Store
//!
//! The core namespaced key→entry map. Owns insertion, lookup, expiration,
//! cascade invalidation, and eviction mechanics. Namespaces double as lock
//! shards: each namespace guards its entries with its own `RwLock`, so
//! writers serialize per namespace while readers take shared snapshots.
//!
//! All operations complete without I/O. The store never throws for absence:
//! a missing entry is a defined miss or no-op everywhere except `set`, which
//! surfaces codec failures to the caller rather than storing corrupt data.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::codec::{CodecManager, Encoding};
use crate::config::CacheConfig;
use crate::entry::{fx_hash, CacheEntry, EntryKey};
use crate::error::Result;
use crate::memory::{MemoryMonitor, PressureLevel};
use crate::metrics::CacheMetrics;
use crate::ttl::AdaptiveTtlEngine;

/// Options accepted by `set`
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Explicit TTL, overriding the adaptive engine
    pub ttl_hint: Option<Duration>,
    /// Namespace or `namespace/key` tokens whose invalidation cascades to
    /// this entry
    pub dependencies: Vec<String>,
    /// Opaque tags carried on the entry
    pub tags: Vec<String>,
}

impl SetOptions {
    /// Options with an explicit TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl_hint: Some(ttl),
            ..Default::default()
        }
    }
}

/// One namespace: an entry map plus size accounting.
#[derive(Debug, Default)]
struct Namespace {
    entries: RwLock<HashMap<String, CacheEntry>>,
    size_bytes: AtomicU64,
}

/// Version and content fingerprint of an entry, as exchanged in digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryDigest {
    /// Monotonic entry version
    pub version: u64,
    /// FxHash of the decoded value
    pub content_hash: u64,
}

/// Process-local namespaced cache store.
pub struct CacheStore {
    namespaces: DashMap<String, Arc<Namespace>>,
    codec: CodecManager,
    ttl: AdaptiveTtlEngine,
    memory: Arc<MemoryMonitor>,
    metrics: Arc<CacheMetrics>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Create a store from a validated configuration.
    ///
    /// Fails with `Error::StorageInit` when the configuration is rejected;
    /// the manager reacts by constructing a degraded default store instead.
    pub fn new(
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            namespaces: DashMap::new(),
            codec: CodecManager::with_config(config.codec.clone()),
            ttl: AdaptiveTtlEngine::new(config.ttl.clone(), clock.clone()),
            memory: Arc::new(MemoryMonitor::new(config.memory.clone())),
            metrics,
            clock,
        })
    }

    fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.get(name).map(|ns| ns.value().clone())
    }

    fn namespace_or_create(&self, name: &str) -> Arc<Namespace> {
        self.namespaces
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Look up a key, returning the decoded value.
    ///
    /// An entry past its expiry is a miss and is removed opportunistically.
    /// A payload that fails to decode back to its fingerprinted content is
    /// surfaced as `Error::Decode`, never served.
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        let now = self.clock.now_millis();

        let ns = match self.namespace(namespace) {
            Some(ns) => ns,
            None => {
                self.metrics.record_miss();
                return Ok(None);
            }
        };

        enum Lookup {
            Miss,
            Expired,
            Hit(Bytes, Encoding, u64),
        }

        let lookup = {
            let entries = ns.entries.read();
            match entries.get(key) {
                None => Lookup::Miss,
                Some(entry) if entry.is_expired(now) => Lookup::Expired,
                Some(entry) => {
                    entry.record_access(now);
                    Lookup::Hit(entry.payload().clone(), entry.encoding(), entry.content_hash())
                }
            }
        };

        let (payload, encoding, content_hash) = match lookup {
            Lookup::Miss => {
                self.metrics.record_miss();
                return Ok(None);
            }
            Lookup::Expired => {
                self.remove_if_expired(&ns, key, now);
                self.metrics.record_miss();
                return Ok(None);
            }
            Lookup::Hit(payload, encoding, content_hash) => (payload, encoding, content_hash),
        };

        let decoded = self.codec.decode(&payload, encoding, namespace, key)?;
        if fx_hash(&decoded) != content_hash {
            return Err(crate::error::Error::decode(
                namespace,
                key,
                "content fingerprint mismatch after decode",
            ));
        }

        self.metrics.record_hit();
        Ok(Some(decoded))
    }

    /// True when the key is present and unexpired. Does not touch access
    /// metadata.
    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.namespace(namespace)
            .map(|ns| {
                ns.entries
                    .read()
                    .get(key)
                    .map(|e| !e.is_expired(now))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Expiry timestamp of a live entry, if present.
    pub fn expires_at(&self, namespace: &str, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        self.namespace(namespace).and_then(|ns| {
            ns.entries
                .read()
                .get(key)
                .filter(|e| !e.is_expired(now))
                .map(|e| e.expires_at())
        })
    }

    /// Stored representation of a live entry, if present.
    pub fn payload_encoding(&self, namespace: &str, key: &str) -> Option<Encoding> {
        let now = self.clock.now_millis();
        self.namespace(namespace).and_then(|ns| {
            ns.entries
                .read()
                .get(key)
                .filter(|e| !e.is_expired(now))
                .map(|e| e.encoding())
        })
    }

    /// Version and content fingerprint of a live entry, if present.
    pub fn digest(&self, namespace: &str, key: &str) -> Option<EntryDigest> {
        let now = self.clock.now_millis();
        self.namespace(namespace).and_then(|ns| {
            ns.entries
                .read()
                .get(key)
                .filter(|e| !e.is_expired(now))
                .map(|e| EntryDigest {
                    version: e.version(),
                    content_hash: e.content_hash(),
                })
        })
    }

    /// Sample up to `limit` live entries across all namespaces for a
    /// consistency audit.
    pub fn sample_digests(&self, limit: usize) -> Vec<(EntryKey, EntryDigest)> {
        let now = self.clock.now_millis();
        let mut out = Vec::with_capacity(limit.min(64));

        for item in self.namespaces.iter() {
            if out.len() >= limit {
                break;
            }
            let entries = item.value().entries.read();
            for (key, entry) in entries.iter() {
                if out.len() >= limit {
                    break;
                }
                if entry.is_expired(now) {
                    continue;
                }
                out.push((
                    EntryKey::new(item.key().clone(), key.clone()),
                    EntryDigest {
                        version: entry.version(),
                        content_hash: entry.content_hash(),
                    },
                ));
            }
        }
        out
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Encode and insert a value, replacing any previous entry for the key.
    ///
    /// The TTL comes from the adaptive engine unless the caller hints one.
    /// Codec round-trip failure fails the operation with nothing stored.
    pub fn set(&self, namespace: &str, key: &str, raw: &[u8], opts: SetOptions) -> Result<()> {
        let encoded = match self.codec.encode(raw) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.metrics.record_encode_failure();
                return Err(e);
            }
        };

        // TTL is inferred from prior write history; this write joins the
        // observation window afterwards.
        let ttl = self.ttl.compute_ttl(namespace, opts.ttl_hint);
        self.ttl.record_write(namespace);
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        let now = self.clock.now_millis();
        let content_hash = fx_hash(raw);
        let ns = self.namespace_or_create(namespace);

        let delta = {
            let mut entries = ns.entries.write();
            let version = entries.get(key).map(|e| e.version() + 1).unwrap_or(1);
            let entry = CacheEntry::new(
                encoded.payload,
                encoded.encoding,
                raw.len() as u64,
                content_hash,
                now,
                now + ttl_ms,
                version,
                opts.dependencies.into_iter().collect::<HashSet<_>>(),
                opts.tags,
            );
            let new_size = entry.stored_size() as i64;
            let old_size = entries
                .insert(key.to_string(), entry)
                .map(|old| old.stored_size() as i64)
                .unwrap_or(0);
            new_size - old_size
        };

        Self::adjust_size(&ns, delta);
        self.metrics.record_set();

        let outcome = self.memory.record_delta(delta);
        if outcome.crossed_upward {
            self.relieve_pressure(outcome.level);
        }

        Ok(())
    }

    /// Remove a key if present. Idempotent.
    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        if self.remove_entry(namespace, key) {
            self.metrics.record_delete();
            true
        } else {
            false
        }
    }

    /// Remove without attributing the removal to any particular counter;
    /// eviction and invalidation record their own metrics.
    fn remove_entry(&self, namespace: &str, key: &str) -> bool {
        let ns = match self.namespace(namespace) {
            Some(ns) => ns,
            None => return false,
        };

        let removed = {
            let mut entries = ns.entries.write();
            entries.remove(key)
        };

        match removed {
            Some(entry) => {
                let size = entry.stored_size() as i64;
                Self::adjust_size(&ns, -size);
                self.memory.record_delta(-size);
                true
            }
            None => false,
        }
    }

    /// Remove the listed keys plus every entry elsewhere that depends on
    /// them through `namespace/key` tokens. Returns removed entry count.
    pub fn invalidate_keys(&self, namespace: &str, keys: &[String]) -> usize {
        let mut removed = 0;
        let mut tokens = Vec::with_capacity(keys.len());

        for key in keys {
            if self.remove_entry(namespace, key) {
                removed += 1;
            }
            tokens.push(EntryKey::new(namespace, key.clone()).dependency_token());
        }

        removed + self.remove_dependents(&tokens)
    }

    /// Remove all entries in a namespace and every entry elsewhere whose
    /// dependencies include the namespace. Returns removed entry count.
    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        let mut removed = 0;

        if let Some((_, ns)) = self.namespaces.remove(namespace) {
            let mut entries = ns.entries.write();
            removed = entries.len();
            let freed: i64 = entries.values().map(|e| e.stored_size() as i64).sum();
            entries.clear();
            ns.size_bytes.store(0, Ordering::Relaxed);
            self.memory.record_delta(-freed);
        }

        removed + self.remove_dependents(&[namespace.to_string()])
    }

    /// Drop everything.
    pub fn clear(&self) {
        for item in self.namespaces.iter() {
            let ns = item.value();
            ns.entries.write().clear();
            ns.size_bytes.store(0, Ordering::Relaxed);
            self.ttl.forget(item.key());
        }
        self.namespaces.clear();
        self.memory.reset();
    }

    fn remove_dependents(&self, tokens: &[String]) -> usize {
        let mut removed = 0;
        for item in self.namespaces.iter() {
            let ns = item.value();
            let victims: Vec<String> = {
                let entries = ns.entries.read();
                entries
                    .iter()
                    .filter(|(_, e)| tokens.iter().any(|t| e.dependencies().contains(t)))
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            if victims.is_empty() {
                continue;
            }
            let mut entries = ns.entries.write();
            for key in victims {
                if let Some(entry) = entries.remove(&key) {
                    let size = entry.stored_size() as i64;
                    ns.size_bytes
                        .fetch_sub(size as u64, Ordering::Relaxed);
                    self.memory.record_delta(-size);
                    removed += 1;
                }
            }
        }
        removed
    }

    // =========================================================================
    // Eviction & sweeping
    // =========================================================================

    /// Evict up to `count` entries, lowest composite score first
    /// (`access_count / (seconds_idle + 1)`), ties broken by oldest
    /// `created_at`. Expired entries always go first. Returns evicted count.
    pub fn evict(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let now = self.clock.now_millis();

        // (score, created_at, namespace, key)
        let mut candidates: Vec<(f64, u64, String, String)> = Vec::new();
        for item in self.namespaces.iter() {
            let entries = item.value().entries.read();
            for (key, entry) in entries.iter() {
                let score = if entry.is_expired(now) {
                    -1.0
                } else {
                    entry.eviction_score(now)
                };
                candidates.push((score, entry.created_at(), item.key().clone(), key.clone()));
            }
        }

        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        let mut evicted = 0;
        for (_, _, namespace, key) in candidates.into_iter().take(count) {
            if self.remove_entry(&namespace, &key) {
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.metrics.record_evictions(evicted as u64);
            debug!(evicted, "eviction pass complete");
        }
        evicted
    }

    /// Remove every entry past its expiry. Returns removed count.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;

        for item in self.namespaces.iter() {
            let ns = item.value();
            let mut entries = ns.entries.write();
            let before = entries.len();
            entries.retain(|_, entry| {
                if entry.is_expired(now) {
                    let size = entry.stored_size() as i64;
                    ns.size_bytes.fetch_sub(size as u64, Ordering::Relaxed);
                    self.memory.record_delta(-size);
                    false
                } else {
                    true
                }
            });
            removed += before - entries.len();
        }

        if removed > 0 {
            self.metrics.record_expired(removed as u64);
            debug!(removed, "expired sweep complete");
        }
        removed
    }

    /// Re-encode up to `limit` raw-stored entries (High-pressure compression
    /// pass). Returns the number of entries whose footprint shrank.
    pub fn compress_uncompressed(&self, limit: usize) -> usize {
        let now = self.clock.now_millis();
        let mut repacked = 0;

        'outer: for item in self.namespaces.iter() {
            let ns = item.value();
            let candidates: Vec<String> = {
                let entries = ns.entries.read();
                entries
                    .iter()
                    .filter(|(_, e)| !e.is_compressed() && !e.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            };

            for key in candidates {
                if repacked >= limit {
                    break 'outer;
                }
                let mut entries = ns.entries.write();
                let (payload, stored_size) = match entries.get(&key) {
                    Some(e) if !e.is_compressed() => (e.payload().clone(), e.stored_size()),
                    _ => continue,
                };
                let encoded = match self.codec.encode_aggressive(&payload) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!(namespace = %item.key(), key = %key, error = %e,
                            "compression pass skipped entry");
                        continue;
                    }
                };
                if !encoded.encoding.is_compressed() {
                    continue;
                }
                let delta = encoded.payload.len() as i64 - stored_size as i64;
                if let Some(entry) = entries.remove(&key) {
                    entries.insert(key, entry.with_payload(encoded.payload, encoded.encoding));
                }
                drop(entries);

                Self::adjust_size(ns.as_ref(), delta);
                self.memory.record_delta(delta);
                repacked += 1;
            }
        }

        if repacked > 0 {
            debug!(repacked, "pressure compression pass complete");
        }
        repacked
    }

    /// React to an upward pressure crossing: an immediate eviction pass,
    /// plus a compression pass at High and a full expired sweep at Critical.
    pub fn relieve_pressure(&self, level: PressureLevel) {
        let budget = self.memory.recommend_eviction_budget();
        debug!(%level, budget, "pressure crossing, running out-of-band relief");

        match level {
            PressureLevel::Critical => {
                self.sweep_expired();
                self.evict(budget);
            }
            PressureLevel::High => {
                self.compress_uncompressed(self.memory.compression_pass_limit());
                self.evict(budget);
            }
            _ => {
                self.evict(budget);
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Total live entry count (including not-yet-swept expired entries)
    pub fn len(&self) -> usize {
        self.namespaces
            .iter()
            .map(|ns| ns.value().entries.read().len())
            .sum()
    }

    /// True when no entries are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory monitor handle
    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    /// Adaptive TTL engine handle
    pub fn ttl_engine(&self) -> &AdaptiveTtlEngine {
        &self.ttl
    }

    fn adjust_size(ns: &Namespace, delta: i64) {
        if delta >= 0 {
            ns.size_bytes.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            ns.size_bytes.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }

    fn remove_if_expired(&self, ns: &Namespace, key: &str, now: u64) {
        let mut entries = ns.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(now) {
                if let Some(entry) = entries.remove(key) {
                    let size = entry.stored_size() as i64;
                    ns.size_bytes.fetch_sub(size as u64, Ordering::Relaxed);
                    self.memory.record_delta(-size);
                    self.metrics.record_expired(1);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
