//! Consistency Monitor
//!
//! Stores are process-local by design; peers share only events. This monitor
//! exists to detect — not prevent — divergence between cooperating
//! processes. On a timer (and on demand) it broadcasts version/content
//! digests for a sample of entries, compares them against digests received
//! from peers, and repairs per-key:
//!
//! - a peer holds a higher monotonic version → the local copy is stale and
//!   is dropped, forcing a cold miss refill;
//! - versions are equal but content differs → a genuine conflict: both sides
//!   are discarded via a broadcast smart invalidation rather than guessing
//!   which copy is correct.
//!
//! The resulting consistency score is observability only; no action is
//! taken from a low score beyond the per-key rule above.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::broadcast::BroadcastChannel;
use crate::bus::{InvalidationBus, InvalidationEvent, WireMessage};
use crate::clock::Clock;
use crate::config::ConsistencyConfig;
use crate::entry::EntryKey;
use crate::metrics::CacheMetrics;
use crate::store::CacheStore;

// =============================================================================
// Wire Types
// =============================================================================

/// One entry's digest as exchanged between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestEntry {
    /// Entry namespace
    pub namespace: String,
    /// Entry key
    pub key: String,
    /// Monotonic entry version
    pub version: u64,
    /// FxHash of the decoded value
    pub content_hash: u64,
}

/// A batch of digests from one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestBatch {
    /// Emitting process
    pub origin_process_id: Uuid,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Sampled entries
    pub entries: Vec<DigestEntry>,
}

// =============================================================================
// Audit Records
// =============================================================================

/// Per-key comparison record produced by an audit. Transient; not persisted.
#[derive(Debug, Clone)]
pub struct ConsistencySnapshot {
    /// The audited entry
    pub key: EntryKey,
    /// Version held locally
    pub local_version: u64,
    /// Freshest version observed from peers (local when no peer evidence)
    pub remote_version: u64,
    /// Whether the audit flagged this key
    pub divergent: bool,
}

/// What a peer last claimed about an entry.
#[derive(Debug, Clone, Copy)]
struct PeerDigest {
    version: u64,
    content_hash: u64,
    seen_at: u64,
}

// =============================================================================
// Monitor
// =============================================================================

/// Audits entries for cross-process divergence and triggers repair.
pub struct ConsistencyMonitor {
    process_id: Uuid,
    store: Arc<CacheStore>,
    bus: Arc<InvalidationBus>,
    channel: Arc<dyn BroadcastChannel>,
    metrics: Arc<CacheMetrics>,
    clock: Arc<dyn Clock>,
    config: ConsistencyConfig,
    peers: DashMap<EntryKey, PeerDigest>,
}

impl ConsistencyMonitor {
    /// Create a monitor for one process.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        process_id: Uuid,
        store: Arc<CacheStore>,
        bus: Arc<InvalidationBus>,
        channel: Arc<dyn BroadcastChannel>,
        metrics: Arc<CacheMetrics>,
        clock: Arc<dyn Clock>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            process_id,
            store,
            bus,
            channel,
            metrics,
            clock,
            config,
            peers: DashMap::new(),
        }
    }

    /// Record digests received from a peer. Own batches (echo) are ignored.
    pub fn ingest(&self, batch: DigestBatch) {
        if batch.origin_process_id == self.process_id {
            return;
        }
        let now = self.clock.now_millis();
        for entry in batch.entries {
            self.peers.insert(
                EntryKey::new(entry.namespace, entry.key),
                PeerDigest {
                    version: entry.version,
                    content_hash: entry.content_hash,
                    seen_at: now,
                },
            );
        }
    }

    /// Run one audit cycle: broadcast a digest sample, compare against peer
    /// evidence, repair divergent keys, and update the consistency score.
    #[instrument(skip(self), fields(process = %self.process_id))]
    pub fn audit_now(&self) -> Vec<ConsistencySnapshot> {
        self.prune_stale_peers();

        let sample = self.store.sample_digests(self.config.sample_size);
        self.broadcast_digests(&sample);

        let mut snapshots = Vec::with_capacity(sample.len());
        let mut agreeing = 0u64;

        for (key, local) in &sample {
            let peer = self.peers.get(key).map(|p| *p.value());
            let snapshot = match peer {
                None => {
                    agreeing += 1;
                    ConsistencySnapshot {
                        key: key.clone(),
                        local_version: local.version,
                        remote_version: local.version,
                        divergent: false,
                    }
                }
                Some(peer) if peer.version > local.version => {
                    // Stale local copy: prefer the higher version by forcing
                    // a cold miss here; the next read refills from backend.
                    self.store.delete(&key.namespace, &key.key);
                    self.metrics.record_divergence_repaired();
                    debug!(key = %key, local = local.version, remote = peer.version,
                        "stale local entry dropped");
                    ConsistencySnapshot {
                        key: key.clone(),
                        local_version: local.version,
                        remote_version: peer.version,
                        divergent: true,
                    }
                }
                Some(peer)
                    if peer.version == local.version
                        && peer.content_hash != local.content_hash =>
                {
                    // Equal versions, differing content: discard both sides
                    // rather than guess which copy is correct.
                    self.metrics.record_conflict_repaired();
                    warn!(key = %key, version = local.version,
                        "version conflict; forcing cold miss on all processes");
                    self.bus.publish(InvalidationEvent::smart_keys(
                        key.namespace.clone(),
                        vec![key.key.clone()],
                        "version conflict detected by consistency audit",
                        self.process_id,
                    ));
                    ConsistencySnapshot {
                        key: key.clone(),
                        local_version: local.version,
                        remote_version: peer.version,
                        divergent: true,
                    }
                }
                Some(peer) => {
                    // Local is as fresh or fresher; the peer repairs itself.
                    agreeing += 1;
                    ConsistencySnapshot {
                        key: key.clone(),
                        local_version: local.version,
                        remote_version: peer.version,
                        divergent: false,
                    }
                }
            };
            snapshots.push(snapshot);
        }

        self.metrics.record_audit(sample.len() as u64, agreeing);
        debug!(sampled = sample.len(), agreeing, "audit cycle complete");
        snapshots
    }

    /// Peer digest records currently held (observability)
    pub fn peer_evidence_len(&self) -> usize {
        self.peers.len()
    }

    fn broadcast_digests(&self, sample: &[(EntryKey, crate::store::EntryDigest)]) {
        if sample.is_empty() {
            return;
        }
        let batch = DigestBatch {
            origin_process_id: self.process_id,
            timestamp: Utc::now(),
            entries: sample
                .iter()
                .map(|(key, digest)| DigestEntry {
                    namespace: key.namespace.clone(),
                    key: key.key.clone(),
                    version: digest.version,
                    content_hash: digest.content_hash,
                })
                .collect(),
        };

        match WireMessage::Digest(batch).to_bytes() {
            Ok(payload) => {
                if let Err(e) = self.channel.send(payload) {
                    self.metrics.record_broadcast_failure();
                    warn!(error = %e, "digest broadcast failed; retrying next cycle");
                }
            }
            Err(e) => {
                self.metrics.record_broadcast_failure();
                warn!(error = %e, "digest batch could not be encoded");
            }
        }
    }

    fn prune_stale_peers(&self) {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(self.config.digest_ttl.as_millis() as u64);
        self.peers.retain(|_, digest| digest.seen_at > cutoff);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NullChannel;
    use crate::clock::ManualClock;
    use crate::config::{BusConfig, CacheConfig};
    use crate::entry::fx_hash;
    use crate::store::SetOptions;
    use std::time::Duration;

    struct Fixture {
        monitor: ConsistencyMonitor,
        store: Arc<CacheStore>,
        metrics: Arc<CacheMetrics>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let metrics = Arc::new(CacheMetrics::new());
        let store = Arc::new(
            CacheStore::new(&CacheConfig::default(), clock.clone(), metrics.clone()).unwrap(),
        );
        let channel: Arc<dyn BroadcastChannel> = Arc::new(NullChannel::new());
        let process_id = Uuid::new_v4();
        let bus = Arc::new(InvalidationBus::new(
            process_id,
            store.clone(),
            channel.clone(),
            metrics.clone(),
            clock.clone(),
            BusConfig::default(),
        ));
        let monitor = ConsistencyMonitor::new(
            process_id,
            store.clone(),
            bus,
            channel,
            metrics.clone(),
            clock.clone(),
            ConsistencyConfig::default(),
        );
        Fixture {
            monitor,
            store,
            metrics,
            clock,
        }
    }

    fn peer_batch(entries: Vec<DigestEntry>) -> DigestBatch {
        DigestBatch {
            origin_process_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            entries,
        }
    }

    #[test]
    fn test_agreeing_peers_score_full() {
        let f = fixture();
        f.store.set("dash", "stat", b"42", SetOptions::default()).unwrap();
        let digest = f.store.digest("dash", "stat").unwrap();

        f.monitor.ingest(peer_batch(vec![DigestEntry {
            namespace: "dash".into(),
            key: "stat".into(),
            version: digest.version,
            content_hash: digest.content_hash,
        }]));

        let snapshots = f.monitor.audit_now();
        assert!(snapshots.iter().all(|s| !s.divergent));
        assert_eq!(f.metrics.consistency_score(), 1.0);
        assert!(f.store.contains("dash", "stat"));
    }

    #[test]
    fn test_no_peer_evidence_counts_as_agreement() {
        let f = fixture();
        f.store.set("dash", "stat", b"42", SetOptions::default()).unwrap();

        let snapshots = f.monitor.audit_now();
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].divergent);
        assert_eq!(f.metrics.consistency_score(), 1.0);
    }

    #[test]
    fn test_stale_local_entry_is_dropped() {
        let f = fixture();
        f.store.set("dash", "stat", b"41", SetOptions::default()).unwrap();

        f.monitor.ingest(peer_batch(vec![DigestEntry {
            namespace: "dash".into(),
            key: "stat".into(),
            version: 5, // peer is ahead
            content_hash: fx_hash(b"42"),
        }]));

        let snapshots = f.monitor.audit_now();
        assert!(snapshots[0].divergent);
        assert_eq!(snapshots[0].remote_version, 5);
        assert!(!f.store.contains("dash", "stat"));
        assert_eq!(f.metrics.snapshot().divergences_repaired, 1);
        assert!(f.metrics.consistency_score() < 1.0);
    }

    #[test]
    fn test_equal_version_conflict_forces_cold_miss() {
        let f = fixture();
        f.store.set("dash", "stat", b"41", SetOptions::default()).unwrap();
        let local = f.store.digest("dash", "stat").unwrap();

        f.monitor.ingest(peer_batch(vec![DigestEntry {
            namespace: "dash".into(),
            key: "stat".into(),
            version: local.version,
            content_hash: fx_hash(b"different"),
        }]));

        let snapshots = f.monitor.audit_now();
        assert!(snapshots[0].divergent);
        // Repaired via a smart invalidation applied locally
        assert!(!f.store.contains("dash", "stat"));
        assert_eq!(f.metrics.snapshot().conflicts_repaired, 1);
        assert_eq!(f.metrics.snapshot().invalidations_applied, 1);
    }

    #[test]
    fn test_local_newer_than_peer_is_kept() {
        let f = fixture();
        f.store.set("dash", "stat", b"41", SetOptions::default()).unwrap();
        f.store.set("dash", "stat", b"42", SetOptions::default()).unwrap(); // version 2

        f.monitor.ingest(peer_batch(vec![DigestEntry {
            namespace: "dash".into(),
            key: "stat".into(),
            version: 1,
            content_hash: fx_hash(b"41"),
        }]));

        let snapshots = f.monitor.audit_now();
        assert!(!snapshots[0].divergent);
        assert!(f.store.contains("dash", "stat"));
    }

    #[test]
    fn test_own_digest_batches_are_ignored() {
        let f = fixture();
        f.store.set("dash", "stat", b"42", SetOptions::default()).unwrap();

        f.monitor.ingest(DigestBatch {
            origin_process_id: f.monitor.process_id,
            timestamp: Utc::now(),
            entries: vec![DigestEntry {
                namespace: "dash".into(),
                key: "stat".into(),
                version: 99,
                content_hash: 0,
            }],
        });

        assert_eq!(f.monitor.peer_evidence_len(), 0);
        let snapshots = f.monitor.audit_now();
        assert!(!snapshots[0].divergent);
    }

    #[test]
    fn test_stale_peer_evidence_expires() {
        let f = fixture();
        f.store.set("dash", "stat", b"41", SetOptions::default()).unwrap();

        f.monitor.ingest(peer_batch(vec![DigestEntry {
            namespace: "dash".into(),
            key: "stat".into(),
            version: 5,
            content_hash: 0,
        }]));

        // Evidence ages past the digest TTL before the audit runs
        f.clock.advance(Duration::from_secs(121));
        let snapshots = f.monitor.audit_now();

        assert!(!snapshots[0].divergent);
        assert!(f.store.contains("dash", "stat"));
    }
}
