//! Invalidation Bus
//!
//! Routes targeted ("smart") and blanket ("comprehensive") invalidation
//! events to the local store and rebroadcasts them to peer processes. Every
//! event is applied exactly once per process: the bus deduplicates by
//! `(originProcessId, timestamp)` within a short window, so a process that
//! both emits and receives its own event (broadcast echo) does not
//! double-apply it.
//!
//! The serialized [`InvalidationEvent`] is the engine's only wire-visible
//! protocol; its field names are preserved exactly for cross-process
//! interoperability within a deployment.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcast::BroadcastChannel;
use crate::clock::Clock;
use crate::config::BusConfig;
use crate::consistency::DigestBatch;
use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;
use crate::store::CacheStore;

// =============================================================================
// Wire Types
// =============================================================================

/// Invalidation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationMode {
    /// Remove only the listed keys/namespace, preserving everything else
    Smart,
    /// Clear an entire namespace or the whole store; reserved for events
    /// where cache identity itself changed
    Comprehensive,
}

/// The event exchanged over the broadcast channel. Field-for-field wire
/// compatibility matters here; do not rename fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    /// Smart or comprehensive
    pub mode: InvalidationMode,
    /// Target namespace, absent for whole-store comprehensive events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Target keys within `namespace`, absent for namespace-level events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    /// Human-readable cause, carried for auditing
    pub reason: String,
    /// Identity of the emitting process
    pub origin_process_id: Uuid,
    /// Emission time; with the origin id, the per-process dedup identity
    pub timestamp: DateTime<Utc>,
}

impl InvalidationEvent {
    /// Smart invalidation of specific keys
    pub fn smart_keys(
        namespace: impl Into<String>,
        keys: Vec<String>,
        reason: impl Into<String>,
        origin: Uuid,
    ) -> Self {
        Self {
            mode: InvalidationMode::Smart,
            namespace: Some(namespace.into()),
            keys: Some(keys),
            reason: reason.into(),
            origin_process_id: origin,
            timestamp: Utc::now(),
        }
    }

    /// Smart invalidation of a whole namespace
    pub fn smart_namespace(
        namespace: impl Into<String>,
        reason: impl Into<String>,
        origin: Uuid,
    ) -> Self {
        Self {
            mode: InvalidationMode::Smart,
            namespace: Some(namespace.into()),
            keys: None,
            reason: reason.into(),
            origin_process_id: origin,
            timestamp: Utc::now(),
        }
    }

    /// Comprehensive invalidation of a namespace
    pub fn comprehensive_namespace(
        namespace: impl Into<String>,
        reason: impl Into<String>,
        origin: Uuid,
    ) -> Self {
        Self {
            mode: InvalidationMode::Comprehensive,
            namespace: Some(namespace.into()),
            keys: None,
            reason: reason.into(),
            origin_process_id: origin,
            timestamp: Utc::now(),
        }
    }

    /// Comprehensive invalidation of the entire store
    pub fn comprehensive_all(reason: impl Into<String>, origin: Uuid) -> Self {
        Self {
            mode: InvalidationMode::Comprehensive,
            namespace: None,
            keys: None,
            reason: reason.into(),
            origin_process_id: origin,
            timestamp: Utc::now(),
        }
    }

    /// Dedup identity: `(originProcessId, timestamp)`. Microsecond
    /// precision, so events emitted back-to-back by one process keep
    /// distinct identities.
    pub fn dedup_key(&self) -> (Uuid, i64) {
        (self.origin_process_id, self.timestamp.timestamp_micros())
    }
}

/// Envelope for everything crossing the broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WireMessage {
    /// An invalidation event
    Invalidation(InvalidationEvent),
    /// A consistency digest batch
    Digest(DigestBatch),
}

impl WireMessage {
    /// Serialize for the channel
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::Broadcast(format!("encode: {e}")))
    }

    /// Deserialize from the channel
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::Broadcast(format!("decode: {e}")))
    }
}

/// Invalidation target as seen by the caller-facing API.
#[derive(Debug, Clone)]
pub enum InvalidationTarget {
    /// A whole namespace
    Namespace(String),
    /// Specific keys within a namespace
    Keys {
        /// Namespace holding the keys
        namespace: String,
        /// Keys to invalidate
        keys: Vec<String>,
    },
    /// The entire store
    All,
}

// =============================================================================
// Bus
// =============================================================================

type Handler = Box<dyn Fn(&InvalidationEvent) + Send + Sync>;

/// Routes invalidation events: applies them to the local store exactly once
/// and rebroadcasts locally published events to peer processes.
pub struct InvalidationBus {
    process_id: Uuid,
    store: Arc<CacheStore>,
    channel: Arc<dyn BroadcastChannel>,
    metrics: Arc<CacheMetrics>,
    clock: Arc<dyn Clock>,
    config: BusConfig,
    /// `(origin, timestamp)` pairs seen within the dedup window
    seen: DashMap<(Uuid, i64), u64>,
    handlers: RwLock<Vec<Handler>>,
}

impl InvalidationBus {
    /// Create a bus for one process.
    pub fn new(
        process_id: Uuid,
        store: Arc<CacheStore>,
        channel: Arc<dyn BroadcastChannel>,
        metrics: Arc<CacheMetrics>,
        clock: Arc<dyn Clock>,
        config: BusConfig,
    ) -> Self {
        Self {
            process_id,
            store,
            channel,
            metrics,
            clock,
            config,
            seen: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// This process's identity on the wire
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Register a handler invoked synchronously, in delivery order, after
    /// each event is applied.
    pub fn subscribe(&self, handler: impl Fn(&InvalidationEvent) + Send + Sync + 'static) {
        self.handlers.write().push(Box::new(handler));
    }

    /// Publish an event: apply locally, then rebroadcast. The local apply
    /// and the broadcast echo share one dedup identity, so the event takes
    /// effect exactly once here regardless of echo behavior.
    pub fn publish(&self, event: InvalidationEvent) {
        self.apply_once(&event);

        match WireMessage::Invalidation(event).to_bytes() {
            Ok(payload) => {
                if let Err(e) = self.channel.send(payload) {
                    self.metrics.record_broadcast_failure();
                    warn!(error = %e, "invalidation broadcast failed; audit will reconcile");
                }
            }
            Err(e) => {
                self.metrics.record_broadcast_failure();
                warn!(error = %e, "invalidation event could not be encoded");
            }
        }
    }

    /// Apply an event received from the broadcast channel.
    pub fn handle_remote(&self, event: InvalidationEvent) {
        self.apply_once(&event);
    }

    /// Apply unless this `(origin, timestamp)` was already seen. Returns
    /// whether the event took effect.
    fn apply_once(&self, event: &InvalidationEvent) -> bool {
        let now = self.clock.now_millis();
        let first_sighting = {
            use dashmap::mapref::entry::Entry;
            match self.seen.entry(event.dedup_key()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(now);
                    true
                }
            }
        };

        if !first_sighting {
            self.metrics.record_event_deduplicated();
            return false;
        }

        let removed = match (event.mode, &event.namespace, &event.keys) {
            (InvalidationMode::Smart, Some(namespace), Some(keys)) => {
                self.store.invalidate_keys(namespace, keys)
            }
            (InvalidationMode::Smart, Some(namespace), None) => {
                self.store.invalidate_namespace(namespace)
            }
            (InvalidationMode::Comprehensive, Some(namespace), _) => {
                self.store.invalidate_namespace(namespace)
            }
            (InvalidationMode::Comprehensive, None, _) => {
                self.store.clear();
                0
            }
            (InvalidationMode::Smart, None, _) => {
                warn!(origin = %event.origin_process_id,
                    "smart invalidation without a namespace; ignoring");
                return false;
            }
        };

        self.metrics.record_invalidation_applied();
        debug!(mode = ?event.mode, namespace = ?event.namespace, removed,
            reason = %event.reason, "invalidation applied");

        for handler in self.handlers.read().iter() {
            handler(event);
        }
        true
    }

    /// Drop dedup records older than the configured window. Run on a timer.
    pub fn prune_dedup_window(&self) {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(self.config.dedup_window.as_millis() as u64);
        self.seen.retain(|_, seen_at| *seen_at > cutoff);
    }

    /// Dedup records currently held (observability)
    pub fn dedup_window_len(&self) -> usize {
        self.seen.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
