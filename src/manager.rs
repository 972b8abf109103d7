//! Cache Manager - Engine Façade
//!
//! Composes the store, codec, TTL engine, memory monitor, invalidation bus,
//! background refresher, and consistency monitor behind the only API
//! application code calls directly. One manager per process; managers are
//! explicit instances owned by the composition root, never globals.
//!
//! Values are statically typed at the call site: `set` serializes with the
//! caller's `Serialize` impl, `get` deserializes with `DeserializeOwned`.
//! No runtime type inspection happens anywhere in the engine.
//!
//! # Degraded mode
//!
//! If the configured store is rejected at construction the manager falls
//! back to an in-memory store with safe defaults and flags `degraded = true`
//! in reports instead of failing every read and write. When degraded and a
//! [`FallbackStore`] was supplied, writes are mirrored to it and primary
//! misses consult it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastChannel, NullChannel};
use crate::bus::{
    InvalidationBus, InvalidationEvent, InvalidationMode, InvalidationTarget, WireMessage,
};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::consistency::{ConsistencyMonitor, ConsistencySnapshot};
use crate::error::{Error, Result};
use crate::fallback::FallbackStore;
use crate::memory::MemoryStats;
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::refresh::{BackgroundRefresher, Fetcher};
use crate::store::{CacheStore, SetOptions};

/// Identity shared by every manager in this OS process unless overridden.
/// Cooperating managers in one deployment must have distinct identities,
/// which `with_parts` supports for simulations.
static PROCESS_ID: Lazy<Uuid> = Lazy::new(Uuid::new_v4);

/// Top-level engine report.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    /// Lifetime hit rate, 0.0 - 1.0
    pub hit_rate: f64,
    /// Memory snapshot
    pub memory: MemoryStats,
    /// Agreement ratio from the most recent consistency audit
    pub consistency_score: f64,
    /// True when the manager is running on the fallback default store
    pub degraded: bool,
    /// Live entry count
    pub entries: usize,
    /// All operation counters
    pub counters: MetricsSnapshot,
}

/// The adaptive cache engine façade.
pub struct CacheManager {
    process_id: Uuid,
    store: Arc<CacheStore>,
    bus: Arc<InvalidationBus>,
    refresher: Arc<BackgroundRefresher>,
    consistency: Arc<ConsistencyMonitor>,
    metrics: Arc<CacheMetrics>,
    channel: Arc<dyn BroadcastChannel>,
    fallback: Option<Arc<dyn FallbackStore>>,
    degraded: bool,
    config: CacheConfig,
    shutdown: CancellationToken,
}

impl CacheManager {
    /// Create a manager with default configuration on the given channel.
    pub fn new(channel: Arc<dyn BroadcastChannel>) -> Self {
        Self::with_config(CacheConfig::default(), channel)
    }

    /// Create a manager with custom configuration.
    pub fn with_config(config: CacheConfig, channel: Arc<dyn BroadcastChannel>) -> Self {
        Self::with_parts(config, channel, Arc::new(SystemClock), None, *PROCESS_ID)
    }

    /// Create a fully isolated manager (for tests and single-process use).
    pub fn in_memory() -> Self {
        Self::with_parts(
            CacheConfig::default(),
            Arc::new(NullChannel::new()),
            Arc::new(SystemClock),
            None,
            Uuid::new_v4(),
        )
    }

    /// Full constructor: explicit clock, optional fallback store, and
    /// process identity.
    pub fn with_parts(
        config: CacheConfig,
        channel: Arc<dyn BroadcastChannel>,
        clock: Arc<dyn Clock>,
        fallback: Option<Arc<dyn FallbackStore>>,
        process_id: Uuid,
    ) -> Self {
        let metrics = Arc::new(CacheMetrics::new());

        let (store, degraded, config) =
            match CacheStore::new(&config, clock.clone(), metrics.clone()) {
                Ok(store) => (store, false, config),
                Err(e) => {
                    error!(error = %e, "store initialization failed; running degraded");
                    let defaults = CacheConfig::default();
                    let store = CacheStore::new(&defaults, clock.clone(), metrics.clone())
                        .expect("default configuration must validate");
                    (store, true, defaults)
                }
            };
        let store = Arc::new(store);

        let bus = Arc::new(InvalidationBus::new(
            process_id,
            store.clone(),
            channel.clone(),
            metrics.clone(),
            clock.clone(),
            config.bus.clone(),
        ));

        let refresher = Arc::new(BackgroundRefresher::new(
            store.clone(),
            metrics.clone(),
            clock.clone(),
            config.refresh.clone(),
        ));

        let consistency = Arc::new(ConsistencyMonitor::new(
            process_id,
            store.clone(),
            bus.clone(),
            channel.clone(),
            metrics.clone(),
            clock.clone(),
            config.consistency.clone(),
        ));

        Self {
            process_id,
            store,
            bus,
            refresher,
            consistency,
            metrics,
            channel,
            fallback,
            degraded,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    // =========================================================================
    // Caller-facing API
    // =========================================================================

    /// Look up a typed value.
    ///
    /// Misses never fail: absence, expiry, and namespace gaps all yield
    /// `Ok(None)`. Only a corrupt stored payload surfaces an error.
    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        if let Some(bytes) = self.store.get(namespace, key)? {
            return Self::decode_value(namespace, key, &bytes).map(Some);
        }

        if self.degraded {
            if let Some(fallback) = &self.fallback {
                match fallback.get(namespace, key).await {
                    Ok(Some(bytes)) => {
                        return Self::decode_value(namespace, key, &bytes).map(Some)
                    }
                    Ok(None) => {}
                    Err(e) => warn!(namespace, key, error = %e, "fallback read failed"),
                }
            }
        }

        Ok(None)
    }

    /// Store a typed value.
    ///
    /// Serialization or codec round-trip failure fails the call with nothing
    /// stored, so the caller can retry with a different payload.
    pub async fn set<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<()> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| Error::encode(format!("value serialization: {e}")))?;

        self.store.set(namespace, key, &raw, options)?;

        if self.degraded {
            if let Some(fallback) = &self.fallback {
                if let Err(e) = fallback.set(namespace, key, Bytes::from(raw)).await {
                    warn!(namespace, key, error = %e, "fallback write failed");
                }
            }
        }

        Ok(())
    }

    /// Remove a key. Idempotent, never fails for absence.
    pub async fn delete(&self, namespace: &str, key: &str) {
        self.store.delete(namespace, key);

        if self.degraded {
            if let Some(fallback) = &self.fallback {
                if let Err(e) = fallback.delete(namespace, key).await {
                    warn!(namespace, key, error = %e, "fallback delete failed");
                }
            }
        }
    }

    /// Publish an invalidation: applied locally exactly once and broadcast
    /// to peer processes.
    ///
    /// Smart mode removes only the targeted keys/namespace; comprehensive
    /// mode clears the namespace (key targets escalate to their namespace)
    /// or the whole store.
    pub fn invalidate(
        &self,
        target: InvalidationTarget,
        mode: InvalidationMode,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        let event = match (target, mode) {
            (InvalidationTarget::Keys { namespace, keys }, InvalidationMode::Smart) => {
                InvalidationEvent::smart_keys(namespace, keys, reason, self.process_id)
            }
            (InvalidationTarget::Namespace(namespace), InvalidationMode::Smart) => {
                InvalidationEvent::smart_namespace(namespace, reason, self.process_id)
            }
            (InvalidationTarget::Keys { namespace, .. }, InvalidationMode::Comprehensive) => {
                debug!(namespace = %namespace, "comprehensive invalidation escalates key target to namespace");
                InvalidationEvent::comprehensive_namespace(namespace, reason, self.process_id)
            }
            (InvalidationTarget::Namespace(namespace), InvalidationMode::Comprehensive) => {
                InvalidationEvent::comprehensive_namespace(namespace, reason, self.process_id)
            }
            (InvalidationTarget::All, _) => {
                InvalidationEvent::comprehensive_all(reason, self.process_id)
            }
        };
        self.bus.publish(event);
    }

    /// Register an entry for background refresh.
    pub fn register_refreshable(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        refresh_margin: Duration,
    ) {
        self.refresher.register(namespace, key, fetcher, refresh_margin);
    }

    /// Register a refreshable with set options re-applied on every refresh.
    pub fn register_refreshable_with_options(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        refresh_margin: Duration,
        options: SetOptions,
    ) {
        self.refresher
            .register_with_options(namespace, key, fetcher, refresh_margin, options);
    }

    /// Run a consistency audit immediately, outside the timer.
    pub fn audit_now(&self) -> Vec<ConsistencySnapshot> {
        self.consistency.audit_now()
    }

    /// Engine report: hit rate, memory, consistency, degraded flag.
    pub fn metrics(&self) -> CacheReport {
        CacheReport {
            hit_rate: self.metrics.hit_rate(),
            memory: self.store.memory().stats(),
            consistency_score: self.metrics.consistency_score(),
            degraded: self.degraded,
            entries: self.store.len(),
            counters: self.metrics.snapshot(),
        }
    }

    /// This process's identity on the wire
    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// True when running on the fallback default store
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Store handle (advanced use and tests)
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Bus handle (advanced use and tests)
    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    /// Refresher handle (advanced use and tests)
    pub fn refresher(&self) -> &Arc<BackgroundRefresher> {
        &self.refresher
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Spawn the engine's background tasks: the broadcast receive loop, the
    /// expired-entry sweep, the refresh scan, the consistency audit, and the
    /// dedup-window prune. Idempotent only in the sense that calling twice
    /// doubles the timers; call once from the composition root.
    pub fn start(&self) {
        self.spawn_receive_loop();
        self.spawn_sweep_loop();
        self.spawn_refresh_loop();
        self.spawn_audit_loop();
        info!(process = %self.process_id, degraded = self.degraded, "cache engine started");
    }

    /// Cancel all background tasks.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn spawn_receive_loop(&self) {
        let mut rx = self.channel.subscribe();
        let bus = self.bus.clone();
        let consistency = self.consistency.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = rx.recv() => match message {
                        Ok(payload) => match WireMessage::from_bytes(&payload) {
                            Ok(WireMessage::Invalidation(event)) => bus.handle_remote(event),
                            Ok(WireMessage::Digest(batch)) => consistency.ingest(batch),
                            Err(e) => warn!(error = %e, "unintelligible broadcast payload"),
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            // Loss is tolerated; the periodic audit reconciles.
                            warn!(skipped, "broadcast receiver lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn spawn_sweep_loop(&self) {
        let period = self.config.sweep_interval;
        if period.is_zero() {
            return;
        }
        let store = self.store.clone();
        let bus = self.bus.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            // First tick one full period out; nothing useful to do at startup
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep_expired();
                        bus.prune_dedup_window();
                        let budget = store.memory().recommend_eviction_budget();
                        if budget > 0 {
                            store.relieve_pressure(store.memory().classify());
                        }
                    }
                }
            }
        });
    }

    fn spawn_refresh_loop(&self) {
        let period = self.config.refresh.interval;
        if period.is_zero() {
            return;
        }
        let refresher = self.refresher.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            // First tick one full period out; nothing useful to do at startup
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        refresher.run_once().await;
                    }
                }
            }
        });
    }

    fn spawn_audit_loop(&self) {
        let period = self.config.consistency.interval;
        if period.is_zero() {
            return;
        }
        let consistency = self.consistency.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            // First tick one full period out; nothing useful to do at startup
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        consistency.audit_now();
                    }
                }
            }
        });
    }

    fn decode_value<T: DeserializeOwned>(namespace: &str, key: &str, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::decode(namespace, key, e.to_string()))
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("process_id", &self.process_id)
            .field("degraded", &self.degraded)
            .field("entries", &self.store.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
