//! Background Refresher
//!
//! Periodically re-fetches registered entries nearing expiry so readers
//! rarely observe a cold miss. A failed fetch leaves the stale entry in
//! place until natural expiry (stale-while-revalidate) and retries on the
//! next tick; after a bounded number of consecutive failures the
//! registration is dropped with a permanent-failure signal. Refreshes only
//! ever call the store's public, serialized operations, so they never block
//! a concurrent read.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::config::RefreshConfig;
use crate::entry::EntryKey;
use crate::error::Result;
use crate::metrics::CacheMetrics;
use crate::store::{CacheStore, SetOptions};

/// Caller-supplied backend fetch for one refreshable entry.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the current backend value for `namespace`/`key`.
    async fn fetch(&self, namespace: &str, key: &str) -> Result<Bytes>;
}

/// A registered refreshable entry.
struct Registration {
    fetcher: Arc<dyn Fetcher>,
    refresh_margin: Duration,
    options: SetOptions,
    consecutive_failures: u32,
}

/// Scans registrations on a fixed interval, refreshing entries whose
/// remaining TTL is inside their margin.
pub struct BackgroundRefresher {
    store: Arc<CacheStore>,
    metrics: Arc<CacheMetrics>,
    clock: Arc<dyn Clock>,
    config: RefreshConfig,
    registrations: DashMap<EntryKey, Registration>,
}

impl BackgroundRefresher {
    /// Create a refresher over a store.
    pub fn new(
        store: Arc<CacheStore>,
        metrics: Arc<CacheMetrics>,
        clock: Arc<dyn Clock>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            clock,
            config,
            registrations: DashMap::new(),
        }
    }

    /// Register an entry for background refresh. The fetched value is
    /// re-stored with default set options.
    pub fn register(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        refresh_margin: Duration,
    ) {
        self.register_with_options(namespace, key, fetcher, refresh_margin, SetOptions::default());
    }

    /// Register with explicit set options re-applied on every refresh
    /// (dependencies, tags, TTL hint).
    pub fn register_with_options(
        &self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        refresh_margin: Duration,
        options: SetOptions,
    ) {
        self.registrations.insert(
            EntryKey::new(namespace, key),
            Registration {
                fetcher,
                refresh_margin,
                options,
                consecutive_failures: 0,
            },
        );
    }

    /// Drop a registration. Idempotent.
    pub fn unregister(&self, namespace: &str, key: &str) -> bool {
        self.registrations
            .remove(&EntryKey::new(namespace, key))
            .is_some()
    }

    /// Number of active registrations
    pub fn registered_len(&self) -> usize {
        self.registrations.len()
    }

    /// Run one refresh cycle, returning the number of successful refreshes.
    ///
    /// A fetch that errors or exceeds the configured timeout counts as one
    /// failed attempt for this tick; the entry keeps serving stale until its
    /// natural expiry and the fetch is retried next tick.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> usize {
        let now = self.clock.now_millis();

        // Snapshot due work before awaiting anything
        let due: Vec<(EntryKey, Arc<dyn Fetcher>, SetOptions)> = self
            .registrations
            .iter()
            .filter(|item| {
                let margin_ms = item.value().refresh_margin.as_millis() as u64;
                match self.store.expires_at(&item.key().namespace, &item.key().key) {
                    // Remaining TTL within the margin
                    Some(expires_at) => expires_at.saturating_sub(now) <= margin_ms,
                    // Entry expired or was never filled: due immediately
                    None => true,
                }
            })
            .map(|item| {
                (
                    item.key().clone(),
                    item.value().fetcher.clone(),
                    item.value().options.clone(),
                )
            })
            .collect();

        // Fetches run concurrently; each is bounded by the per-attempt
        // timeout so one slow backend cannot stall the whole tick.
        let fetch_timeout = self.config.fetch_timeout;
        let outcomes = futures::future::join_all(due.into_iter().map(
            |(key, fetcher, options)| async move {
                let outcome =
                    tokio::time::timeout(fetch_timeout, fetcher.fetch(&key.namespace, &key.key))
                        .await;
                (key, options, outcome)
            },
        ))
        .await;

        let mut refreshed = 0;
        for (key, options, outcome) in outcomes {
            match outcome {
                Ok(Ok(value)) => {
                    match self.store.set(&key.namespace, &key.key, &value, options) {
                        Ok(()) => {
                            refreshed += 1;
                            self.metrics.record_refresh_success();
                            if let Some(mut reg) = self.registrations.get_mut(&key) {
                                reg.consecutive_failures = 0;
                            }
                            debug!(key = %key, "entry refreshed");
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "refreshed value failed to store");
                            self.record_failure(&key);
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(key = %key, error = %e, "refresh fetch failed; serving stale");
                    self.record_failure(&key);
                }
                Err(_) => {
                    debug!(key = %key, timeout = ?self.config.fetch_timeout,
                        "refresh fetch timed out; retrying next tick");
                    self.record_failure(&key);
                }
            }
        }

        refreshed
    }

    fn record_failure(&self, key: &EntryKey) {
        self.metrics.record_refresh_failure();

        let abandoned = match self.registrations.get_mut(key) {
            Some(mut reg) => {
                reg.consecutive_failures += 1;
                reg.consecutive_failures >= self.config.max_retries
            }
            None => false,
        };

        if abandoned {
            self.registrations.remove(key);
            self.metrics.record_refresh_abandoned();
            warn!(key = %key, retries = self.config.max_retries,
                "refresh permanently failed; registration dropped");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<Bytes>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<Bytes>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, namespace: &str, key: &str) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::fetch(namespace, key, "script exhausted")))
        }
    }

    struct StallingFetcher;

    #[async_trait]
    impl Fetcher for StallingFetcher {
        async fn fetch(&self, _namespace: &str, _key: &str) -> Result<Bytes> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Bytes::from_static(b"never"))
        }
    }

    struct Fixture {
        refresher: BackgroundRefresher,
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
        let refresher = BackgroundRefresher::new(
            store.clone(),
            metrics.clone(),
            clock.clone(),
            RefreshConfig::default(),
        );
        Fixture {
            refresher,
            store,
            metrics,
            clock,
        }
    }

    #[tokio::test]
    async fn test_refresh_extends_ttl() {
        let f = fixture();
        f.store
            .set("dash", "stat", b"41", SetOptions::with_ttl(Duration::from_secs(30)))
            .unwrap();
        let before = f.store.expires_at("dash", "stat").unwrap();

        let fetcher = ScriptedFetcher::new(vec![Ok(Bytes::from_static(b"42"))]);
        f.refresher.register_with_options(
            "dash",
            "stat",
            fetcher,
            Duration::from_secs(60), // margin larger than remaining TTL
            SetOptions::with_ttl(Duration::from_secs(30)),
        );

        f.clock.advance(Duration::from_secs(5));
        assert_eq!(f.refresher.run_once().await, 1);

        let after = f.store.expires_at("dash", "stat").unwrap();
        assert!(after > before, "expiry must strictly extend on refresh");
        assert_eq!(
            f.store.get("dash", "stat").unwrap().unwrap().as_ref(),
            b"42"
        );
    }

    #[tokio::test]
    async fn test_entries_outside_margin_are_left_alone() {
        let f = fixture();
        f.store
            .set("dash", "stat", b"41", SetOptions::with_ttl(Duration::from_secs(3600)))
            .unwrap();

        let fetcher = ScriptedFetcher::new(vec![Ok(Bytes::from_static(b"42"))]);
        f.refresher
            .register("dash", "stat", fetcher.clone(), Duration::from_secs(10));

        assert_eq!(f.refresher.run_once().await, 0);
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(
            f.store.get("dash", "stat").unwrap().unwrap().as_ref(),
            b"41"
        );
    }

    #[tokio::test]
    async fn test_missing_entry_is_due_immediately() {
        let f = fixture();
        let fetcher = ScriptedFetcher::new(vec![Ok(Bytes::from_static(b"cold-fill"))]);
        f.refresher
            .register("dash", "stat", fetcher, Duration::from_secs(10));

        assert_eq!(f.refresher.run_once().await, 1);
        assert_eq!(
            f.store.get("dash", "stat").unwrap().unwrap().as_ref(),
            b"cold-fill"
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_serves_stale_until_expiry() {
        let f = fixture();
        f.store
            .set("dash", "stat", b"stale", SetOptions::with_ttl(Duration::from_secs(30)))
            .unwrap();

        let fetcher = ScriptedFetcher::new(vec![Err(Error::fetch("dash", "stat", "boom"))]);
        f.refresher
            .register("dash", "stat", fetcher, Duration::from_secs(60));

        assert_eq!(f.refresher.run_once().await, 0);
        // The stale value keeps serving
        assert_eq!(
            f.store.get("dash", "stat").unwrap().unwrap().as_ref(),
            b"stale"
        );
        assert_eq!(f.metrics.snapshot().refresh_failures, 1);
        assert_eq!(f.refresher.registered_len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_retries_then_unregistration() {
        let f = fixture();
        let fetcher = ScriptedFetcher::new(vec![
            Err(Error::fetch("dash", "stat", "1")),
            Err(Error::fetch("dash", "stat", "2")),
            Err(Error::fetch("dash", "stat", "3")),
        ]);
        f.refresher
            .register("dash", "stat", fetcher.clone(), Duration::from_secs(10));

        for _ in 0..3 {
            f.refresher.run_once().await;
        }

        assert_eq!(f.refresher.registered_len(), 0);
        assert_eq!(f.metrics.snapshot().refresh_abandoned, 1);
        assert_eq!(fetcher.calls(), 3);

        // Dropped registration is never fetched again
        f.refresher.run_once().await;
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let f = fixture();
        let fetcher = ScriptedFetcher::new(vec![
            Err(Error::fetch("dash", "stat", "1")),
            Err(Error::fetch("dash", "stat", "2")),
            Ok(Bytes::from_static(b"recovered")),
            Err(Error::fetch("dash", "stat", "3")),
        ]);
        f.refresher
            .register("dash", "stat", fetcher, Duration::from_secs(10));

        for _ in 0..4 {
            f.refresher.run_once().await;
        }

        // Two failures, a success, one failure: streak never hit three
        assert_eq!(f.refresher.registered_len(), 1);
        assert_eq!(f.metrics.snapshot().refresh_abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_fetch_counts_as_failed_attempt() {
        let f = fixture();
        f.refresher
            .register("dash", "stat", Arc::new(StallingFetcher), Duration::from_secs(10));

        assert_eq!(f.refresher.run_once().await, 0);
        assert_eq!(f.metrics.snapshot().refresh_failures, 1);
        // Not yet abandoned; it retries next tick
        assert_eq!(f.refresher.registered_len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let f = fixture();
        let fetcher = ScriptedFetcher::new(vec![]);
        f.refresher
            .register("dash", "stat", fetcher, Duration::from_secs(10));

        assert!(f.refresher.unregister("dash", "stat"));
        assert!(!f.refresher.unregister("dash", "stat"));
    }
}
