//! Adaptive TTL Engine
//!
//! Computes a time-to-live for each write from per-namespace data-volatility
//! signals. Namespaces that are overwritten frequently get seconds-scale
//! TTLs; reference data that rarely changes gets hour-scale TTLs. An explicit
//! caller hint always wins. A namespace with no observed writes gets a
//! conservative medium TTL so staleness cannot grow without bound from pure
//! inference failure.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::Clock;
use crate::config::TtlConfig;

/// Rolling write observation for one namespace.
#[derive(Debug, Clone)]
struct WriteWindow {
    /// Start of the current observation window (millis)
    started_at: u64,
    /// Writes seen in the current window
    count: u64,
    /// Writes-per-minute over the last completed window
    completed_rate: Option<f64>,
}

/// Per-namespace write-rate tracker driving TTL selection.
pub struct AdaptiveTtlEngine {
    config: TtlConfig,
    clock: Arc<dyn Clock>,
    windows: DashMap<String, WriteWindow>,
}

impl AdaptiveTtlEngine {
    /// Create a new engine
    pub fn new(config: TtlConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: DashMap::new(),
        }
    }

    /// Record a write arrival for a namespace. Called by the store on every
    /// `set` before the TTL for that write is computed.
    pub fn record_write(&self, namespace: &str) {
        let now = self.clock.now_millis();
        let window_ms = self.config.observation_window.as_millis() as u64;

        let mut entry = self
            .windows
            .entry(namespace.to_string())
            .or_insert_with(|| WriteWindow {
                started_at: now,
                count: 0,
                completed_rate: None,
            });

        if now.saturating_sub(entry.started_at) >= window_ms {
            entry.completed_rate = Some(Self::per_minute(entry.count, window_ms));
            entry.started_at = now;
            entry.count = 1;
        } else {
            entry.count += 1;
        }
    }

    /// Observed writes-per-minute for a namespace, if any writes were seen.
    ///
    /// The partial current window is normalized over the full window length
    /// so a single early write does not read as a burst; the faster of the
    /// current and last completed window is used so real bursts register
    /// within one window.
    pub fn observed_rate(&self, namespace: &str) -> Option<f64> {
        let window_ms = self.config.observation_window.as_millis() as u64;
        self.windows.get(namespace).map(|w| {
            let current = Self::per_minute(w.count, window_ms);
            match w.completed_rate {
                Some(completed) => current.max(completed),
                None => current,
            }
        })
    }

    /// Compute the TTL for a write into `namespace`.
    pub fn compute_ttl(&self, namespace: &str, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }

        let rate = match self.observed_rate(namespace) {
            Some(rate) => rate,
            None => return self.config.default_ttl,
        };

        let volatile = self.config.volatile_writes_per_min;
        let stable = self.config.stable_writes_per_min;

        if rate >= volatile {
            self.config.min_ttl
        } else if rate <= stable {
            self.config.max_ttl
        } else {
            // Linear band between the stable and volatile thresholds.
            let t = (rate - stable) / (volatile - stable);
            let span = self.config.max_ttl.saturating_sub(self.config.min_ttl);
            self.config.max_ttl - span.mul_f64(t)
        }
    }

    /// Drop observation state for a namespace (whole-namespace invalidation).
    pub fn forget(&self, namespace: &str) {
        self.windows.remove(namespace);
    }

    fn per_minute(count: u64, window_ms: u64) -> f64 {
        if window_ms == 0 {
            return 0.0;
        }
        count as f64 * 60_000.0 / window_ms as f64
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn engine() -> (AdaptiveTtlEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let engine = AdaptiveTtlEngine::new(TtlConfig::default(), clock.clone());
        (engine, clock)
    }

    #[test]
    fn test_unobserved_namespace_gets_default() {
        let (engine, _) = engine();
        assert_eq!(
            engine.compute_ttl("never-written", None),
            TtlConfig::default().default_ttl
        );
    }

    #[test]
    fn test_hint_always_overrides() {
        let (engine, _) = engine();
        for _ in 0..100 {
            engine.record_write("busy");
        }
        assert_eq!(
            engine.compute_ttl("busy", Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_volatile_namespace_gets_short_ttl() {
        let (engine, clock) = engine();
        // 60 writes spread over the 60s window: 60/min, well over volatile
        for _ in 0..60 {
            engine.record_write("counters");
            clock.advance(Duration::from_millis(500));
        }
        assert_eq!(
            engine.compute_ttl("counters", None),
            TtlConfig::default().min_ttl
        );
    }

    #[test]
    fn test_stable_namespace_gets_long_ttl() {
        let (engine, _) = engine();
        engine.record_write("reference");
        assert_eq!(
            engine.compute_ttl("reference", None),
            TtlConfig::default().max_ttl
        );
    }

    #[test]
    fn test_intermediate_rate_lands_between_bounds() {
        let (engine, _) = engine();
        // 10 writes in the current 60s window: 10/min, between 1 and 30
        for _ in 0..10 {
            engine.record_write("mixed");
        }

        let ttl = engine.compute_ttl("mixed", None);
        let config = TtlConfig::default();
        assert!(ttl > config.min_ttl, "got {ttl:?}");
        assert!(ttl < config.max_ttl, "got {ttl:?}");
    }

    #[test]
    fn test_rate_survives_window_rotation() {
        let (engine, clock) = engine();
        for _ in 0..60 {
            engine.record_write("busy");
        }
        // Rotate into a new window; the completed window's rate still counts.
        clock.advance(Duration::from_secs(61));
        engine.record_write("busy");

        assert_eq!(
            engine.compute_ttl("busy", None),
            TtlConfig::default().min_ttl
        );
    }

    #[test]
    fn test_forget_resets_to_default() {
        let (engine, _) = engine();
        for _ in 0..100 {
            engine.record_write("ns");
        }
        engine.forget("ns");
        assert_eq!(
            engine.compute_ttl("ns", None),
            TtlConfig::default().default_ttl
        );
    }
}
