//! Cache Metrics
//!
//! Lock-free counters shared by the store, bus, refresher, and consistency
//! monitor, with snapshot support for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic operation counters.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expired_removed: AtomicU64,
    encode_failures: AtomicU64,
    refresh_successes: AtomicU64,
    refresh_failures: AtomicU64,
    refresh_abandoned: AtomicU64,
    invalidations_applied: AtomicU64,
    events_deduplicated: AtomicU64,
    broadcast_failures: AtomicU64,
    divergences_repaired: AtomicU64,
    conflicts_repaired: AtomicU64,
    audit_sampled: AtomicU64,
    audit_agreeing: AtomicU64,
}

impl CacheMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expired(&self, count: u64) {
        self.expired_removed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_success(&self) {
        self.refresh_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_abandoned(&self) {
        self.refresh_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation_applied(&self) {
        self.invalidations_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_deduplicated(&self) {
        self.events_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast_failure(&self) {
        self.broadcast_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_divergence_repaired(&self) {
        self.divergences_repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict_repaired(&self) {
        self.conflicts_repaired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a consistency audit.
    pub fn record_audit(&self, sampled: u64, agreeing: u64) {
        self.audit_sampled.store(sampled, Ordering::Relaxed);
        self.audit_agreeing.store(agreeing, Ordering::Relaxed);
    }

    /// Hit rate over the process lifetime, 0.0 - 1.0.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Agreement ratio from the most recent audit; 1.0 before any audit ran.
    pub fn consistency_score(&self) -> f64 {
        let sampled = self.audit_sampled.load(Ordering::Relaxed);
        if sampled == 0 {
            return 1.0;
        }
        self.audit_agreeing.load(Ordering::Relaxed) as f64 / sampled as f64
    }

    /// Snapshot all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            refresh_abandoned: self.refresh_abandoned.load(Ordering::Relaxed),
            invalidations_applied: self.invalidations_applied.load(Ordering::Relaxed),
            events_deduplicated: self.events_deduplicated.load(Ordering::Relaxed),
            broadcast_failures: self.broadcast_failures.load(Ordering::Relaxed),
            divergences_repaired: self.divergences_repaired.load(Ordering::Relaxed),
            conflicts_repaired: self.conflicts_repaired.load(Ordering::Relaxed),
            consistency_score: self.consistency_score(),
        }
    }
}

/// Point-in-time view of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired_removed: u64,
    pub encode_failures: u64,
    pub refresh_successes: u64,
    pub refresh_failures: u64,
    pub refresh_abandoned: u64,
    pub invalidations_applied: u64,
    pub events_deduplicated: u64,
    pub broadcast_failures: u64,
    pub divergences_repaired: u64,
    pub conflicts_repaired: u64,
    pub consistency_score: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_rate(), 0.0);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        assert_eq!(metrics.hit_rate(), 0.75);
    }

    #[test]
    fn test_consistency_score_defaults_to_full_agreement() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.consistency_score(), 1.0);

        metrics.record_audit(10, 8);
        assert_eq!(metrics.consistency_score(), 0.8);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = CacheMetrics::new();
        metrics.record_set();
        metrics.record_set();
        metrics.record_evictions(5);
        metrics.record_invalidation_applied();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sets, 2);
        assert_eq!(snapshot.evictions, 5);
        assert_eq!(snapshot.invalidations_applied, 1);
        assert_eq!(snapshot.misses, 0);
    }
}
