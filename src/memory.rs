//! Memory Monitor
//!
//! Tracks approximate bytes occupied by cache entries, classifies memory
//! pressure against configured watermarks, and recommends eviction batch
//! sizes. Crossing into High or Critical is reported to the caller so the
//! store can run an immediate out-of-band eviction pass instead of waiting
//! for the next scheduled sweep.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use serde::Serialize;

use crate::config::MemoryConfig;

/// Memory pressure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    /// Below the medium watermark; no action
    Low,
    /// Between the medium and high watermarks; small eviction batches
    Medium,
    /// Between the high and critical watermarks; larger batches plus a
    /// compression pass over uncompressed entries
    High,
    /// At or above the critical watermark; aggressive batches plus a full
    /// expired sweep independent of the timer
    Critical,
}

impl PressureLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PressureLevel::Low,
            1 => PressureLevel::Medium,
            2 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PressureLevel::Low => 0,
            PressureLevel::Medium => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// Process-wide memory snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Bytes currently accounted to cache entries
    pub used_bytes: u64,
    /// Configured capacity in bytes
    pub capacity_bytes: u64,
    /// used / capacity, 0.0 - 1.0+
    pub utilization: f64,
    /// Current classification
    pub pressure: PressureLevel,
}

/// Outcome of a recorded size delta
#[derive(Debug, Clone, Copy)]
pub struct DeltaOutcome {
    /// Classification after the delta
    pub level: PressureLevel,
    /// True when the delta moved the level upward into High or Critical;
    /// the caller must react immediately rather than wait for the timer
    pub crossed_upward: bool,
}

/// Tracks cache-resident bytes and classifies pressure.
pub struct MemoryMonitor {
    config: MemoryConfig,
    used: AtomicI64,
    last_level: AtomicU8,
}

impl MemoryMonitor {
    /// Create a monitor with the given configuration
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            used: AtomicI64::new(0),
            last_level: AtomicU8::new(PressureLevel::Low.as_u8()),
        }
    }

    /// Record a signed change in cache-resident bytes.
    pub fn record_delta(&self, delta: i64) -> DeltaOutcome {
        self.used.fetch_add(delta, Ordering::Relaxed);

        let level = self.classify();
        let prev = PressureLevel::from_u8(
            self.last_level.swap(level.as_u8(), Ordering::Relaxed),
        );

        DeltaOutcome {
            level,
            crossed_upward: level > prev && level >= PressureLevel::High,
        }
    }

    /// Bytes currently accounted to the cache (never negative).
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed).max(0) as u64
    }

    /// Configured capacity
    pub fn capacity_bytes(&self) -> u64 {
        self.config.capacity_bytes
    }

    /// Current utilization, used / capacity
    pub fn utilization(&self) -> f64 {
        self.used_bytes() as f64 / self.config.capacity_bytes as f64
    }

    /// Classify current pressure against the configured watermarks.
    pub fn classify(&self) -> PressureLevel {
        let utilization = self.utilization();
        if utilization >= self.config.critical_watermark {
            PressureLevel::Critical
        } else if utilization >= self.config.high_watermark {
            PressureLevel::High
        } else if utilization >= self.config.medium_watermark {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }

    /// Eviction batch size appropriate to the current pressure.
    pub fn recommend_eviction_budget(&self) -> usize {
        match self.classify() {
            PressureLevel::Low => 0,
            PressureLevel::Medium => self.config.medium_batch,
            PressureLevel::High => self.config.high_batch,
            PressureLevel::Critical => self.config.critical_batch,
        }
    }

    /// Entries to re-examine in a High-pressure compression pass.
    pub fn compression_pass_limit(&self) -> usize {
        self.config.compression_pass_limit
    }

    /// Snapshot for reporting
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            used_bytes: self.used_bytes(),
            capacity_bytes: self.config.capacity_bytes,
            utilization: self.utilization(),
            pressure: self.classify(),
        }
    }

    /// Reset accounting to zero (store clear).
    pub fn reset(&self) {
        self.used.store(0, Ordering::Relaxed);
        self.last_level
            .store(PressureLevel::Low.as_u8(), Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(capacity: u64) -> MemoryMonitor {
        MemoryMonitor::new(MemoryConfig {
            capacity_bytes: capacity,
            ..Default::default()
        })
    }

    #[test]
    fn test_classification_bands() {
        let m = monitor(1000);

        m.record_delta(100);
        assert_eq!(m.classify(), PressureLevel::Low);

        m.record_delta(460); // 56%
        assert_eq!(m.classify(), PressureLevel::Medium);

        m.record_delta(240); // 80%
        assert_eq!(m.classify(), PressureLevel::High);

        m.record_delta(150); // 95%
        assert_eq!(m.classify(), PressureLevel::Critical);
    }

    #[test]
    fn test_budget_scales_with_pressure() {
        let m = monitor(1000);
        assert_eq!(m.recommend_eviction_budget(), 0);

        m.record_delta(600);
        assert_eq!(
            m.recommend_eviction_budget(),
            MemoryConfig::default().medium_batch
        );

        m.record_delta(250);
        assert_eq!(
            m.recommend_eviction_budget(),
            MemoryConfig::default().high_batch
        );

        m.record_delta(150);
        assert_eq!(
            m.recommend_eviction_budget(),
            MemoryConfig::default().critical_batch
        );
    }

    #[test]
    fn test_crossing_reported_once() {
        let m = monitor(1000);

        let outcome = m.record_delta(500);
        assert!(!outcome.crossed_upward);

        let outcome = m.record_delta(350); // into High
        assert!(outcome.crossed_upward);
        assert_eq!(outcome.level, PressureLevel::High);

        // Already High: further growth within the band is not a crossing
        let outcome = m.record_delta(10);
        assert!(!outcome.crossed_upward);

        let outcome = m.record_delta(100); // into Critical
        assert!(outcome.crossed_upward);
        assert_eq!(outcome.level, PressureLevel::Critical);
    }

    #[test]
    fn test_shrinking_is_never_a_crossing() {
        let m = monitor(1000);
        m.record_delta(960);
        let outcome = m.record_delta(-500);
        assert!(!outcome.crossed_upward);
        assert_eq!(outcome.level, PressureLevel::Low);
    }

    #[test]
    fn test_used_bytes_clamped_at_zero() {
        let m = monitor(1000);
        m.record_delta(100);
        m.record_delta(-300);
        assert_eq!(m.used_bytes(), 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let m = monitor(1000);
        m.record_delta(800);

        let stats = m.stats();
        assert_eq!(stats.used_bytes, 800);
        assert_eq!(stats.capacity_bytes, 1000);
        assert!((stats.utilization - 0.8).abs() < f64::EPSILON);
        assert_eq!(stats.pressure, PressureLevel::High);
    }
}
