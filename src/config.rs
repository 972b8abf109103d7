//! Engine Configuration
//!
//! Every numeric policy in the engine (pressure thresholds, compression
//! benefit cutoff, TTL bands, timer intervals) is a configuration field with
//! a production default, not a constant. `CacheConfig::validate` is the gate
//! that decides between a healthy store and degraded mode.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default store capacity (256 MB)
pub const DEFAULT_CAPACITY: u64 = 256 * 1024 * 1024;

/// Codec configuration
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Algorithm applied to values above `min_size_bytes`
    pub algorithm: CodecAlgorithm,
    /// Values smaller than this are stored raw
    pub min_size_bytes: usize,
    /// Keep the encoded form only if `encoded < benefit_ratio * raw`
    pub benefit_ratio: f64,
    /// Verify decode(encode(v)) == v before reporting a compressed entry
    pub verify_roundtrip: bool,
}

/// Supported codec algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecAlgorithm {
    /// Byte-level run-length transform (default)
    Rle,
    /// LZ4 block compression
    Lz4,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            algorithm: CodecAlgorithm::Rle,
            min_size_bytes: 64,
            benefit_ratio: 0.95,
            verify_roundtrip: true,
        }
    }
}

/// Adaptive TTL configuration
#[derive(Debug, Clone)]
pub struct TtlConfig {
    /// TTL for volatile namespaces (high write rate)
    pub min_ttl: Duration,
    /// TTL for stable namespaces (low write rate)
    pub max_ttl: Duration,
    /// TTL for namespaces with no observed writes
    pub default_ttl: Duration,
    /// Write-rate observation window
    pub observation_window: Duration,
    /// Writes per minute at or above which a namespace is volatile
    pub volatile_writes_per_min: f64,
    /// Writes per minute at or below which a namespace is stable
    pub stable_writes_per_min: f64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(3600),
            default_ttl: Duration::from_secs(300),
            observation_window: Duration::from_secs(60),
            volatile_writes_per_min: 30.0,
            stable_writes_per_min: 1.0,
        }
    }
}

/// Memory monitor configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Total capacity in bytes
    pub capacity_bytes: u64,
    /// Utilization at or above which pressure is Medium
    pub medium_watermark: f64,
    /// Utilization at or above which pressure is High
    pub high_watermark: f64,
    /// Utilization at or above which pressure is Critical
    pub critical_watermark: f64,
    /// Eviction batch at Medium pressure
    pub medium_batch: usize,
    /// Eviction batch at High pressure
    pub high_batch: usize,
    /// Eviction batch at Critical pressure
    pub critical_batch: usize,
    /// Entries re-examined per compression pass at High pressure
    pub compression_pass_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY,
            medium_watermark: 0.56,
            high_watermark: 0.80,
            critical_watermark: 0.95,
            medium_batch: 16,
            high_batch: 64,
            critical_batch: 256,
            compression_pass_limit: 128,
        }
    }
}

/// Background refresher configuration
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Scan interval
    pub interval: Duration,
    /// Per-attempt fetch timeout; a timed-out fetch counts as a failed attempt
    pub fetch_timeout: Duration,
    /// Failed attempts before a registration is dropped
    pub max_retries: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Consistency monitor configuration
#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    /// Audit interval
    pub interval: Duration,
    /// Entries sampled per audit
    pub sample_size: usize,
    /// Peer digests older than this are ignored
    pub digest_ttl: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            sample_size: 64,
            digest_ttl: Duration::from_secs(120),
        }
    }
}

/// Invalidation bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Window within which `(origin, timestamp)` pairs are deduplicated
    pub dedup_window: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(60),
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Codec settings
    pub codec: CodecConfig,
    /// Adaptive TTL settings
    pub ttl: TtlConfig,
    /// Memory monitor settings
    pub memory: MemoryConfig,
    /// Background refresher settings
    pub refresh: RefreshConfig,
    /// Consistency monitor settings
    pub consistency: ConsistencyConfig,
    /// Invalidation bus settings
    pub bus: BusConfig,
    /// Expired-entry sweep interval
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            ttl: TtlConfig::default(),
            memory: MemoryConfig::default(),
            refresh: RefreshConfig::default(),
            consistency: ConsistencyConfig::default(),
            bus: BusConfig::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    /// Validate the configuration. A rejected configuration sends the
    /// manager into degraded mode rather than failing construction.
    pub fn validate(&self) -> Result<()> {
        if self.memory.capacity_bytes == 0 {
            return Err(Error::StorageInit("capacity_bytes must be non-zero".into()));
        }
        if !(0.0 < self.memory.medium_watermark
            && self.memory.medium_watermark < self.memory.high_watermark
            && self.memory.high_watermark < self.memory.critical_watermark
            && self.memory.critical_watermark <= 1.0)
        {
            return Err(Error::StorageInit(
                "pressure watermarks must be strictly increasing within (0, 1]".into(),
            ));
        }
        if !(0.0 < self.codec.benefit_ratio && self.codec.benefit_ratio <= 1.0) {
            return Err(Error::StorageInit(
                "codec benefit_ratio must be within (0, 1]".into(),
            ));
        }
        if self.ttl.min_ttl.is_zero()
            || self.ttl.min_ttl > self.ttl.max_ttl
            || self.ttl.default_ttl.is_zero()
        {
            return Err(Error::StorageInit(
                "TTL band must satisfy 0 < min_ttl <= max_ttl and default_ttl > 0".into(),
            ));
        }
        if self.ttl.volatile_writes_per_min <= self.ttl.stable_writes_per_min {
            return Err(Error::StorageInit(
                "volatile write-rate threshold must exceed the stable threshold".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(!CacheConfig::default().sweep_interval.is_zero());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = CacheConfig::default();
        config.memory.capacity_bytes = 0;
        assert_matches!(config.validate(), Err(Error::StorageInit(_)));
    }

    #[test]
    fn test_watermark_ordering_enforced() {
        let mut config = CacheConfig::default();
        config.memory.high_watermark = 0.50; // below medium
        assert_matches!(config.validate(), Err(Error::StorageInit(_)));
    }

    #[test]
    fn test_benefit_ratio_bounds() {
        let mut config = CacheConfig::default();
        config.codec.benefit_ratio = 0.0;
        assert!(config.validate().is_err());

        config.codec.benefit_ratio = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_band_rejected_when_inverted() {
        let mut config = CacheConfig::default();
        config.ttl.min_ttl = Duration::from_secs(7200);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_thresholds() {
        let config = MemoryConfig::default();
        assert_eq!(config.medium_watermark, 0.56);
        assert_eq!(config.high_watermark, 0.80);
        assert_eq!(config.critical_watermark, 0.95);
    }
}
