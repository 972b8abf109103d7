//! Adacache - Adaptive Cache Engine
//!
//! A process-local cache that sits between an application's data-access
//! layer and a slow or rate-limited backend, with the machinery a cache
//! needs once it stops being a HashMap:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Cache Manager                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  CacheStore        │ BackgroundRefresher │ ConsistencyMonitor    │
//! │  ┌──────────────┐  │ ┌────────────────┐  │ ┌─────────────────┐   │
//! │  │ Namespaced   │  │ │ Near-expiry    │  │ │ Digest audit +  │   │
//! │  │ entry map    │  │ │ re-fetch       │  │ │ conflict repair │   │
//! │  └──────────────┘  │ └────────────────┘  │ └─────────────────┘   │
//! │         │                    │                     │             │
//! │  CompressionCodec · AdaptiveTTL · MemoryMonitor · InvalidationBus│
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design
//!
//! - Adaptive TTLs from per-namespace write-rate observation
//! - Compression with a measured-benefit threshold and raw fallback
//! - Pressure-driven eviction with recency-weighted frequency scoring
//! - Smart (targeted) vs comprehensive (blanket) invalidation events,
//!   exchanged with peer processes over a broadcast channel
//! - Periodic consistency audits that detect and repair cross-process
//!   divergence; stores stay process-local by design
//! - Degraded mode with an optional persistent fallback store
//!
//! # Example
//!
//! ```ignore
//! use adacache::{CacheManager, SetOptions};
//!
//! let cache = CacheManager::in_memory();
//! cache.set("dashboard", "visits", &42u64, SetOptions::default()).await?;
//! let visits: Option<u64> = cache.get("dashboard", "visits").await?;
//! ```
//!
//! # Modules
//!
//! - [`broadcast`] - Cross-process channel trait and loopback hub
//! - [`bus`] - Invalidation events and exactly-once routing
//! - [`clock`] - Clock abstraction for testable time
//! - [`codec`] - Run-length/LZ4 codecs with benefit-threshold selection
//! - [`config`] - Configuration with production defaults
//! - [`consistency`] - Cross-process divergence audit and repair
//! - [`entry`] - Cache entry types
//! - [`error`] - Error types
//! - [`fallback`] - Degraded-mode persistent store
//! - [`manager`] - Engine façade
//! - [`memory`] - Pressure classification and eviction budgets
//! - [`metrics`] - Operation counters and snapshots
//! - [`refresh`] - Background near-expiry refresh
//! - [`store`] - Namespaced entry store
//! - [`ttl`] - Adaptive TTL engine

pub mod broadcast;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod config;
pub mod consistency;
pub mod entry;
pub mod error;
pub mod fallback;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod refresh;
pub mod store;
pub mod ttl;

// Re-export commonly used types
pub use broadcast::{BroadcastChannel, LoopbackHub, NullChannel};
pub use bus::{InvalidationEvent, InvalidationMode, InvalidationTarget};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use fallback::{FallbackStore, InMemoryFallbackStore};
pub use manager::{CacheManager, CacheReport};
pub use memory::{MemoryStats, PressureLevel};
pub use refresh::Fetcher;
pub use store::{CacheStore, SetOptions};
