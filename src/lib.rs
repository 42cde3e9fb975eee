//! Doctier - Tiered Document Cache
//!
//! A document cache for analysis services that keeps hot documents in
//! process, shares them through a distributed key/value tier and overflows
//! cold or bulky documents into capacity-bounded banks.
//!
//! # Architecture
//!
//! ```text
//! store ──▶ Tier 1 (partitioned, in-process) ──▶ Tier 2 (key/value + pub/sub)
//!                 │ evict                               ▲
//!                 ▼                                     │ change events
//!           Bank allocator ──▶ fast / pattern / logic / persistent (bulk store)
//! ```
//!
//! Reads walk tier 1, tier 2 and the banks in that order; deeper hits are
//! promoted. Several coordinators sharing one tier 2 converge through
//! published change events.
//!
//! # Modules
//!
//! - [`cache`] - Tiers, banks, policies, coordinator and metrics
//! - [`error`] - Error types

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    BankAllocator, CacheConfig, CacheCoordinator, CacheEntry, DistributedBackend,
    InMemoryBackend, Lookup, MetricsCollector, RiskLevel, StatsSnapshot, Tier, TierStore,
};
pub use error::{Error, Result};
