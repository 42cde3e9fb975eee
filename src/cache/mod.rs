//! Tiered Document Cache
//!
//! Documents are cached in two tiers with capacity-bounded overflow banks
//! underneath.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        Cache Coordinator                                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Tier 1 (in-process)  │ Tier 2 (distributed)  │ Banks (overflow)         │
//! │  ┌────────────────┐   │ ┌──────────────────┐  │ ┌──────────────────────┐ │
//! │  │ Partition per  │   │ │ Key/value + TTL  │  │ │ fast    1 MiB        │ │
//! │  │ document type  │   │ │ Pub/sub channels │  │ │ pattern 2 MiB        │ │
//! │  │ Capacity: 50MiB│   │ │                  │  │ │ logic   4 MiB        │ │
//! │  └────────────────┘   │ └──────────────────┘  │ │ persistent -> bulk   │ │
//! │         │             │         │             │ └──────────────────────┘ │
//! │         └─────────────┴─────────┴─────────────┴──────────┘               │
//! │                              │                                           │
//! │               Promotion on hit / demotion on eviction                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes always land in tier 1, are copied to tier 2 best-effort and
//! overflow into a bank when the overflow policy says so. Reads walk the
//! tiers in order and promote on deeper hits. Change events published on
//! tier 2 keep several coordinators converged.

mod bank;
mod bulk;
mod clock;
mod coordinator;
mod distributed;
mod entry;
mod metrics;
mod policy;
mod tier_store;
pub mod backend;
pub mod config;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(test)]
mod proptest;

pub use backend::{ChannelMessage, DistributedBackend, InMemoryBackend};
pub use bank::{Allocation, BankAllocator, BankLookup, BankSpec, BankStats, ReleasedAllocation};
pub use bulk::{BulkStore, BulkStoreStats, FileBulkStore, InMemoryBulkStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BankConfig, CacheConfig, DistributedConfig};
pub use coordinator::{CacheCoordinator, Lookup, FLUSH_NAMESPACE};
pub use distributed::{
    ChangeEvent, ChangeOperation, DistributedTier, Envelope, SearchInvalidation, SearchKey,
    SearchResults, TtlClass,
};
pub use entry::{AllocationRecord, CacheEntry, Payload, RiskLevel, SyncStatus, Tier};
pub use metrics::{LatencyTracker, MetricsCollector, StatsSnapshot, TierCounters};
pub use policy::{OverflowPolicy, PromotionPolicy, TierEvictionPolicy};
pub use tier_store::{EntryFilter, InsertOutcome, PartitionStats, Tier1Config, TierStore};

/// Smallest, fastest bank
pub const FAST_BANK: &str = "fast";

/// Bank for high-risk documents
pub const PATTERN_BANK: &str = "pattern";

/// Bulk bank for low-risk or low-priority documents
pub const LOGIC_BANK: &str = "logic";

/// Unbounded bank backed by the bulk store
pub const PERSISTENT_BANK: &str = "persistent";

/// Default fast bank capacity (1 MiB)
pub const DEFAULT_FAST_BANK_CAPACITY: u64 = 1024 * 1024;

/// Default pattern bank capacity (2 MiB)
pub const DEFAULT_PATTERN_BANK_CAPACITY: u64 = 2 * 1024 * 1024;

/// Default logic bank capacity (4 MiB)
pub const DEFAULT_LOGIC_BANK_CAPACITY: u64 = 4 * 1024 * 1024;

/// Default tier 1 capacity (50 MiB)
pub const DEFAULT_TIER1_CAPACITY: u64 = 50 * 1024 * 1024;

/// Default tier 2 key prefix
pub const DEFAULT_KEY_PREFIX: &str = "doctier";

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bank_capacities_grow() {
        assert!(DEFAULT_FAST_BANK_CAPACITY < DEFAULT_PATTERN_BANK_CAPACITY);
        assert!(DEFAULT_PATTERN_BANK_CAPACITY < DEFAULT_LOGIC_BANK_CAPACITY);
    }

    #[test]
    fn test_default_tier1_capacity() {
        assert_eq!(DEFAULT_TIER1_CAPACITY, 50 * 1024 * 1024);
    }

    #[test]
    fn test_bank_names_distinct() {
        let names = [FAST_BANK, PATTERN_BANK, LOGIC_BANK, PERSISTENT_BANK];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
