//! Overflow, Eviction and Promotion Policies
//!
//! Configurable rules for moving documents between tier 1 and the banks.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::serde_secs;
use super::entry::{CacheEntry, RiskLevel};
use super::{FAST_BANK, LOGIC_BANK, PATTERN_BANK, PERSISTENT_BANK};

/// Decides which stored documents also go to a bank, and which bank
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverflowPolicy {
    /// Entries larger than this overflow
    pub size_threshold: u64,
    /// Entries with priority below this overflow
    pub low_priority_floor: u8,
    /// Entries with priority at or above this route to the fast bank
    pub high_priority_floor: u8,
    /// Entries older than this overflow (and route to the persistent bank)
    #[serde(with = "serde_secs")]
    pub staleness_window: Duration,
    /// Explicit document type -> bank routes, checked first
    pub routes: HashMap<String, String>,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self {
            size_threshold: 64 * 1024, // 64KB
            low_priority_floor: 32,
            high_priority_floor: 200,
            staleness_window: Duration::from_secs(24 * 3600),
            routes: HashMap::new(),
        }
    }
}

impl OverflowPolicy {
    /// Any single criterion is enough
    pub fn should_overflow(&self, entry: &CacheEntry, now_millis: u64) -> bool {
        entry.size_bytes > self.size_threshold
            || entry.priority < self.low_priority_floor
            || entry.risk_level == RiskLevel::Low
            || self.is_stale(entry, now_millis)
    }

    /// Whether the entry is older than the staleness window
    pub fn is_stale(&self, entry: &CacheEntry, now_millis: u64) -> bool {
        entry.age_millis(now_millis) > self.staleness_window.as_millis() as u64
    }

    /// Preferred bank before capacity is considered
    pub fn preferred_bank<'a>(&'a self, entry: &CacheEntry, now_millis: u64) -> &'a str {
        if let Some(bank) = self.routes.get(&entry.document_type) {
            return bank;
        }
        if entry.risk_level == RiskLevel::Critical || entry.priority >= self.high_priority_floor {
            return FAST_BANK;
        }
        if self.is_stale(entry, now_millis) {
            return PERSISTENT_BANK;
        }
        if entry.risk_level == RiskLevel::High {
            return PATTERN_BANK;
        }
        if entry.risk_level == RiskLevel::Low || entry.priority < self.low_priority_floor {
            return LOGIC_BANK;
        }
        PATTERN_BANK
    }
}

/// Tier 1 eviction under capacity pressure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierEvictionPolicy {
    /// Fraction of capacity that triggers eviction
    pub threshold: f64,
    /// Fraction of eligible entries evicted per pass
    pub batch_fraction: f64,
    /// Entries at or above this priority are never evicted
    pub pinned_priority_floor: u8,
    /// Risk levels never evicted
    pub protected_risk_levels: Vec<RiskLevel>,
}

impl Default for TierEvictionPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            batch_fraction: 0.25,
            pinned_priority_floor: 250,
            protected_risk_levels: vec![RiskLevel::Critical],
        }
    }
}

impl TierEvictionPolicy {
    /// Check if total size is past the trigger point
    pub fn should_evict(&self, total_bytes: u64, capacity: u64) -> bool {
        total_bytes as f64 > capacity as f64 * self.threshold
    }

    /// Highest priority still eligible for eviction
    pub fn max_eligible_priority(&self) -> Option<u8> {
        self.pinned_priority_floor.checked_sub(1)
    }

    /// Number of entries to evict out of `eligible`
    pub fn batch_size(&self, eligible: usize) -> usize {
        if eligible == 0 {
            return 0;
        }
        let n = (eligible as f64 * self.batch_fraction).ceil() as usize;
        n.clamp(1, eligible)
    }
}

/// Bank -> tier 1 promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionPolicy {
    /// Bank hits promote once access count exceeds this
    pub bank_promotion_threshold: u64,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            bank_promotion_threshold: 3,
        }
    }
}

impl PromotionPolicy {
    pub fn should_promote_from_bank(&self, access_count: u64) -> bool {
        access_count > self.bank_promotion_threshold
    }
}

// =============================================================================
// Tests
// =============================================================================
