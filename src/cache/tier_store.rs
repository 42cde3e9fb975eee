//! Tier Store - In-Process Document Store (Tier 1)
//!
//! The fastest tier and the authoritative one by default. Documents are
//! partitioned by document type; each partition has its own lock so size
//! accounting stays exact under concurrent writers.
//!
//! # Eviction
//!
//! When the total size passes `capacity × threshold`, the lowest-ranked
//! fraction of eligible entries is evicted. Ranking is ascending
//! `(access_count, priority)`. Protected risk levels and entries at or above
//! the pinned priority floor are never eligible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entry::{CacheEntry, RiskLevel, Tier};
use super::policy::TierEvictionPolicy;
use super::DEFAULT_TIER1_CAPACITY;
use crate::error::{Error, Result};

/// Fields searched by [`EntryFilter::text`] unless overridden
pub const DEFAULT_TEXT_FIELDS: &[&str] = &["id", "title", "summary", "content"];

/// Tier 1 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tier1Config {
    /// Maximum capacity in bytes
    pub capacity: u64,
    /// Declared document types
    pub partitions: Vec<String>,
    /// Eviction rules
    pub eviction: TierEvictionPolicy,
}

impl Default for Tier1Config {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_TIER1_CAPACITY,
            partitions: vec!["document".to_string()],
            eviction: TierEvictionPolicy::default(),
        }
    }
}

/// Query-style filter over one partition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryFilter {
    /// Accepted risk levels, empty accepts all
    pub risk_levels: Vec<RiskLevel>,
    pub min_priority: Option<u8>,
    pub max_priority: Option<u8>,
    /// Case-insensitive substring
    pub text: Option<String>,
    /// Fields searched for `text`, empty means [`DEFAULT_TEXT_FIELDS`]
    pub text_fields: Vec<String>,
}

impl EntryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn risk_levels(mut self, levels: impl IntoIterator<Item = RiskLevel>) -> Self {
        self.risk_levels = levels.into_iter().collect();
        self
    }

    pub fn priority_range(mut self, min: u8, max: u8) -> Self {
        self.min_priority = Some(min);
        self.max_priority = Some(max);
        self
    }

    pub fn text(mut self, needle: impl Into<String>) -> Self {
        self.text = Some(needle.into());
        self
    }

    pub fn text_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.text_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, entry: &CacheEntry) -> bool {
        if !self.risk_levels.is_empty() && !self.risk_levels.contains(&entry.risk_level) {
            return false;
        }
        if self.min_priority.is_some_and(|min| entry.priority < min) {
            return false;
        }
        if self.max_priority.is_some_and(|max| entry.priority > max) {
            return false;
        }
        match &self.text {
            Some(needle) if self.text_fields.is_empty() => {
                entry.contains_text(needle, DEFAULT_TEXT_FIELDS)
            }
            Some(needle) => entry.contains_text(needle, &self.text_fields),
            None => true,
        }
    }
}

/// Result of an insert
#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Entry with the same id that was replaced
    pub replaced: Option<CacheEntry>,
    /// Entries evicted by the capacity check following the insert
    pub evicted: Vec<CacheEntry>,
}

#[derive(Default)]
struct PartitionState {
    entries: HashMap<String, CacheEntry>,
    size_bytes: u64,
}

struct Partition {
    name: String,
    state: Mutex<PartitionState>,
}

/// Per-partition statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStats {
    pub document_type: String,
    pub entries: usize,
    pub size_bytes: u64,
}

/// Tier 1 document store
pub struct TierStore {
    partitions: Vec<Partition>,
    index: HashMap<String, usize>,
    config: Tier1Config,
    /// Sum of partition sizes
    total_bytes: AtomicU64,
    evictions: AtomicU64,
    /// Serializes eviction passes
    eviction_guard: Mutex<()>,
}

impl TierStore {
    /// Create a store with the declared partitions
    pub fn new(config: Tier1Config) -> Result<Self> {
        if config.partitions.is_empty() {
            return Err(Error::Config("tier 1 needs at least one partition".into()));
        }
        let mut index = HashMap::new();
        for (i, name) in config.partitions.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(Error::Config(format!("duplicate partition: {}", name)));
            }
        }

        Ok(Self {
            partitions: config
                .partitions
                .iter()
                .map(|name| Partition {
                    name: name.clone(),
                    state: Mutex::new(PartitionState::default()),
                })
                .collect(),
            index,
            config,
            total_bytes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            eviction_guard: Mutex::new(()),
        })
    }

    fn partition(&self, document_type: &str) -> Result<&Partition> {
        self.index
            .get(document_type)
            .map(|&i| &self.partitions[i])
            .ok_or_else(|| Error::PartitionNotFound {
                document_type: document_type.to_string(),
            })
    }

    /// Insert or replace (last write wins), then enforce capacity
    pub fn insert(&self, mut entry: CacheEntry) -> Result<InsertOutcome> {
        let partition = self.partition(&entry.document_type)?;
        entry.tier = Tier::Tier1;
        let size = entry.size_bytes;

        let replaced = {
            let mut state = partition.state.lock();
            let replaced = state.entries.remove(&entry.id);
            if let Some(old) = &replaced {
                state.size_bytes -= old.size_bytes;
                self.total_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
            }
            state.entries.insert(entry.id.clone(), entry);
            state.size_bytes += size;
            self.total_bytes.fetch_add(size, Ordering::Relaxed);
            replaced
        };

        Ok(InsertOutcome {
            replaced,
            evicted: self.evict_if_needed(),
        })
    }

    /// Point lookup across partitions in declaration order
    pub fn find(&self, id: &str) -> Option<CacheEntry> {
        self.partitions
            .iter()
            .find_map(|p| p.state.lock().entries.get(id).cloned())
    }

    /// Point lookup within one partition
    pub fn find_in(&self, document_type: &str, id: &str) -> Result<Option<CacheEntry>> {
        let partition = self.partition(document_type)?;
        let state = partition.state.lock();
        Ok(state.entries.get(id).cloned())
    }

    /// Look up and record an access in one step
    pub fn touch(&self, id: &str, now_millis: u64) -> Option<CacheEntry> {
        for partition in &self.partitions {
            let mut state = partition.state.lock();
            if let Some(entry) = state.entries.get_mut(id) {
                entry.record_access(now_millis);
                return Some(entry.clone());
            }
        }
        None
    }

    /// Mutate an entry in place; size changes are re-accounted
    pub fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut CacheEntry),
    {
        for partition in &self.partitions {
            let mut state = partition.state.lock();
            let Some(entry) = state.entries.get_mut(id) else {
                continue;
            };
            let before = entry.size_bytes;
            f(entry);
            let after = entry.size_bytes;
            state.size_bytes = state.size_bytes - before + after;
            self.total_bytes.fetch_sub(before, Ordering::Relaxed);
            self.total_bytes.fetch_add(after, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Scan one partition with an arbitrary predicate
    pub fn find_by_type<F>(&self, document_type: &str, predicate: F) -> Result<Vec<CacheEntry>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let partition = self.partition(document_type)?;
        let state = partition.state.lock();
        Ok(state
            .entries
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect())
    }

    /// Scan one partition with a structured filter
    pub fn query(&self, document_type: &str, filter: &EntryFilter) -> Result<Vec<CacheEntry>> {
        self.find_by_type(document_type, |e| filter.matches(e))
    }

    /// Remove an id from whichever partition holds it
    pub fn remove(&self, id: &str) -> Option<CacheEntry> {
        self.partitions.iter().find_map(|p| self.remove_locked(p, id))
    }

    /// Remove an id from one partition
    pub fn remove_in(&self, document_type: &str, id: &str) -> Result<Option<CacheEntry>> {
        let partition = self.partition(document_type)?;
        Ok(self.remove_locked(partition, id))
    }

    fn remove_locked(&self, partition: &Partition, id: &str) -> Option<CacheEntry> {
        let mut state = partition.state.lock();
        let removed = state.entries.remove(id)?;
        state.size_bytes -= removed.size_bytes;
        self.total_bytes
            .fetch_sub(removed.size_bytes, Ordering::Relaxed);
        Some(removed)
    }

    /// Eligible entries ranked ascending by `(access_count, priority)`
    pub fn evict_candidates(
        &self,
        exclude_risk_levels: &[RiskLevel],
        max_priority: u8,
    ) -> Vec<CacheEntry> {
        let mut candidates: Vec<CacheEntry> = Vec::new();
        for partition in &self.partitions {
            let state = partition.state.lock();
            candidates.extend(
                state
                    .entries
                    .values()
                    .filter(|e| {
                        !exclude_risk_levels.contains(&e.risk_level) && e.priority <= max_priority
                    })
                    .cloned(),
            );
        }

        candidates.sort_by(|a, b| {
            a.access_count
                .cmp(&b.access_count)
                .then(a.priority.cmp(&b.priority))
                .then(a.last_accessed_at.cmp(&b.last_accessed_at))
                .then(a.id.cmp(&b.id))
        });
        candidates
    }

    /// Evict a batch if the tier is past its threshold
    pub fn evict_if_needed(&self) -> Vec<CacheEntry> {
        let policy = &self.config.eviction;
        if !policy.should_evict(self.size(), self.config.capacity) {
            return Vec::new();
        }
        // Another pass is already running
        let Some(_guard) = self.eviction_guard.try_lock() else {
            return Vec::new();
        };
        let Some(max_priority) = policy.max_eligible_priority() else {
            return Vec::new();
        };

        let candidates = self.evict_candidates(&policy.protected_risk_levels, max_priority);
        let batch = policy.batch_size(candidates.len());

        let mut evicted = Vec::with_capacity(batch);
        for candidate in candidates.into_iter().take(batch) {
            let Ok(partition) = self.partition(&candidate.document_type) else {
                continue;
            };
            if let Some(entry) = self.remove_locked(partition, &candidate.id) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = %entry.id,
                    document_type = %entry.document_type,
                    access_count = entry.access_count,
                    "Evicted from tier 1"
                );
                evicted.push(entry);
            }
        }
        evicted
    }

    /// Copy of every entry, for flushing
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.partitions
            .iter()
            .flat_map(|p| p.state.lock().entries.values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Per-partition counts and sizes
    pub fn partition_stats(&self) -> Vec<PartitionStats> {
        self.partitions
            .iter()
            .map(|p| {
                let state = p.state.lock();
                PartitionStats {
                    document_type: p.name.clone(),
                    entries: state.entries.len(),
                    size_bytes: state.size_bytes,
                }
            })
            .collect()
    }

    /// Whether a document type was declared
    pub fn has_partition(&self, document_type: &str) -> bool {
        self.index.contains_key(document_type)
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Get capacity
    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.state.lock().entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Utilization (0.0 - 1.0+)
    pub fn utilization(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }

    /// Drop every entry
    pub fn clear(&self) {
        for partition in &self.partitions {
            let mut state = partition.state.lock();
            self.total_bytes
                .fetch_sub(state.size_bytes, Ordering::Relaxed);
            state.entries.clear();
            state.size_bytes = 0;
        }
        self.evictions.store(0, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================
