//! Bank Allocator - Capacity-Bounded Overflow Regions
//!
//! A fixed set of named banks, each with a byte budget, holding documents that
//! overflow tier 1. One bank is unbounded and acts as the fallback of last
//! resort; its payloads live in the bulk store rather than in memory.
//!
//! # Eviction
//!
//! When an allocation does not fit, unpinned allocations are evicted oldest
//! `last_accessed_at` first, larger first on ties. Pinned allocations
//! (`ref_count > 0`) are never touched. If the unpinned allocations cannot
//! free enough space nothing is evicted and the call fails with
//! [`Error::BankExhausted`].
//!
//! Every bank has its own lock, so two concurrent allocations against the same
//! bank can never both pass a capacity check that only one can satisfy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::clock::Clock;
use super::entry::{AllocationRecord, CacheEntry, Tier};
use super::policy::OverflowPolicy;
use super::{
    DEFAULT_FAST_BANK_CAPACITY, DEFAULT_LOGIC_BANK_CAPACITY, DEFAULT_PATTERN_BANK_CAPACITY,
    FAST_BANK, LOGIC_BANK, PATTERN_BANK, PERSISTENT_BANK,
};
use crate::error::{Error, Result};

/// Bank declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankSpec {
    pub name: String,
    /// `None` means unbounded
    pub capacity_bytes: Option<u64>,
}

impl BankSpec {
    pub fn bounded(name: impl Into<String>, capacity_bytes: u64) -> Self {
        Self {
            name: name.into(),
            capacity_bytes: Some(capacity_bytes),
        }
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity_bytes: None,
        }
    }

    /// fast 1 MiB, pattern 2 MiB, logic 4 MiB, persistent unbounded
    pub fn defaults() -> Vec<BankSpec> {
        vec![
            BankSpec::bounded(FAST_BANK, DEFAULT_FAST_BANK_CAPACITY),
            BankSpec::bounded(PATTERN_BANK, DEFAULT_PATTERN_BANK_CAPACITY),
            BankSpec::bounded(LOGIC_BANK, DEFAULT_LOGIC_BANK_CAPACITY),
            BankSpec::unbounded(PERSISTENT_BANK),
        ]
    }
}

/// Allocation removed from a bank, by eviction or explicit release
#[derive(Debug, Clone)]
pub struct ReleasedAllocation {
    pub record: AllocationRecord,
    /// Resident payload, `None` for the persistent bank
    pub entry: Option<CacheEntry>,
}

/// Result of a successful allocation
#[derive(Debug, Clone)]
pub struct Allocation {
    pub record: AllocationRecord,
    /// Allocations evicted to make room, oldest first
    pub evicted: Vec<ReleasedAllocation>,
}

/// Result of looking an id up across banks
#[derive(Debug, Clone)]
pub enum BankLookup {
    /// Payload held in memory by a bounded bank
    Resident {
        record: AllocationRecord,
        entry: CacheEntry,
    },
    /// Payload lives in the bulk store
    Persisted { record: AllocationRecord },
}

impl BankLookup {
    pub fn record(&self) -> &AllocationRecord {
        match self {
            BankLookup::Resident { record, .. } => record,
            BankLookup::Persisted { record } => record,
        }
    }
}

/// Per-bank statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BankStats {
    pub name: String,
    pub used_bytes: u64,
    /// `None` for the unbounded bank
    pub capacity_bytes: Option<u64>,
    pub allocation_count: usize,
    pub evictions: u64,
}

struct BankSlot {
    record: AllocationRecord,
    entry: Option<CacheEntry>,
}

#[derive(Default)]
struct BankState {
    used_bytes: u64,
    slots: HashMap<String, BankSlot>,
}

struct Bank {
    name: String,
    capacity: Option<u64>,
    state: Mutex<BankState>,
    evictions: AtomicU64,
}

impl Bank {
    fn new(spec: &BankSpec) -> Self {
        Self {
            name: spec.name.clone(),
            capacity: spec.capacity_bytes,
            state: Mutex::new(BankState::default()),
            evictions: AtomicU64::new(0),
        }
    }

    fn place(
        &self,
        id: &str,
        size_bytes: u64,
        entry: Option<CacheEntry>,
        now_millis: u64,
    ) -> Result<Allocation> {
        if let Some(capacity) = self.capacity {
            if size_bytes > capacity {
                return Err(Error::Capacity {
                    bank: self.name.clone(),
                    requested: size_bytes,
                    capacity,
                });
            }
        }

        let mut state = self.state.lock();

        // Replacing an allocation releases its bytes first but keeps its pins
        let (used_without, ref_count) = match state.slots.get(id) {
            Some(slot) => (
                state.used_bytes - slot.record.size_bytes,
                slot.record.ref_count,
            ),
            None => (state.used_bytes, 0),
        };

        let mut evicted = Vec::new();
        if let Some(capacity) = self.capacity {
            let free = capacity - used_without;
            if size_bytes > free {
                let needed = size_bytes - free;
                evicted = self.evict_locked(&mut state, id, needed, size_bytes, capacity)?;
            }
        }

        let record = AllocationRecord {
            id: id.to_string(),
            bank: self.name.clone(),
            size_bytes,
            last_accessed_at: now_millis,
            ref_count,
        };
        let entry = entry.map(|mut e| {
            e.tier = Tier::Bank(self.name.clone());
            e
        });

        let previous = state.slots.insert(
            id.to_string(),
            BankSlot {
                record: record.clone(),
                entry,
            },
        );
        let released = previous.map(|slot| slot.record.size_bytes).unwrap_or(0);
        state.used_bytes = state.used_bytes - released + size_bytes;

        Ok(Allocation { record, evicted })
    }

    /// Free at least `needed` bytes from unpinned allocations other than `keep`
    fn evict_locked(
        &self,
        state: &mut BankState,
        keep: &str,
        needed: u64,
        requested: u64,
        capacity: u64,
    ) -> Result<Vec<ReleasedAllocation>> {
        let mut candidates: Vec<(u64, u64, String)> = state
            .slots
            .values()
            .filter(|slot| !slot.record.is_pinned() && slot.record.id != keep)
            .map(|slot| {
                (
                    slot.record.last_accessed_at,
                    slot.record.size_bytes,
                    slot.record.id.clone(),
                )
            })
            .collect();

        let reclaimable: u64 = candidates.iter().map(|(_, size, _)| size).sum();
        if reclaimable < needed {
            let in_place = state
                .slots
                .get(keep)
                .map(|slot| slot.record.size_bytes)
                .unwrap_or(0);
            let free = capacity - (state.used_bytes - in_place);
            return Err(Error::BankExhausted {
                bank: self.name.clone(),
                requested,
                available: free + reclaimable,
            });
        }

        // Oldest first, larger first on ties
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        let mut freed = 0u64;
        let mut evicted = Vec::new();
        for (_, _, id) in candidates {
            if freed >= needed {
                break;
            }
            if let Some(slot) = state.slots.remove(&id) {
                freed += slot.record.size_bytes;
                state.used_bytes -= slot.record.size_bytes;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(bank = %self.name, id = %id, size = slot.record.size_bytes, "Evicted allocation");
                evicted.push(ReleasedAllocation {
                    record: slot.record,
                    entry: slot.entry,
                });
            }
        }

        Ok(evicted)
    }

    fn stats(&self) -> BankStats {
        let state = self.state.lock();
        BankStats {
            name: self.name.clone(),
            used_bytes: state.used_bytes,
            capacity_bytes: self.capacity,
            allocation_count: state.slots.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Named, capacity-bounded overflow regions
pub struct BankAllocator {
    banks: Vec<Bank>,
    index: HashMap<String, usize>,
    fallback: usize,
    policy: OverflowPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BankAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BankAllocator")
            .field("banks", &self.banks.len())
            .field("fallback", &self.fallback)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl BankAllocator {
    /// Create an allocator; `fallback` must name an unbounded bank
    pub fn new(
        specs: &[BankSpec],
        fallback: &str,
        policy: OverflowPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(Error::Config(format!("duplicate bank name: {}", spec.name)));
            }
        }

        let fallback_idx = *index
            .get(fallback)
            .ok_or_else(|| Error::Config(format!("fallback bank {} is not declared", fallback)))?;
        if specs[fallback_idx].capacity_bytes.is_some() {
            return Err(Error::Config(format!(
                "fallback bank {} must be unbounded",
                fallback
            )));
        }

        for route in policy.routes.values() {
            if !index.contains_key(route) {
                return Err(Error::Config(format!("route targets unknown bank: {}", route)));
            }
        }

        Ok(Self {
            banks: specs.iter().map(Bank::new).collect(),
            index,
            fallback: fallback_idx,
            policy,
            clock,
        })
    }

    /// Default banks with the default overflow policy
    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self {
            banks: BankSpec::defaults().iter().map(Bank::new).collect(),
            index: BankSpec::defaults()
                .into_iter()
                .enumerate()
                .map(|(i, spec)| (spec.name, i))
                .collect(),
            fallback: 3,
            policy: OverflowPolicy::default(),
            clock,
        }
    }

    fn bank(&self, name: &str) -> Result<&Bank> {
        self.index
            .get(name)
            .map(|&i| &self.banks[i])
            .ok_or_else(|| Error::BankNotFound(name.to_string()))
    }

    /// Reserve `size_bytes` for `id` without a resident payload
    pub fn allocate(&self, bank: &str, id: &str, size_bytes: u64) -> Result<Allocation> {
        self.bank(bank)?
            .place(id, size_bytes, None, self.clock.now_millis())
    }

    /// Reserve space and keep the entry resident in the bank
    pub fn allocate_entry(&self, bank: &str, entry: CacheEntry) -> Result<Allocation> {
        let id = entry.id.clone();
        let size = entry.size_bytes;
        self.bank(bank)?
            .place(&id, size, Some(entry), self.clock.now_millis())
    }

    /// Remove an allocation; false if absent
    pub fn free(&self, bank: &str, id: &str) -> bool {
        let Ok(bank) = self.bank(bank) else {
            return false;
        };
        let mut state = bank.state.lock();
        match state.slots.remove(id) {
            Some(slot) => {
                state.used_bytes -= slot.record.size_bytes;
                true
            }
            None => false,
        }
    }

    /// Remove an id from whichever bank holds it
    pub fn free_anywhere(&self, id: &str) -> Option<ReleasedAllocation> {
        for bank in &self.banks {
            let mut state = bank.state.lock();
            if let Some(slot) = state.slots.remove(id) {
                state.used_bytes -= slot.record.size_bytes;
                return Some(ReleasedAllocation {
                    record: slot.record,
                    entry: slot.entry,
                });
            }
        }
        None
    }

    /// Bank currently holding `id`
    pub fn locate(&self, id: &str) -> Option<String> {
        self.banks
            .iter()
            .find(|bank| bank.state.lock().slots.contains_key(id))
            .map(|bank| bank.name.clone())
    }

    /// Look up `id` across banks, recording the access
    pub fn lookup(&self, id: &str) -> Option<BankLookup> {
        let now = self.clock.now_millis();
        for bank in &self.banks {
            let mut state = bank.state.lock();
            if let Some(slot) = state.slots.get_mut(id) {
                slot.record.last_accessed_at = now;
                let record = slot.record.clone();
                return Some(match slot.entry.as_mut() {
                    Some(entry) => {
                        entry.record_access(now);
                        BankLookup::Resident {
                            record,
                            entry: entry.clone(),
                        }
                    }
                    None => BankLookup::Persisted { record },
                });
            }
        }
        None
    }

    /// Current record for `id` in `bank`
    pub fn record(&self, bank: &str, id: &str) -> Option<AllocationRecord> {
        let bank = self.bank(bank).ok()?;
        let state = bank.state.lock();
        state.slots.get(id).map(|slot| slot.record.clone())
    }

    /// Hold an allocation so eviction skips it
    pub fn pin(&self, bank: &str, id: &str) -> bool {
        let Ok(bank) = self.bank(bank) else {
            return false;
        };
        let mut state = bank.state.lock();
        match state.slots.get_mut(id) {
            Some(slot) => {
                slot.record.ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Release one pin; false if absent or not pinned
    pub fn unpin(&self, bank: &str, id: &str) -> bool {
        let Ok(bank) = self.bank(bank) else {
            return false;
        };
        let mut state = bank.state.lock();
        match state.slots.get_mut(id) {
            Some(slot) if slot.record.ref_count > 0 => {
                slot.record.ref_count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Deterministic bank choice for an overflowing entry
    ///
    /// The policy's preferred bank is used when the entry fits its capacity;
    /// otherwise the smallest bounded bank that fits, then the fallback.
    pub fn select_bank(&self, entry: &CacheEntry) -> String {
        let preferred = self.policy.preferred_bank(entry, self.clock.now_millis());
        if let Some(&i) = self.index.get(preferred) {
            match self.banks[i].capacity {
                Some(capacity) if entry.size_bytes > capacity => {}
                _ => return self.banks[i].name.clone(),
            }
        }

        self.banks
            .iter()
            .filter_map(|bank| bank.capacity.map(|c| (c, bank)))
            .filter(|(capacity, _)| entry.size_bytes <= *capacity)
            .min_by_key(|(capacity, _)| *capacity)
            .map(|(_, bank)| bank.name.clone())
            .unwrap_or_else(|| self.fallback_bank().to_string())
    }

    /// Unbounded bank of last resort
    pub fn fallback_bank(&self) -> &str {
        &self.banks[self.fallback].name
    }

    /// Whether the bank keeps payloads outside the allocator
    pub fn is_unbounded(&self, bank: &str) -> bool {
        self.bank(bank).map(|b| b.capacity.is_none()).unwrap_or(false)
    }

    /// Overflow policy in use
    pub fn policy(&self) -> &OverflowPolicy {
        &self.policy
    }

    /// Used bytes of a bank
    pub fn used_bytes(&self, bank: &str) -> Option<u64> {
        self.bank(bank).ok().map(|b| b.state.lock().used_bytes)
    }

    /// Snapshot of every bank
    pub fn stats(&self) -> Vec<BankStats> {
        self.banks.iter().map(Bank::stats).collect()
    }

    /// Total allocations across banks
    pub fn allocation_count(&self) -> usize {
        self.banks.iter().map(|b| b.state.lock().slots.len()).sum()
    }

    /// Ids held by the persistent (payload-less) banks
    pub fn persisted_ids(&self) -> Vec<String> {
        self.banks
            .iter()
            .filter(|b| b.capacity.is_none())
            .flat_map(|b| b.state.lock().slots.keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Drop every allocation
    pub fn clear(&self) {
        for bank in &self.banks {
            let mut state = bank.state.lock();
            state.slots.clear();
            state.used_bytes = 0;
            bank.evictions.store(0, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
