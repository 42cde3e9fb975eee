//! Property-Based Tests for Banks and Tier 1
//!
//! Drives the allocator and the tier 1 store with random operation
//! sequences and checks the accounting after every step.
//!
//! # Test Properties
//!
//! 1. **Capacity**: a bounded bank never holds more than its capacity
//! 2. **Pinning**: pinned allocations survive any eviction
//! 3. **Accounting**: used bytes equal the sum of live allocations
//! 4. **Tier 1 size**: total size equals the sum of resident entries
//! 5. **Prefix scans**: the in-memory backend lists exactly the live keys

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use super::backend::{DistributedBackend, InMemoryBackend};
use super::bank::{BankAllocator, BankSpec};
use super::clock::ManualClock;
use super::entry::{CacheEntry, RiskLevel};
use super::policy::OverflowPolicy;
use super::tier_store::{Tier1Config, TierStore};
use crate::error::Error;

const BANK: &str = "small";
const BANK_CAPACITY: u64 = 1000;

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum BankOp {
    Allocate { id: u8, size: u64 },
    Free { id: u8 },
    Pin { id: u8 },
    Unpin { id: u8 },
    Tick,
}

fn bank_op_strategy() -> impl Strategy<Value = BankOp> {
    prop_oneof![
        4 => (0u8..16, 1u64..=400).prop_map(|(id, size)| BankOp::Allocate { id, size }),
        1 => (0u8..16).prop_map(|id| BankOp::Free { id }),
        2 => (0u8..16).prop_map(|id| BankOp::Pin { id }),
        2 => (0u8..16).prop_map(|id| BankOp::Unpin { id }),
        1 => Just(BankOp::Tick),
    ]
}

fn risk_strategy() -> impl Strategy<Value = RiskLevel> {
    prop_oneof![
        Just(RiskLevel::Low),
        Just(RiskLevel::Medium),
        Just(RiskLevel::High),
        Just(RiskLevel::Critical),
    ]
}

/// (id, size, priority, risk)
fn entry_strategy() -> impl Strategy<Value = (u8, u64, u8, RiskLevel)> {
    (0u8..32, 1u64..=200, any::<u8>(), risk_strategy())
}

fn allocator(clock: Arc<ManualClock>) -> BankAllocator {
    BankAllocator::new(
        &[BankSpec::bounded(BANK, BANK_CAPACITY), BankSpec::unbounded("spill")],
        "spill",
        OverflowPolicy::default(),
        clock,
    )
    .unwrap()
}

// =============================================================================
// Bank Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: capacity holds, pinned ids survive and used bytes match the records.
    #[test]
    fn prop_bank_invariants(ops in prop::collection::vec(bank_op_strategy(), 1..80)) {
        let clock = Arc::new(ManualClock::new(1_000));
        let banks = allocator(clock.clone());
        // id -> pin count as tracked by the test
        let mut pins: HashMap<String, u32> = HashMap::new();

        for op in ops {
            match op {
                BankOp::Allocate { id, size } => {
                    let id = format!("doc-{}", id);
                    let pinned_before: Vec<String> = pins
                        .iter()
                        .filter(|(_, n)| **n > 0)
                        .map(|(id, _)| id.clone())
                        .collect();

                    match banks.allocate(BANK, &id, size) {
                        Ok(allocation) => {
                            for released in &allocation.evicted {
                                prop_assert!(!released.record.is_pinned());
                                prop_assert_ne!(&released.record.id, &id);
                                pins.remove(&released.record.id);
                            }
                            prop_assert_eq!(allocation.record.size_bytes, size);
                        }
                        Err(Error::BankExhausted { requested, .. }) => {
                            prop_assert_eq!(requested, size);
                        }
                        Err(e) => prop_assert!(false, "unexpected error: {}", e),
                    }

                    for id in pinned_before {
                        prop_assert!(banks.record(BANK, &id).is_some(), "pinned {} evicted", id);
                    }
                }
                BankOp::Free { id } => {
                    let id = format!("doc-{}", id);
                    let existed = banks.record(BANK, &id).is_some();
                    prop_assert_eq!(banks.free(BANK, &id), existed);
                    pins.remove(&id);
                }
                BankOp::Pin { id } => {
                    let id = format!("doc-{}", id);
                    if banks.pin(BANK, &id) {
                        *pins.entry(id).or_default() += 1;
                    }
                }
                BankOp::Unpin { id } => {
                    let id = format!("doc-{}", id);
                    if banks.unpin(BANK, &id) {
                        let count = pins.entry(id).or_default();
                        prop_assert!(*count > 0);
                        *count -= 1;
                    }
                }
                BankOp::Tick => clock.advance(std::time::Duration::from_millis(10)),
            }

            let used = banks.used_bytes(BANK).unwrap();
            prop_assert!(used <= BANK_CAPACITY);

            let stats = banks.stats();
            let small = stats.iter().find(|s| s.name == BANK).unwrap();
            let live: u64 = (0u8..16)
                .filter_map(|i| banks.record(BANK, &format!("doc-{}", i)))
                .map(|r| r.size_bytes)
                .sum();
            prop_assert_eq!(small.used_bytes, live);

            for (id, count) in &pins {
                if let Some(record) = banks.record(BANK, id) {
                    prop_assert_eq!(record.ref_count, *count);
                }
            }
        }
    }

    /// Property: a request larger than capacity never evicts anything.
    #[test]
    fn prop_oversized_request_is_rejected_untouched(
        sizes in prop::collection::vec(1u64..=200, 1..5),
        oversize in (BANK_CAPACITY + 1)..(BANK_CAPACITY * 4),
    ) {
        let banks = allocator(Arc::new(ManualClock::new(0)));
        for (i, size) in sizes.iter().enumerate() {
            banks.allocate(BANK, &format!("doc-{}", i), *size).unwrap();
        }
        let before = banks.used_bytes(BANK).unwrap();

        let is_capacity_error = matches!(
            banks.allocate(BANK, "huge", oversize),
            Err(Error::Capacity { .. })
        );
        prop_assert!(is_capacity_error);
        prop_assert_eq!(banks.used_bytes(BANK).unwrap(), before);
        prop_assert_eq!(banks.allocation_count(), sizes.len());
    }
}

// =============================================================================
// Tier 1 Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: size equals the resident sum and protected entries are never evicted.
    #[test]
    fn prop_tier1_accounting(entries in prop::collection::vec(entry_strategy(), 1..60)) {
        let store = TierStore::new(Tier1Config {
            capacity: 2000,
            partitions: vec!["contract".into(), "memo".into()],
            ..Default::default()
        })
        .unwrap();

        for (i, (id, size, priority, risk)) in entries.into_iter().enumerate() {
            let document_type = if id % 2 == 0 { "contract" } else { "memo" };
            let entry = CacheEntry::new(format!("doc-{}", id), document_type, vec![0u8; size as usize])
                .with_priority(priority)
                .with_risk_level(risk)
                .with_access_count(i as u64 % 5);

            let outcome = store.insert(entry).unwrap();
            for evicted in &outcome.evicted {
                prop_assert!(evicted.risk_level != RiskLevel::Critical);
                prop_assert!(evicted.priority < 250);
            }

            let resident: u64 = store.snapshot().iter().map(|e| e.size_bytes).sum();
            prop_assert_eq!(store.size(), resident);
            let by_partition: u64 = store.partition_stats().iter().map(|p| p.size_bytes).sum();
            prop_assert_eq!(by_partition, resident);
        }
    }
}

// =============================================================================
// Backend Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: prefix scans return exactly the keys written and not deleted.
    #[test]
    fn prop_prefix_scan_matches_live_keys(
        writes in prop::collection::vec((0u8..3, 0u8..10), 1..40),
        deletes in prop::collection::vec((0u8..3, 0u8..10), 0..10),
    ) {
        let prefixes = ["doctier:doc:", "doctier:search:", "other:doc:"];
        let backend = InMemoryBackend::new();

        tokio_test::block_on(async {
            let mut live = std::collections::BTreeSet::new();
            for (p, k) in &writes {
                let key = format!("{}{}", prefixes[*p as usize], k);
                backend
                    .set_ex(&key, Bytes::from_static(b"v"), std::time::Duration::from_secs(60))
                    .await
                    .unwrap();
                live.insert(key);
            }
            for (p, k) in &deletes {
                let key = format!("{}{}", prefixes[*p as usize], k);
                backend.delete(&[key.clone()]).await.unwrap();
                live.remove(&key);
            }

            for prefix in prefixes {
                let mut listed = backend.keys_with_prefix(prefix).await.unwrap();
                listed.sort();
                let expected: Vec<String> = live
                    .iter()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                prop_assert_eq!(listed, expected);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
