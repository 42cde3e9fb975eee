//! Cache Metrics Collection
//!
//! Hit/miss/latency counters for every tier, exposed read-only as a
//! [`StatsSnapshot`] or as Prometheus text.
//!
//! Counters are plain atomics bumped on the hot path. Gauges (entry counts,
//! memory, bank usage) are refreshed from snapshot copies by the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use super::bank::BankStats;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct TierCells {
    queries: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    count: AtomicU64,
    memory_usage: AtomicU64,
}

impl TierCells {
    fn hit(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn hit_ratio(&self) -> f64 {
        let queries = self.queries.load(Ordering::Relaxed);
        if queries == 0 {
            0.0
        } else {
            self.hits.load(Ordering::Relaxed) as f64 / queries as f64
        }
    }

    fn snapshot(&self) -> TierCounters {
        TierCounters {
            count: self.count.load(Ordering::Relaxed),
            memory_usage: self.memory_usage.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.queries.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.memory_usage.store(0, Ordering::Relaxed);
    }
}

/// Per-tier counters in a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierCounters {
    pub count: u64,
    pub memory_usage: u64,
    pub queries: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Point-in-time statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub tier1: TierCounters,
    pub tier2: TierCounters,
    pub banks: Vec<BankStats>,
    /// Unweighted mean of the tier 1 and tier 2 hit ratios
    pub hit_ratio: f64,
    pub avg_response_time_ms: f64,
    pub total_documents: u64,
    pub sync_conflicts: u64,
    pub tier2_failures: u64,
    pub bank_hits: u64,
    pub bank_misses: u64,
    pub tier1_evictions: u64,
    pub bank_evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct MetricsCollector {
    tier1: TierCells,
    tier2: TierCells,
    bank_hits: AtomicU64,
    bank_misses: AtomicU64,

    tier1_evictions: AtomicU64,
    bank_evictions: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,

    sync_conflicts: AtomicU64,
    tier2_failures: AtomicU64,

    // Microseconds, exponential moving average
    response_time_us: AtomicU64,

    banks: Mutex<Vec<BankStats>>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Tier 1
    pub fn record_tier1_hit(&self) {
        self.tier1.hit();
    }

    pub fn record_tier1_miss(&self) {
        self.tier1.miss();
    }

    pub fn record_tier1_evictions(&self, n: u64) {
        self.tier1_evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn update_tier1_stats(&self, count: u64, memory_usage: u64) {
        self.tier1.count.store(count, Ordering::Relaxed);
        self.tier1.memory_usage.store(memory_usage, Ordering::Relaxed);
    }

    // Tier 2
    pub fn record_tier2_hit(&self) {
        self.tier2.hit();
    }

    pub fn record_tier2_miss(&self) {
        self.tier2.miss();
    }

    pub fn record_tier2_failure(&self) {
        self.tier2_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_tier2_stats(&self, count: u64, memory_usage: u64) {
        self.tier2.count.store(count, Ordering::Relaxed);
        self.tier2.memory_usage.store(memory_usage, Ordering::Relaxed);
    }

    // Banks
    pub fn record_bank_hit(&self) {
        self.bank_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bank_miss(&self) {
        self.bank_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bank_evictions(&self, n: u64) {
        self.bank_evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn update_bank_stats(&self, banks: Vec<BankStats>) {
        *self.banks.lock() = banks;
    }

    // Movement
    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    // Sync
    pub fn record_sync_conflict(&self) {
        self.sync_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_conflicts(&self) -> u64 {
        self.sync_conflicts.load(Ordering::Relaxed)
    }

    pub fn tier2_failures(&self) -> u64 {
        self.tier2_failures.load(Ordering::Relaxed)
    }

    pub fn tier1_hit_ratio(&self) -> f64 {
        self.tier1.hit_ratio()
    }

    pub fn tier2_hit_ratio(&self) -> f64 {
        self.tier2.hit_ratio()
    }

    /// Unweighted mean of the tier 1 and tier 2 hit ratios
    pub fn hit_ratio(&self) -> f64 {
        (self.tier1_hit_ratio() + self.tier2_hit_ratio()) / 2.0
    }

    // Latency tracking
    pub fn record_response_time(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.response_time_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .response_time_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn avg_response_time(&self) -> Duration {
        Duration::from_micros(self.response_time_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> StatsSnapshot {
        let tier1 = self.tier1.snapshot();
        let tier2 = self.tier2.snapshot();
        let banks = self.banks.lock().clone();
        let bank_documents: u64 = banks.iter().map(|b| b.allocation_count as u64).sum();

        StatsSnapshot {
            hit_ratio: self.hit_ratio(),
            avg_response_time_ms: self.avg_response_time().as_secs_f64() * 1000.0,
            total_documents: tier1.count + tier2.count + bank_documents,
            sync_conflicts: self.sync_conflicts(),
            tier2_failures: self.tier2_failures(),
            bank_hits: self.bank_hits.load(Ordering::Relaxed),
            bank_misses: self.bank_misses.load(Ordering::Relaxed),
            tier1_evictions: self.tier1_evictions.load(Ordering::Relaxed),
            bank_evictions: self.bank_evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            tier1,
            tier2,
            banks,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.tier1.reset();
        self.tier2.reset();
        self.bank_hits.store(0, Ordering::Relaxed);
        self.bank_misses.store(0, Ordering::Relaxed);
        self.tier1_evictions.store(0, Ordering::Relaxed);
        self.bank_evictions.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.demotions.store(0, Ordering::Relaxed);
        self.sync_conflicts.store(0, Ordering::Relaxed);
        self.tier2_failures.store(0, Ordering::Relaxed);
        self.response_time_us.store(0, Ordering::Relaxed);
        self.banks.lock().clear();
    }

    /// Render the current snapshot in the Prometheus text format
    pub fn export_prometheus(&self) -> Result<String> {
        let snapshot = self.snapshot();
        let registry = Registry::new_custom(Some("doctier".to_string()), None)
            .map_err(prom_err)?;

        let queries = IntCounterVec::new(
            Opts::new("tier_queries_total", "Lookups per tier"),
            &["tier", "outcome"],
        )
        .map_err(prom_err)?;
        let entries = IntGaugeVec::new(Opts::new("tier_entries", "Entries per tier"), &["tier"])
            .map_err(prom_err)?;
        let memory = IntGaugeVec::new(
            Opts::new("tier_memory_bytes", "Bytes held per tier"),
            &["tier"],
        )
        .map_err(prom_err)?;
        for (tier, counters) in [("tier1", &snapshot.tier1), ("tier2", &snapshot.tier2)] {
            queries.with_label_values(&[tier, "hit"]).inc_by(counters.hits);
            queries.with_label_values(&[tier, "miss"]).inc_by(counters.misses);
            entries.with_label_values(&[tier]).set(counters.count as i64);
            memory.with_label_values(&[tier]).set(counters.memory_usage as i64);
        }
        queries.with_label_values(&["bank", "hit"]).inc_by(snapshot.bank_hits);
        queries.with_label_values(&["bank", "miss"]).inc_by(snapshot.bank_misses);

        let bank_used = IntGaugeVec::new(
            Opts::new("bank_used_bytes", "Bytes allocated per bank"),
            &["bank"],
        )
        .map_err(prom_err)?;
        let bank_capacity = IntGaugeVec::new(
            Opts::new("bank_capacity_bytes", "Capacity per bounded bank"),
            &["bank"],
        )
        .map_err(prom_err)?;
        let bank_allocations = IntGaugeVec::new(
            Opts::new("bank_allocations", "Allocations per bank"),
            &["bank"],
        )
        .map_err(prom_err)?;
        for bank in &snapshot.banks {
            bank_used.with_label_values(&[&bank.name]).set(bank.used_bytes as i64);
            bank_allocations
                .with_label_values(&[&bank.name])
                .set(bank.allocation_count as i64);
            if let Some(capacity) = bank.capacity_bytes {
                bank_capacity.with_label_values(&[&bank.name]).set(capacity as i64);
            }
        }

        let movement = IntCounterVec::new(
            Opts::new("movements_total", "Entries moved between tiers"),
            &["kind"],
        )
        .map_err(prom_err)?;
        movement.with_label_values(&["promotion"]).inc_by(snapshot.promotions);
        movement.with_label_values(&["demotion"]).inc_by(snapshot.demotions);
        movement
            .with_label_values(&["tier1_eviction"])
            .inc_by(snapshot.tier1_evictions);
        movement
            .with_label_values(&["bank_eviction"])
            .inc_by(snapshot.bank_evictions);

        let conflicts = IntGauge::new("sync_conflicts", "Malformed or rejected sync messages")
            .map_err(prom_err)?;
        conflicts.set(snapshot.sync_conflicts as i64);
        let failures = IntGauge::new("tier2_failures", "Failed or timed out tier 2 calls")
            .map_err(prom_err)?;
        failures.set(snapshot.tier2_failures as i64);
        let hit_ratio = Gauge::new("hit_ratio", "Mean of tier 1 and tier 2 hit ratios")
            .map_err(prom_err)?;
        hit_ratio.set(snapshot.hit_ratio);
        let response = Gauge::new("avg_response_time_ms", "Smoothed lookup latency")
            .map_err(prom_err)?;
        response.set(snapshot.avg_response_time_ms);

        registry.register(Box::new(queries)).map_err(prom_err)?;
        registry.register(Box::new(entries)).map_err(prom_err)?;
        registry.register(Box::new(memory)).map_err(prom_err)?;
        registry.register(Box::new(bank_used)).map_err(prom_err)?;
        registry.register(Box::new(bank_capacity)).map_err(prom_err)?;
        registry.register(Box::new(bank_allocations)).map_err(prom_err)?;
        registry.register(Box::new(movement)).map_err(prom_err)?;
        registry.register(Box::new(conflicts)).map_err(prom_err)?;
        registry.register(Box::new(failures)).map_err(prom_err)?;
        registry.register(Box::new(hit_ratio)).map_err(prom_err)?;
        registry.register(Box::new(response)).map_err(prom_err)?;

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

/// Latency tracker for measuring operation duration
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
