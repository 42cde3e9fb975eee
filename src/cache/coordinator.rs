//! Cache Coordinator - Unified Tiered Document Cache
//!
//! Orchestrates tier 1, tier 2 and the overflow banks: writes land in
//! tier 1, are copied to tier 2 best-effort and overflow into a bank when
//! the policy says so; reads walk the tiers in order and promote deeper
//! hits. Tier 1 eviction victims are demoted into a bank, and bank eviction
//! victims fall through to the persistent bank.
//!
//! Operations on the same id are serialized by a striped async lock.
//! Eviction victims are staged while the evicting operation holds its own
//! lock and placed afterwards under the victim's lock, one at a time; a
//! later write of the victim's id supersedes the staged copy. A single sync
//! worker applies change events from other instances; a second task
//! refreshes aggregate statistics periodically.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backend::{ChannelMessage, DistributedBackend, InMemoryBackend};
use super::bank::{Allocation, BankAllocator, BankLookup, ReleasedAllocation};
use super::bulk::{BulkStore, InMemoryBulkStore};
use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::distributed::{
    ChangeEvent, ChangeOperation, DistributedTier, Envelope, SearchInvalidation, SearchKey,
    SearchResults, TtlClass,
};
use super::entry::{AllocationRecord, CacheEntry, SyncStatus, Tier};
use super::metrics::{LatencyTracker, MetricsCollector, StatsSnapshot};
use super::tier_store::{EntryFilter, TierStore};
use crate::error::{Error, Result};

/// Number of per-id lock stripes
const ID_LOCK_STRIPES: usize = 64;

/// Bulk store namespace receiving tier 1 on destroy
pub const FLUSH_NAMESPACE: &str = "tier1";

/// Lookup result
#[derive(Debug, Clone)]
pub struct Lookup {
    /// The entry, with its access recorded
    pub entry: CacheEntry,
    /// Where the entry was found
    pub source: Tier,
    /// Lookup latency
    pub latency: Duration,
}

/// Eviction victim waiting for its own id lock
struct Demotion {
    token: u64,
    entry: CacheEntry,
    /// Bank that evicted it; `None` for tier 1 victims
    from_bank: Option<String>,
}

/// Components shared with the background tasks
struct Core {
    instance_id: Uuid,
    config: CacheConfig,
    tier1: TierStore,
    tier2: DistributedTier,
    banks: BankAllocator,
    bulk: Arc<dyn BulkStore>,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    id_locks: Vec<AsyncMutex<()>>,
    /// Id -> token of its newest staged demotion
    pending: DashMap<String, u64>,
    next_token: AtomicU64,
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    destroyed: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// Unified tiered document cache
pub struct CacheCoordinator {
    core: Arc<Core>,
    lifecycle: AsyncMutex<Lifecycle>,
    shutdown: CancellationToken,
}

impl CacheCoordinator {
    /// Create a coordinator on the wall clock
    pub fn new(
        config: CacheConfig,
        backend: Arc<dyn DistributedBackend>,
        bulk: Arc<dyn BulkStore>,
    ) -> Result<Self> {
        Self::with_clock(config, backend, bulk, Arc::new(SystemClock))
    }

    /// Create a coordinator with an injected clock
    pub fn with_clock(
        config: CacheConfig,
        backend: Arc<dyn DistributedBackend>,
        bulk: Arc<dyn BulkStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsCollector::new());
        let core = Core {
            instance_id: Uuid::new_v4(),
            tier1: TierStore::new(config.tier1.clone())?,
            tier2: DistributedTier::new(backend, config.distributed.clone(), metrics.clone()),
            banks: BankAllocator::new(
                &config.banks.banks,
                &config.banks.fallback,
                config.overflow.clone(),
                clock.clone(),
            )?,
            bulk,
            metrics,
            clock,
            id_locks: (0..ID_LOCK_STRIPES).map(|_| AsyncMutex::new(())).collect(),
            pending: DashMap::new(),
            next_token: AtomicU64::new(0),
            config,
        };

        Ok(Self {
            core: Arc::new(core),
            lifecycle: AsyncMutex::new(Lifecycle::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Create with in-memory tier 2 and bulk store (for testing)
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(InMemoryBackend::new()),
            Arc::new(InMemoryBulkStore::new()),
        )
    }

    /// Identity stamped on published change events
    pub fn instance_id(&self) -> Uuid {
        self.core.instance_id
    }

    /// Subscribe to change events and start background tasks
    ///
    /// Idempotent. If tier 2 cannot subscribe the cache runs without
    /// cross-instance sync.
    pub async fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.destroyed {
            return Err(Error::Internal("coordinator already destroyed".into()));
        }
        if lifecycle.initialized {
            return Ok(());
        }

        match self.core.tier2.subscribe().await {
            Some(rx) => {
                let worker = spawn_sync_worker(self.core.clone(), rx, self.shutdown.clone());
                lifecycle.tasks.push(worker);
            }
            None => warn!(
                backend = self.core.tier2.backend_name(),
                "Running without cross-instance sync"
            ),
        }
        lifecycle.tasks.push(spawn_stats_task(
            self.core.clone(),
            self.core.config.stats_interval,
            self.shutdown.clone(),
        ));

        lifecycle.initialized = true;
        info!(
            instance = %self.core.instance_id,
            backend = self.core.tier2.backend_name(),
            partitions = ?self.core.config.tier1.partitions,
            "Cache coordinator initialized"
        );
        Ok(())
    }

    /// Whether [`initialize`](Self::initialize) has run
    pub async fn is_initialized(&self) -> bool {
        self.lifecycle.lock().await.initialized
    }

    /// Store a document
    ///
    /// Only tier 1 failures surface; tier 2 and overflow are best-effort.
    #[instrument(skip(self, entry), fields(id = %entry.id, document_type = %entry.document_type))]
    pub async fn store(&self, entry: CacheEntry) -> Result<()> {
        self.core.store(entry, TtlClass::Document).await
    }

    /// Store a derived artifact, such as an analysis result or embedding
    ///
    /// Behaves like [`store`](Self::store) but the tier 2 copy lives for the
    /// TTL of `class`.
    #[instrument(skip(self, entry), fields(id = %entry.id, document_type = %entry.document_type))]
    pub async fn store_with_class(&self, entry: CacheEntry, class: TtlClass) -> Result<()> {
        self.core.store(entry, class).await
    }

    /// Get a document from whichever tier holds it
    pub async fn get(&self, id: &str) -> Option<CacheEntry> {
        self.lookup(id).await.map(|found| found.entry)
    }

    /// Get a document along with the tier it came from
    #[instrument(skip(self))]
    pub async fn lookup(&self, id: &str) -> Option<Lookup> {
        self.core.lookup(id).await
    }

    /// Remove a document from every tier and bank
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> bool {
        self.core.remove(id).await
    }

    /// Filtered scan of one tier 1 partition
    pub fn query(&self, document_type: &str, filter: &EntryFilter) -> Result<Vec<CacheEntry>> {
        self.core.tier1.query(document_type, filter)
    }

    /// Predicate scan of one tier 1 partition
    pub fn find_by_type<F>(&self, document_type: &str, predicate: F) -> Result<Vec<CacheEntry>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        self.core.tier1.find_by_type(document_type, predicate)
    }

    /// Cache search results keyed by `(query, filters, options)`
    pub async fn cache_search(
        &self,
        query: &str,
        filters: &serde_json::Value,
        options: &serde_json::Value,
        results: &SearchResults,
    ) -> bool {
        let key = SearchKey::new(query, filters, options);
        self.core.tier2.cache_search(&key, results).await
    }

    /// Cached search results, if present
    pub async fn cached_search(
        &self,
        query: &str,
        filters: &serde_json::Value,
        options: &serde_json::Value,
    ) -> Option<SearchResults> {
        let key = SearchKey::new(query, filters, options);
        self.core.tier2.cached_search(&key).await
    }

    /// Drop every cached search result and tell other instances
    #[instrument(skip(self))]
    pub async fn invalidate_search(&self, criteria: Option<&str>) -> u64 {
        let cleared = self.core.tier2.clear_search().await;
        let invalidation = SearchInvalidation {
            criteria: criteria.map(str::to_string),
            origin: Some(self.core.instance_id),
        };
        self.core.tier2.publish_invalidation(&invalidation).await;
        debug!(cleared, "Invalidated search results");
        cleared
    }

    /// Refresh gauges and take a snapshot
    pub async fn stats(&self) -> StatsSnapshot {
        self.core.refresh_stats().await;
        self.core.metrics.snapshot()
    }

    /// Refresh gauges and render Prometheus text
    pub async fn export_prometheus(&self) -> Result<String> {
        self.core.refresh_stats().await;
        self.core.metrics.export_prometheus()
    }

    /// Get reference to the metrics collector
    pub fn metrics(&self) -> &MetricsCollector {
        &self.core.metrics
    }

    /// Get reference to tier 1
    pub fn tier1(&self) -> &TierStore {
        &self.core.tier1
    }

    /// Get reference to tier 2
    pub fn tier2(&self) -> &DistributedTier {
        &self.core.tier2
    }

    /// Get reference to the bank allocator
    pub fn banks(&self) -> &BankAllocator {
        &self.core.banks
    }

    /// Get reference to the bulk store
    pub fn bulk(&self) -> &Arc<dyn BulkStore> {
        &self.core.bulk
    }

    /// Get configuration
    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    /// Wipe every tier, bank and statistic
    pub async fn clear(&self) {
        self.core.clear().await;
        info!(instance = %self.core.instance_id, "Cache cleared");
    }

    /// Stop background tasks, flush tier 1 if configured, close tier 2
    ///
    /// Idempotent; the coordinator cannot be initialized again afterwards.
    pub async fn destroy(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.destroyed {
            return Ok(());
        }

        self.shutdown.cancel();
        for task in lifecycle.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Background task failed");
                }
            }
        }

        if self.core.config.flush_on_destroy {
            let flushed = self.core.flush().await?;
            info!(flushed, "Flushed tier 1 to bulk store");
        }
        self.core.tier2.close().await;

        lifecycle.initialized = false;
        lifecycle.destroyed = true;
        info!(instance = %self.core.instance_id, "Cache coordinator destroyed");
        Ok(())
    }
}

impl Drop for CacheCoordinator {
    fn drop(&mut self) {
        // Background tasks hold the core; let them exit
        self.shutdown.cancel();
    }
}

impl Core {
    async fn lock_id(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.id_locks.len();
        self.id_locks[stripe].lock().await
    }

    async fn store(&self, entry: CacheEntry, class: TtlClass) -> Result<()> {
        let tracker = LatencyTracker::start();
        let mut staged = Vec::new();
        let stored = {
            let _guard = self.lock_id(&entry.id).await;
            self.store_locked(entry, class, &mut staged).await
        };
        self.demote(staged).await;
        if stored.is_ok() {
            self.metrics.record_response_time(tracker.elapsed());
        }
        stored
    }

    async fn store_locked(
        &self,
        mut entry: CacheEntry,
        class: TtlClass,
        staged: &mut Vec<Demotion>,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        self.pending.remove(&entry.id);

        let previous = self.tier1.find_in(&entry.document_type, &entry.id)?;
        if let Some(previous) = &previous {
            if entry.created_at == 0 {
                entry.created_at = previous.created_at;
            }
            entry.access_count = entry.access_count.max(previous.access_count);
        }
        if entry.created_at == 0 {
            entry.created_at = now;
        }
        entry.last_accessed_at = now;
        entry.tier = Tier::Tier1;
        entry.sync_status = SyncStatus::Pending;

        let outcome = self.tier1.insert(entry.clone())?;
        // A bank copy of an earlier version is stale now
        let had_bank_copy = self.release_bank_copy(&entry.id).await;
        self.stage_evicted(outcome.evicted, staged);

        let operation = if previous.is_some() || had_bank_copy {
            ChangeOperation::Update
        } else {
            ChangeOperation::Create
        };

        let mut replica = entry.clone();
        replica.sync_status = SyncStatus::Synced;
        let status = if self.tier2.set_with_class(&replica, class).await {
            SyncStatus::Synced
        } else {
            SyncStatus::Dirty
        };
        self.tier1.update(&entry.id, |e| e.sync_status = status);
        entry.sync_status = status;

        if self.banks.policy().should_overflow(&entry, now) && self.banks.locate(&entry.id).is_none()
        {
            if let Some(bank) = self.place(entry.clone(), staged).await {
                debug!(id = %entry.id, bank = %bank, "Overflowed into bank");
            }
        }

        self.tier2
            .publish(&ChangeEvent::upsert(operation, replica, self.instance_id))
            .await;
        Ok(())
    }

    async fn lookup(&self, id: &str) -> Option<Lookup> {
        let tracker = LatencyTracker::start();
        let mut staged = Vec::new();
        let found = {
            let _guard = self.lock_id(id).await;
            self.lookup_locked(id, &mut staged).await
        };
        self.demote(staged).await;

        let latency = tracker.elapsed();
        self.metrics.record_response_time(latency);
        found.map(|(entry, source)| Lookup {
            entry,
            source,
            latency,
        })
    }

    async fn lookup_locked(
        &self,
        id: &str,
        staged: &mut Vec<Demotion>,
    ) -> Option<(CacheEntry, Tier)> {
        let now = self.clock.now_millis();

        if let Some(entry) = self.tier1.touch(id, now) {
            self.metrics.record_tier1_hit();
            return Some((entry, Tier::Tier1));
        }
        self.metrics.record_tier1_miss();

        if let Some(mut entry) = self.tier2.get(id).await {
            self.metrics.record_tier2_hit();
            entry.record_access(now);
            entry.sync_status = SyncStatus::Synced;
            if self.promote(entry.clone(), staged).await {
                entry.tier = Tier::Tier1;
                // Promoted copy supersedes any bank copy
                self.release_bank_copy(id).await;
            }
            return Some((entry, Tier::Tier2));
        }
        self.metrics.record_tier2_miss();

        let found = match self.banks.lookup(id) {
            Some(BankLookup::Resident { record, entry }) => Some((record, entry, false)),
            Some(BankLookup::Persisted { record }) => self
                .read_persisted(&record, now)
                .await
                .map(|entry| (record, entry, true)),
            None => None,
        };
        let Some((record, mut entry, persisted)) = found else {
            self.metrics.record_bank_miss();
            return None;
        };
        self.metrics.record_bank_hit();
        let source = Tier::Bank(record.bank.clone());

        if self
            .config
            .promotion
            .should_promote_from_bank(entry.access_count)
            && self.promote(entry.clone(), staged).await
        {
            self.release_bank_copy(id).await;
            entry.tier = Tier::Tier1;
            let mut replica = entry.clone();
            replica.sync_status = SyncStatus::Synced;
            let status = if self.tier2.set_document(&replica).await {
                SyncStatus::Synced
            } else {
                SyncStatus::Dirty
            };
            self.tier1.update(id, |e| e.sync_status = status);
            entry.sync_status = status;
            debug!(id = %id, bank = %record.bank, access_count = entry.access_count, "Promoted from bank");
        } else if persisted {
            // Keep the access count durable for the next threshold check
            if let Err(e) = self.persist_payload(&record.bank, &entry).await {
                warn!(id = %id, error = %e, "Failed to update persisted entry");
            }
        }

        Some((entry, source))
    }

    async fn remove(&self, id: &str) -> bool {
        let _guard = self.lock_id(id).await;
        self.pending.remove(id);
        let mut removed = false;
        let mut document_type = None;

        if let Some(entry) = self.tier1.remove(id) {
            removed = true;
            document_type = Some(entry.document_type);
        }

        if let Some(released) = self.banks.free_anywhere(id) {
            removed = true;
            match released.entry {
                Some(entry) => {
                    if document_type.is_none() {
                        document_type = Some(entry.document_type);
                    }
                }
                None => {
                    if document_type.is_none() {
                        document_type = self
                            .bulk
                            .get(&released.record.bank, id)
                            .await
                            .ok()
                            .flatten()
                            .and_then(|data| Envelope::decode(&data).ok())
                            .map(|envelope| envelope.entry.document_type);
                    }
                    if let Err(e) = self.bulk.delete(&released.record.bank, id).await {
                        warn!(id = %id, error = %e, "Failed to delete persisted payload");
                    }
                }
            }
        }

        if document_type.is_none() {
            document_type = self.tier2.get(id).await.map(|entry| entry.document_type);
        }
        if self.tier2.delete(id).await {
            removed = true;
        }

        if let Some(document_type) = document_type {
            self.tier2
                .publish(&ChangeEvent::delete(id, document_type, self.instance_id))
                .await;
        }
        removed
    }

    /// Insert into tier 1; true if the entry is still resident afterwards
    async fn promote(&self, mut entry: CacheEntry, staged: &mut Vec<Demotion>) -> bool {
        let id = entry.id.clone();
        entry.tier = Tier::Tier1;
        match self.tier1.insert(entry) {
            Ok(outcome) => {
                self.metrics.record_promotion();
                let resident = !outcome.evicted.iter().any(|e| e.id == id);
                self.stage_evicted(outcome.evicted, staged);
                resident
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Promotion into tier 1 skipped");
                false
            }
        }
    }

    fn stage(&self, entry: CacheEntry, from_bank: Option<String>) -> Demotion {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(entry.id.clone(), token);
        Demotion {
            token,
            entry,
            from_bank,
        }
    }

    /// Record tier 1 eviction victims for demotion
    fn stage_evicted(&self, victims: Vec<CacheEntry>, staged: &mut Vec<Demotion>) {
        if victims.is_empty() {
            return;
        }
        self.metrics.record_tier1_evictions(victims.len() as u64);
        staged.extend(victims.into_iter().map(|entry| self.stage(entry, None)));
    }

    /// Record bank eviction victims for the persistent bank
    fn stage_spilled(&self, evicted: Vec<ReleasedAllocation>, staged: &mut Vec<Demotion>) {
        if evicted.is_empty() {
            return;
        }
        self.metrics.record_bank_evictions(evicted.len() as u64);
        for released in evicted {
            if let Some(entry) = released.entry {
                staged.push(self.stage(entry, Some(released.record.bank)));
            }
        }
    }

    /// Place staged victims, each under its own id lock
    ///
    /// Callers must not hold an id lock.
    async fn demote(&self, staged: Vec<Demotion>) {
        let mut queue = VecDeque::from(staged);
        while let Some(demotion) = queue.pop_front() {
            let mut spilled = Vec::new();
            {
                let _guard = self.lock_id(&demotion.entry.id).await;
                self.settle(demotion, &mut spilled).await;
            }
            queue.extend(spilled);
        }
    }

    async fn settle(&self, demotion: Demotion, staged: &mut Vec<Demotion>) {
        let Demotion {
            token,
            entry,
            from_bank,
        } = demotion;
        let id = entry.id.clone();

        if self
            .pending
            .remove_if(&id, |_, current| *current == token)
            .is_none()
        {
            debug!(id = %id, "Eviction victim superseded by a later write");
            return;
        }
        // Tier 1 holds the authoritative copy
        if self.tier1.find(&id).is_some() {
            return;
        }

        match from_bank {
            None => {
                // Overflow copies are already in place
                if self.banks.locate(&id).is_some() {
                    self.metrics.record_demotion();
                    return;
                }
                match self.place(entry, staged).await {
                    Some(bank) => {
                        self.metrics.record_demotion();
                        debug!(id = %id, bank = %bank, "Demoted from tier 1");
                    }
                    None => warn!(id = %id, "Evicted entry could not be demoted"),
                }
            }
            Some(from) => {
                if self.banks.locate(&id).is_some() {
                    return;
                }
                let fallback = self.banks.fallback_bank().to_string();
                match self.persist(&fallback, &entry).await {
                    Ok(allocation) => {
                        self.stage_spilled(allocation.evicted, staged);
                        self.metrics.record_demotion();
                        debug!(id = %id, from = %from, "Spilled to persistent bank");
                    }
                    Err(e) => warn!(id = %id, error = %e, "Dropped evicted bank entry"),
                }
            }
        }
    }

    /// Put an entry in its selected bank, falling back to the persistent bank
    async fn place(&self, entry: CacheEntry, staged: &mut Vec<Demotion>) -> Option<String> {
        let bank = self.banks.select_bank(&entry);
        let placed = if self.banks.is_unbounded(&bank) {
            self.persist(&bank, &entry).await
        } else {
            self.banks.allocate_entry(&bank, entry.clone())
        };

        match placed {
            Ok(allocation) => {
                self.stage_spilled(allocation.evicted, staged);
                Some(bank)
            }
            Err(e) => {
                let fallback = self.banks.fallback_bank().to_string();
                if bank == fallback {
                    warn!(id = %entry.id, bank = %bank, error = %e, "Fallback bank rejected entry");
                    return None;
                }
                debug!(id = %entry.id, bank = %bank, error = %e, "Bank full, using fallback");
                match self.persist(&fallback, &entry).await {
                    Ok(_) => Some(fallback),
                    Err(e) => {
                        warn!(id = %entry.id, error = %e, "Fallback bank rejected entry");
                        None
                    }
                }
            }
        }
    }

    async fn persist_payload(&self, bank: &str, entry: &CacheEntry) -> Result<()> {
        let mut stored = entry.clone();
        stored.tier = Tier::Bank(bank.to_string());
        let data = Envelope::wrap(stored).encode()?;
        self.bulk.put(bank, &entry.id, data).await
    }

    /// Write the payload to the bulk store, then account for it
    async fn persist(&self, bank: &str, entry: &CacheEntry) -> Result<Allocation> {
        self.persist_payload(bank, entry).await?;
        self.banks.allocate(bank, &entry.id, entry.size_bytes)
    }

    /// Read a persisted payload with its allocation pinned
    async fn read_persisted(&self, record: &AllocationRecord, now: u64) -> Option<CacheEntry> {
        self.banks.pin(&record.bank, &record.id);
        let read = self.bulk.get(&record.bank, &record.id).await;
        self.banks.unpin(&record.bank, &record.id);

        let data = match read {
            Ok(Some(data)) => data,
            Ok(None) => {
                warn!(id = %record.id, bank = %record.bank, "Persisted allocation has no payload");
                self.banks.free(&record.bank, &record.id);
                return None;
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "Bulk store read failed");
                return None;
            }
        };
        match Envelope::decode(&data) {
            Ok(envelope) => {
                let mut entry = envelope.entry;
                entry.record_access(now);
                entry.tier = Tier::Bank(record.bank.clone());
                Some(entry)
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "Undecodable persisted entry");
                None
            }
        }
    }

    /// Free any bank copy of `id`; true if one existed
    async fn release_bank_copy(&self, id: &str) -> bool {
        let Some(released) = self.banks.free_anywhere(id) else {
            return false;
        };
        if released.entry.is_none() {
            if let Err(e) = self.bulk.delete(&released.record.bank, id).await {
                warn!(id = %id, error = %e, "Failed to delete persisted payload");
            }
        }
        true
    }

    /// Apply one pub/sub message; failures never escape
    async fn apply_message(&self, message: ChannelMessage) {
        if message.channel == self.tier2.invalidate_channel() {
            match serde_json::from_str::<SearchInvalidation>(&message.payload) {
                Ok(invalidation) if invalidation.origin == Some(self.instance_id) => {}
                Ok(invalidation) => {
                    let cleared = self.tier2.clear_search().await;
                    debug!(criteria = ?invalidation.criteria, cleared, "Applied search invalidation");
                }
                Err(e) => {
                    self.metrics.record_sync_conflict();
                    warn!(channel = %message.channel, error = %e, "Malformed invalidation dropped");
                }
            }
            return;
        }

        if !self.tier2.is_document_channel(&message.channel) {
            debug!(channel = %message.channel, "Ignoring message on unexpected channel");
            return;
        }

        let event = match ChangeEvent::parse(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.record_sync_conflict();
                warn!(channel = %message.channel, error = %e, "Malformed change event dropped");
                return;
            }
        };
        if event.origin == Some(self.instance_id) {
            return;
        }

        let id = event.id.clone();
        if let Err(e) = self.apply_event(event).await {
            self.metrics.record_sync_conflict();
            warn!(id = %id, error = %e, "Change event rejected");
        }
    }

    async fn apply_event(&self, event: ChangeEvent) -> Result<()> {
        let mut staged = Vec::new();
        let applied = {
            let _guard = self.lock_id(&event.id).await;
            self.apply_event_locked(event, &mut staged).await
        };
        self.demote(staged).await;
        applied
    }

    async fn apply_event_locked(
        &self,
        event: ChangeEvent,
        staged: &mut Vec<Demotion>,
    ) -> Result<()> {
        self.pending.remove(&event.id);
        match event.operation {
            ChangeOperation::Delete => {
                self.tier1.remove(&event.id);
                self.release_bank_copy(&event.id).await;
                debug!(id = %event.id, "Applied remote delete");
            }
            ChangeOperation::Create | ChangeOperation::Update => {
                let Some(mut entry) = event.entry else {
                    return Err(Error::SyncConflict(format!("{} carries no entry", event.id)));
                };
                if let Some(local) = self.tier1.find_in(&entry.document_type, &entry.id)? {
                    entry.access_count = entry.access_count.max(local.access_count);
                }
                entry.tier = Tier::Tier1;
                entry.sync_status = SyncStatus::Synced;

                let outcome = self.tier1.insert(entry)?;
                self.release_bank_copy(&event.id).await;
                self.stage_evicted(outcome.evicted, staged);
                debug!(id = %event.id, operation = ?event.operation, "Applied remote change");
            }
        }
        Ok(())
    }

    /// Copy gauges from snapshot reads of every tier
    async fn refresh_stats(&self) {
        self.metrics
            .update_tier1_stats(self.tier1.len() as u64, self.tier1.size());
        self.metrics.update_bank_stats(self.banks.stats());
        if let Some(count) = self.tier2.document_count().await {
            // Tier 2 memory is owned by the backend and not measured
            self.metrics.update_tier2_stats(count, 0);
        }
    }

    async fn flush(&self) -> Result<usize> {
        let entries = self.tier1.snapshot();
        for entry in &entries {
            let data = Envelope::wrap(entry.clone()).encode()?;
            self.bulk.put(FLUSH_NAMESPACE, &entry.id, data).await?;
        }
        Ok(entries.len())
    }

    async fn clear(&self) {
        self.tier1.clear();
        self.pending.clear();
        for released in self.banks.persisted_ids() {
            if let Some(bank) = self.banks.locate(&released) {
                if let Err(e) = self.bulk.delete(&bank, &released).await {
                    warn!(id = %released, error = %e, "Failed to delete persisted payload");
                }
            }
        }
        self.banks.clear();

        self.tier2.clear_documents().await;
        self.tier2.clear_search().await;
        self.metrics.reset();
    }
}

fn spawn_sync_worker(
    core: Arc<Core>,
    mut rx: mpsc::Receiver<ChannelMessage>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => core.apply_message(message).await,
                    None => {
                        warn!("Sync channel closed, cross-instance sync stopped");
                        break;
                    }
                },
            }
        }
        debug!("Sync worker stopped");
    })
}

fn spawn_stats_task(
    core: Arc<Core>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => core.refresh_stats().await,
            }
        }
        debug!("Stats task stopped");
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::entry::RiskLevel;
    use crate::cache::{LOGIC_BANK, PATTERN_BANK, PERSISTENT_BANK};
    use assert_matches::assert_matches;

    const START: u64 = 1_700_000_000_000;

    struct Fixture {
        cache: CacheCoordinator,
        backend: Arc<InMemoryBackend>,
        bulk: Arc<InMemoryBulkStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(config: CacheConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(START));
        let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
        let bulk = Arc::new(InMemoryBulkStore::new());
        let cache =
            CacheCoordinator::with_clock(config, backend.clone(), bulk.clone(), clock.clone())
                .unwrap();
        Fixture {
            cache,
            backend,
            bulk,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CacheConfig::with_partitions(["contract", "memo"]))
    }

    fn doc(id: &str, size: usize) -> CacheEntry {
        CacheEntry::new(id, "contract", vec![7u8; size])
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Bulk store whose writes stall before landing
    struct SlowBulkStore {
        inner: InMemoryBulkStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl BulkStore for SlowBulkStore {
        async fn get(&self, namespace: &str, key: &str) -> Result<Option<bytes::Bytes>> {
            self.inner.get(namespace, key).await
        }

        async fn put(&self, namespace: &str, key: &str, data: bytes::Bytes) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.put(namespace, key, data).await
        }

        async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
            self.inner.delete(namespace, key).await
        }

        async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
            self.inner.exists(namespace, key).await
        }

        fn stats(&self) -> crate::cache::bulk::BulkStoreStats {
            self.inner.stats()
        }
    }

    #[tokio::test]
    async fn test_store_and_get_from_tier1() {
        let f = fixture();
        f.cache.store(doc("d1", 10)).await.unwrap();

        let found = f.cache.lookup("d1").await.unwrap();
        assert_eq!(found.source, Tier::Tier1);
        assert_eq!(found.entry.access_count, 1);
        assert_eq!(found.entry.created_at, START);
        assert_eq!(found.entry.sync_status, SyncStatus::Synced);

        let again = f.cache.get("d1").await.unwrap();
        assert_eq!(again.access_count, 2);
    }

    #[tokio::test]
    async fn test_store_undeclared_type() {
        let f = fixture();
        let err = f
            .cache
            .store(CacheEntry::new("x", "invoice", vec![0u8; 1]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::PartitionNotFound { .. });
    }

    #[tokio::test]
    async fn test_store_replaces_and_keeps_history() {
        let f = fixture();
        f.cache.store(doc("d1", 10)).await.unwrap();
        f.cache.get("d1").await;
        f.cache.get("d1").await;

        f.clock.advance(Duration::from_secs(5));
        f.cache.store(doc("d1", 30)).await.unwrap();

        let entry = f.cache.tier1().find("d1").unwrap();
        assert_eq!(entry.size_bytes, 30);
        assert_eq!(entry.created_at, START);
        assert_eq!(entry.access_count, 2);
        assert_eq!(f.cache.tier1().len(), 1);
    }

    #[tokio::test]
    async fn test_tier2_hit_promotes() {
        let f = fixture();
        f.cache.store(doc("d1", 10)).await.unwrap();
        f.cache.tier1().remove("d1");

        let first = f.cache.lookup("d1").await.unwrap();
        assert_eq!(first.source, Tier::Tier2);
        assert_eq!(first.entry.tier, Tier::Tier1);

        let second = f.cache.lookup("d1").await.unwrap();
        assert_eq!(second.source, Tier::Tier1);

        let stats = f.cache.stats().await;
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.tier2.hits, 1);
    }

    #[tokio::test]
    async fn test_low_risk_overflows_into_logic_bank() {
        let mut config = CacheConfig::with_partitions(["contract"]);
        config.overflow.size_threshold = 1000;
        let f = fixture_with(config);

        f.cache
            .store(doc("d1", 500).with_priority(10).with_risk_level(RiskLevel::Low))
            .await
            .unwrap();

        let record = f.cache.banks().record(LOGIC_BANK, "d1").unwrap();
        assert_eq!(record.size_bytes, 500);
        assert!(!record.is_pinned());
        // Tier 1 keeps the authoritative copy
        assert_eq!(f.cache.tier1().find("d1").unwrap().tier, Tier::Tier1);
    }

    #[tokio::test]
    async fn test_medium_small_entry_does_not_overflow() {
        let f = fixture();
        f.cache.store(doc("d1", 500)).await.unwrap();
        assert!(f.cache.banks().locate("d1").is_none());
    }

    #[tokio::test]
    async fn test_bank_promotion_is_threshold_gated() {
        let f = fixture();
        f.cache
            .store(doc("d1", 100).with_risk_level(RiskLevel::Low))
            .await
            .unwrap();
        f.cache.tier1().remove("d1");
        f.cache.tier2().delete("d1").await;

        // Threshold 3: accesses 1..=3 stay in the bank
        for expected in 1..=3 {
            let found = f.cache.lookup("d1").await.unwrap();
            assert_eq!(found.source, Tier::Bank(LOGIC_BANK.into()));
            assert_eq!(found.entry.access_count, expected);
        }

        let promoted = f.cache.lookup("d1").await.unwrap();
        assert_eq!(promoted.source, Tier::Bank(LOGIC_BANK.into()));
        assert_eq!(promoted.entry.tier, Tier::Tier1);
        assert!(f.cache.banks().locate("d1").is_none());

        let after = f.cache.lookup("d1").await.unwrap();
        assert_eq!(after.source, Tier::Tier1);
    }

    #[tokio::test]
    async fn test_oversized_overflow_lands_in_persistent_bank() {
        let f = fixture();
        // Larger than every bounded bank
        let big = doc("big", 5 * 1024 * 1024);
        f.cache.store(big.clone()).await.unwrap();

        assert_eq!(f.cache.banks().locate("big").as_deref(), Some(PERSISTENT_BANK));
        assert!(f.bulk.exists(PERSISTENT_BANK, "big").await.unwrap());

        f.cache.tier1().remove("big");
        f.cache.tier2().delete("big").await;

        let found = f.cache.lookup("big").await.unwrap();
        assert_eq!(found.source, Tier::Bank(PERSISTENT_BANK.into()));
        assert_eq!(found.entry.payload, big.payload);
        assert_eq!(found.entry.access_count, 1);

        // Access count survives in the bulk store
        let found = f.cache.lookup("big").await.unwrap();
        assert_eq!(found.entry.access_count, 2);
    }

    #[tokio::test]
    async fn test_tier1_eviction_demotes_into_bank() {
        let mut config = CacheConfig::with_partitions(["contract"]);
        config.tier1.capacity = 1000;
        let f = fixture_with(config);

        for i in 0..8 {
            f.cache.store(doc(&format!("doc-{}", i), 100)).await.unwrap();
        }
        f.cache
            .store(doc("vital", 100).with_risk_level(RiskLevel::Critical))
            .await
            .unwrap();

        // 900 bytes > 850: a quarter of the eight eligible go
        let stats = f.cache.stats().await;
        assert_eq!(stats.tier1_evictions, 2);
        assert_eq!(stats.demotions, 2);
        assert_eq!(f.cache.banks().locate("doc-0").as_deref(), Some(PATTERN_BANK));
        assert!(f.cache.tier1().find("vital").is_some());
        assert_eq!(f.cache.tier1().size(), 700);
    }

    #[tokio::test]
    async fn test_remove_clears_everywhere() {
        let f = fixture();
        f.cache
            .store(doc("d1", 100).with_risk_level(RiskLevel::Low))
            .await
            .unwrap();
        assert!(f.cache.banks().locate("d1").is_some());

        assert!(f.cache.remove("d1").await);
        assert!(f.cache.tier1().find("d1").is_none());
        assert!(f.cache.banks().locate("d1").is_none());
        assert!(f.cache.tier2().get("d1").await.is_none());
        assert!(f.cache.get("d1").await.is_none());
        assert!(!f.cache.remove("d1").await);
    }

    #[tokio::test]
    async fn test_total_miss_counts_each_tier_once() {
        let f = fixture();
        assert!(f.cache.get("missing").await.is_none());

        let stats = f.cache.stats().await;
        assert_eq!(stats.tier1.misses, 1);
        assert_eq!(stats.tier2.misses, 1);
        assert_eq!(stats.bank_misses, 1);
        assert_eq!(stats.tier1.hits + stats.tier2.hits, 0);
    }

    #[tokio::test]
    async fn test_degrades_without_tier2() {
        let f = fixture();
        f.backend.set_offline(true);

        f.cache.store(doc("d1", 10)).await.unwrap();
        let entry = f.cache.tier1().find("d1").unwrap();
        assert_eq!(entry.sync_status, SyncStatus::Dirty);
        assert!(f.cache.get("d1").await.is_some());
        assert!(f.cache.get("missing").await.is_none());

        let stats = f.cache.stats().await;
        assert!(stats.tier2_failures >= 3);
        assert_eq!(stats.tier1.hits, 1);
    }

    #[tokio::test]
    async fn test_malformed_sync_message_counted() {
        let f = fixture();
        f.cache.initialize().await.unwrap();

        f.backend
            .publish("doctier:document:contract", "{not json")
            .await
            .unwrap();
        f.backend
            .publish(
                "doctier:document:contract",
                r#"{"id":"d9","document_type":"contract","operation":"create"}"#,
            )
            .await
            .unwrap();

        let metrics = f.cache.metrics();
        eventually(|| metrics.sync_conflicts() == 2).await;
        assert!(f.cache.tier1().find("d9").is_none());
        f.cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_event_for_undeclared_type_is_conflict() {
        let f = fixture();
        f.cache.initialize().await.unwrap();

        let foreign = CacheEntry::new("i1", "invoice", vec![1u8; 4]);
        let event = ChangeEvent::upsert(ChangeOperation::Create, foreign, Uuid::new_v4());
        f.backend
            .publish(
                "doctier:document:invoice",
                &serde_json::to_string(&event).unwrap(),
            )
            .await
            .unwrap();

        let metrics = f.cache.metrics();
        eventually(|| metrics.sync_conflicts() == 1).await;
        f.cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_own_events_are_ignored() {
        let f = fixture();
        f.cache.initialize().await.unwrap();
        f.cache.store(doc("d1", 10)).await.unwrap();
        f.cache.get("d1").await;

        // Give the worker time to see the echo
        tokio::time::sleep(Duration::from_millis(50)).await;
        let entry = f.cache.tier1().find("d1").unwrap();
        assert_eq!(entry.access_count, 1);
        assert_eq!(f.cache.metrics().sync_conflicts(), 0);
        f.cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let f = fixture();
        f.cache.initialize().await.unwrap();
        f.cache.initialize().await.unwrap();
        assert!(f.cache.is_initialized().await);
        assert_eq!(f.cache.lifecycle.lock().await.tasks.len(), 2);

        f.cache.destroy().await.unwrap();
        f.cache.destroy().await.unwrap();
        assert_matches!(f.cache.initialize().await, Err(Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_flush_on_destroy() {
        let mut config = CacheConfig::with_partitions(["contract"]);
        config.flush_on_destroy = true;
        let f = fixture_with(config);

        f.cache.store(doc("d1", 10)).await.unwrap();
        f.cache.store(doc("d2", 10)).await.unwrap();
        f.cache.destroy().await.unwrap();

        let data = f.bulk.get(FLUSH_NAMESPACE, "d1").await.unwrap().unwrap();
        assert_eq!(Envelope::decode(&data).unwrap().entry.id, "d1");
        assert!(f.bulk.exists(FLUSH_NAMESPACE, "d2").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_wipes_tiers_and_stats() {
        let f = fixture();
        f.cache.store(doc("d1", 10)).await.unwrap();
        f.cache
            .store(doc("big", 5 * 1024 * 1024))
            .await
            .unwrap();
        f.cache.get("d1").await;

        f.cache.clear().await;
        assert!(f.cache.tier1().is_empty());
        assert_eq!(f.cache.banks().allocation_count(), 0);
        assert!(!f.bulk.exists(PERSISTENT_BANK, "big").await.unwrap());
        assert!(f.backend.is_empty());

        let stats = f.cache.stats().await;
        assert_eq!(stats.tier1.hits, 0);
        assert_eq!(stats.total_documents, 0);
    }

    #[tokio::test]
    async fn test_query_delegates_to_tier1() {
        let f = fixture();
        f.cache
            .store(doc("lease", 10).with_metadata("title", "Office Lease"))
            .await
            .unwrap();
        f.cache
            .store(doc("nda", 10).with_metadata("title", "NDA"))
            .await
            .unwrap();

        let hits = f
            .cache
            .query("contract", &EntryFilter::new().text("lease"))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "lease");

        let all = f.cache.find_by_type("contract", |_| true).unwrap();
        assert_eq!(all.len(), 2);
        assert_matches!(
            f.cache.query("invoice", &EntryFilter::new()),
            Err(Error::PartitionNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_search_cache_round_trip() {
        let f = fixture();
        let filters = serde_json::json!({"type": "contract"});
        let options = serde_json::json!({"limit": 5});
        let results = SearchResults {
            query: "termination".into(),
            items: vec![serde_json::json!({"id": "d1", "score": 0.9})],
            total: 1,
        };

        assert!(f.cache.cache_search("termination", &filters, &options, &results).await);
        assert_eq!(
            f.cache.cached_search("termination", &filters, &options).await,
            Some(results)
        );
        assert!(f
            .cache
            .cached_search("termination", &filters, &serde_json::json!({}))
            .await
            .is_none());

        assert_eq!(f.cache.invalidate_search(Some("contract")).await, 1);
        assert!(f
            .cache
            .cached_search("termination", &filters, &options)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_export_prometheus() {
        let f = fixture();
        f.cache.store(doc("d1", 10)).await.unwrap();
        f.cache.get("d1").await;

        let text = f.cache.export_prometheus().await.unwrap();
        assert!(text.contains("doctier_tier_entries{tier=\"tier1\"} 1"));
        assert!(text.contains("doctier_bank_capacity_bytes{bank=\"fast\"} 1048576"));
    }

    #[tokio::test]
    async fn test_write_during_demotion_is_not_overwritten() {
        let mut config = CacheConfig::with_partitions(["contract"]);
        config.tier1.capacity = 1000;
        config
            .overflow
            .routes
            .insert("contract".into(), PERSISTENT_BANK.into());
        let backend = Arc::new(InMemoryBackend::new());
        let bulk = Arc::new(SlowBulkStore {
            inner: InMemoryBulkStore::new(),
            delay: Duration::from_millis(300),
        });
        let cache = Arc::new(
            CacheCoordinator::with_clock(
                config,
                backend,
                bulk,
                Arc::new(ManualClock::new(START)),
            )
            .unwrap(),
        );

        for i in 0..8 {
            cache
                .store(CacheEntry::new(format!("doc-{}", i), "contract", vec![1u8; 100]))
                .await
                .unwrap();
        }

        // doc-8 pushes tier 1 over the watermark; victims go to the slow bank
        let evicting = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.store(doc("doc-8", 100)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.tier1().find("doc-0").is_none());

        cache
            .store(CacheEntry::new("doc-0", "contract", vec![9u8; 100]))
            .await
            .unwrap();
        assert!(cache.remove("doc-1").await);
        evicting.await.unwrap().unwrap();

        assert_eq!(cache.tier1().find("doc-0").unwrap().payload.data[0], 9);
        assert!(cache.banks().locate("doc-0").is_none());
        assert!(cache.banks().locate("doc-1").is_none());
        assert!(cache.banks().locate("doc-2").is_some());

        // With tier 1 and tier 2 gone only a current copy may answer
        cache.tier1().remove("doc-0");
        cache.tier2().delete("doc-0").await;
        if let Some(found) = cache.get("doc-0").await {
            assert_eq!(found.payload.data[0], 9);
        }
        assert!(cache.get("doc-1").await.is_none());
    }

    #[tokio::test]
    async fn test_non_utf8_sync_payload_counted() {
        let f = fixture();
        let message = ChannelMessage::from_bytes("doctier:document:contract", &[0xff, 0xfe, b'{']);
        f.cache.core.apply_message(message).await;

        let invalidation = ChannelMessage::from_bytes("doctier:search:invalidate", &[0xc3, 0x28]);
        f.cache.core.apply_message(invalidation).await;

        assert_eq!(f.cache.metrics().sync_conflicts(), 2);
    }

    #[tokio::test]
    async fn test_peer_invalidation_clears_search_cache() {
        let f = fixture();
        f.cache.initialize().await.unwrap();
        let channel = f.cache.tier2().invalidate_channel();
        let filters = serde_json::json!({"type": "contract"});
        let options = serde_json::json!({});
        let results = SearchResults {
            query: "assignment".into(),
            items: vec![serde_json::json!({"id": "d1"})],
            total: 1,
        };
        assert!(f.cache.cache_search("assignment", &filters, &options, &results).await);

        // Echo of our own invalidation is skipped; the malformed one marks progress
        let own = SearchInvalidation {
            criteria: None,
            origin: Some(f.cache.instance_id()),
        };
        f.backend
            .publish(&channel, &serde_json::to_string(&own).unwrap())
            .await
            .unwrap();
        f.backend.publish(&channel, "{not json").await.unwrap();
        let metrics = f.cache.metrics();
        eventually(|| metrics.sync_conflicts() == 1).await;
        assert_eq!(
            f.cache.cached_search("assignment", &filters, &options).await,
            Some(results)
        );

        let peer = SearchInvalidation {
            criteria: Some("contract".into()),
            origin: Some(Uuid::new_v4()),
        };
        f.backend
            .publish(&channel, &serde_json::to_string(&peer).unwrap())
            .await
            .unwrap();
        let backend = f.backend.clone();
        eventually(|| backend.is_empty()).await;
        assert!(f
            .cache
            .cached_search("assignment", &filters, &options)
            .await
            .is_none());
        f.cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_artifact_ttl_class_applies_to_tier2() {
        let f = fixture_with(CacheConfig::with_partitions(["contract", "analysis"]));
        f.cache.store(doc("d1", 10)).await.unwrap();
        f.cache
            .store_with_class(
                CacheEntry::new("a1", "analysis", vec![1u8; 10]),
                TtlClass::Analysis,
            )
            .await
            .unwrap();
        assert_eq!(
            f.cache.tier1().find("a1").unwrap().sync_status,
            SyncStatus::Synced
        );

        f.clock.advance(Duration::from_secs(3601));
        assert!(f.cache.tier2().get("d1").await.is_none());
        assert!(f.cache.tier2().get("a1").await.is_some());

        f.clock.advance(Duration::from_secs(3600));
        assert!(f.cache.tier2().get("a1").await.is_none());
        assert!(f.cache.tier1().find("a1").is_some());
    }
}
