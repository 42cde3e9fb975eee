//! Bulk Store - Durable Payload Storage
//!
//! Backing storage for the unbounded bank and for flushing tier 1 on
//! shutdown. Payloads are opaque bytes under `(namespace, key)`.
//!
//! # Design
//!
//! - Async I/O for non-blocking storage access
//! - Pluggable backend (in-memory for tests, local filesystem)

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Bulk storage backend trait
#[async_trait]
pub trait BulkStore: Send + Sync {
    /// Get an object
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>>;

    /// Put an object, replacing any previous value
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> Result<()>;

    /// Delete an object
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Check if an object exists
    async fn exists(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Get storage statistics
    fn stats(&self) -> BulkStoreStats;
}

/// Bulk store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkStoreStats {
    /// Total objects stored
    pub object_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    object_count: AtomicU64,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Counters {
    fn stored(&self, new_size: u64, old_size: Option<u64>) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        match old_size {
            Some(old) => {
                self.total_bytes.fetch_sub(old, Ordering::Relaxed);
            }
            None => {
                self.object_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total_bytes.fetch_add(new_size, Ordering::Relaxed);
    }

    fn removed(&self, size: u64) {
        self.object_count.fetch_sub(1, Ordering::Relaxed);
        self.total_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BulkStoreStats {
        BulkStoreStats {
            object_count: self.object_count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// In-memory bulk store
/// Uses DashMap for concurrent access instead of a single RwLock
#[derive(Debug, Default)]
pub struct InMemoryBulkStore {
    /// namespace -> key -> data
    storage: DashMap<String, DashMap<String, Bytes>>,
    counters: Counters,
}

impl InMemoryBulkStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BulkStore for InMemoryBulkStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(ns) = self.storage.get(namespace) {
            if let Some(data) = ns.get(key) {
                return Ok(Some(data.value().clone()));
            }
        }
        Ok(None)
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        let ns = self
            .storage
            .entry(namespace.to_string())
            .or_insert_with(DashMap::new);
        let old = ns.insert(key.to_string(), data);
        self.counters.stored(size, old.map(|d| d.len() as u64));
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        if let Some(ns) = self.storage.get(namespace) {
            if let Some((_, data)) = ns.remove(key) {
                self.counters.removed(data.len() as u64);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .storage
            .get(namespace)
            .map(|ns| ns.contains_key(key))
            .unwrap_or(false))
    }

    fn stats(&self) -> BulkStoreStats {
        self.counters.snapshot()
    }
}

/// Filesystem bulk store: one file per object under `<root>/<namespace>/`
///
/// File names are the SHA-256 of the key so arbitrary ids are safe on disk.
#[derive(Debug)]
pub struct FileBulkStore {
    root: PathBuf,
    counters: Counters,
}

impl FileBulkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counters: Counters::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join(namespace).join(name)
    }

    async fn existing_size(path: &Path) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }
}

#[async_trait]
impl BulkStore for FileBulkStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        match tokio::fs::read(self.path_for(namespace, key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(namespace, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let old = Self::existing_size(&path).await;

        // Write-then-rename so readers never see a torn file; concurrent
        // writers of one key each get their own temp file
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.counters.stored(data.len() as u64, old);
        debug!(namespace = %namespace, key = %key, bytes = data.len(), "Bulk write");
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(namespace, key);
        let Some(size) = Self::existing_size(&path).await else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                self.counters.removed(size);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(Self::existing_size(&self.path_for(namespace, key))
            .await
            .is_some())
    }

    fn stats(&self) -> BulkStoreStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
