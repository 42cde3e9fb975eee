//! Distributed Tier (Tier 2)
//!
//! Wraps a [`DistributedBackend`] with key prefixing, envelopes, TTL classes
//! and change-event channels. Every call carries a deadline; failures are
//! logged at warn, counted, and turned into misses so tier 1 stays the
//! source of truth.
//!
//! # Layout
//!
//! ```text
//! <prefix>:doc:<id>              document envelope
//! <prefix>:search:<sha256>       cached search results
//! <prefix>:document:<type>       change events (pattern-subscribed)
//! <prefix>:search:invalidate     search invalidation
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::{ChannelMessage, DistributedBackend};
use super::config::DistributedConfig;
use super::entry::CacheEntry;
use super::metrics::MetricsCollector;
use crate::error::{Error, Result};

/// TTL class of a tier 2 value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlClass {
    Document,
    Search,
    Analysis,
    Embedding,
}

impl TtlClass {
    /// Built-in TTL before configuration overrides
    pub const fn default_ttl(self) -> Duration {
        match self {
            TtlClass::Document => Duration::from_secs(3600),
            TtlClass::Search => Duration::from_secs(1800),
            TtlClass::Analysis => Duration::from_secs(7200),
            TtlClass::Embedding => Duration::from_secs(86400),
        }
    }
}

/// Serialized tier 2 value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub entry: CacheEntry,
    /// Payload as JSON when the bytes are a JSON document, for non-Rust readers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<serde_json::Value>,
}

impl Envelope {
    pub fn wrap(entry: CacheEntry) -> Self {
        let raw_payload = serde_json::from_slice(&entry.payload.data).ok();
        Self { entry, raw_payload }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Kind of change carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// Cross-instance change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    pub document_type: String,
    pub operation: ChangeOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<CacheEntry>,
    /// Publishing coordinator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
}

impl ChangeEvent {
    pub fn upsert(operation: ChangeOperation, entry: CacheEntry, origin: Uuid) -> Self {
        Self {
            id: entry.id.clone(),
            document_type: entry.document_type.clone(),
            operation,
            entry: Some(entry),
            origin: Some(origin),
        }
    }

    pub fn delete(id: impl Into<String>, document_type: impl Into<String>, origin: Uuid) -> Self {
        Self {
            id: id.into(),
            document_type: document_type.into(),
            operation: ChangeOperation::Delete,
            entry: None,
            origin: Some(origin),
        }
    }

    /// Parse and check a received event
    pub fn parse(payload: &str) -> Result<Self> {
        let event: ChangeEvent = serde_json::from_str(payload)
            .map_err(|e| Error::SyncConflict(format!("undecodable change event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.document_type.is_empty() {
            return Err(Error::SyncConflict("change event without id or type".into()));
        }
        match (&self.operation, &self.entry) {
            (ChangeOperation::Delete, _) => Ok(()),
            (_, None) => Err(Error::SyncConflict(format!(
                "{:?} event for {} carries no entry",
                self.operation, self.id
            ))),
            (_, Some(entry)) if entry.id != self.id || entry.document_type != self.document_type => {
                Err(Error::SyncConflict(format!(
                    "event for {} carries entry {}",
                    self.id, entry.id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Search invalidation broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchInvalidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
}

/// Stable hash of `(query, filters, options)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchKey(String);

impl SearchKey {
    /// JSON objects hash the same regardless of key order
    pub fn new(query: &str, filters: &serde_json::Value, options: &serde_json::Value) -> Self {
        let canonical = serde_json::json!([query, filters, options]).to_string();
        Self(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cached search response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub query: String,
    pub items: Vec<serde_json::Value>,
    pub total: u64,
}

/// Tier 2 wrapper
pub struct DistributedTier {
    backend: Arc<dyn DistributedBackend>,
    config: DistributedConfig,
    metrics: Arc<MetricsCollector>,
}

impl DistributedTier {
    pub fn new(
        backend: Arc<dyn DistributedBackend>,
        config: DistributedConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            backend,
            config,
            metrics,
        }
    }

    pub fn doc_key(&self, id: &str) -> String {
        format!("{}:doc:{}", self.config.key_prefix, id)
    }

    pub fn doc_prefix(&self) -> String {
        format!("{}:doc:", self.config.key_prefix)
    }

    pub fn search_key(&self, key: &SearchKey) -> String {
        format!("{}:search:{}", self.config.key_prefix, key.as_str())
    }

    pub fn search_prefix(&self) -> String {
        format!("{}:search:", self.config.key_prefix)
    }

    pub fn document_channel(&self, document_type: &str) -> String {
        format!("{}:document:{}", self.config.key_prefix, document_type)
    }

    pub fn invalidate_channel(&self) -> String {
        format!("{}:search:invalidate", self.config.key_prefix)
    }

    /// Whether a received channel is a document change channel
    pub fn is_document_channel(&self, channel: &str) -> bool {
        channel
            .strip_prefix(self.config.key_prefix.as_str())
            .is_some_and(|rest| rest.starts_with(":document:"))
    }

    pub fn ttl(&self, class: TtlClass) -> Duration {
        self.config.ttl(class)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run a backend call under the configured deadline
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.operation_timeout;
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { operation, timeout }),
        };
        if let Err(e) = &result {
            self.metrics.record_tier2_failure();
            warn!(
                operation,
                backend = self.backend.name(),
                error = %e,
                "Tier 2 call failed, continuing without it"
            );
        }
        result
    }

    /// Fetch a document; failures and undecodable values are misses
    pub async fn get(&self, id: &str) -> Option<CacheEntry> {
        let key = self.doc_key(id);
        let data = self.call("get", self.backend.get(&key)).await.ok()??;
        match Envelope::decode(&data) {
            Ok(envelope) => Some(envelope.entry),
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable tier 2 envelope");
                None
            }
        }
    }

    /// Store a document with an explicit TTL
    pub async fn set(&self, entry: &CacheEntry, ttl: Duration) -> bool {
        let data = match Envelope::wrap(entry.clone()).encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(id = %entry.id, error = %e, "Failed to encode envelope");
                return false;
            }
        };
        let key = self.doc_key(&entry.id);
        self.call("set", self.backend.set_ex(&key, data, ttl))
            .await
            .is_ok()
    }

    /// Store a document with the TTL of its class
    pub async fn set_with_class(&self, entry: &CacheEntry, class: TtlClass) -> bool {
        self.set(entry, self.ttl(class)).await
    }

    /// Store a document with the document TTL
    pub async fn set_document(&self, entry: &CacheEntry) -> bool {
        self.set_with_class(entry, TtlClass::Document).await
    }

    /// Delete a document
    pub async fn delete(&self, id: &str) -> bool {
        let keys = [self.doc_key(id)];
        self.call("delete", self.backend.delete(&keys))
            .await
            .is_ok_and(|n| n > 0)
    }

    /// Publish a change event on its document type channel
    pub async fn publish(&self, event: &ChangeEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %event.id, error = %e, "Failed to encode change event");
                return false;
            }
        };
        let channel = self.document_channel(&event.document_type);
        let published = self
            .call("publish", self.backend.publish(&channel, &payload))
            .await
            .is_ok();
        if published {
            debug!(channel = %channel, id = %event.id, operation = ?event.operation, "Published change");
        }
        published
    }

    /// Subscribe to every document channel plus search invalidation
    pub async fn subscribe(&self) -> Option<mpsc::Receiver<ChannelMessage>> {
        let patterns = vec![
            format!("{}:document:*", self.config.key_prefix),
            self.invalidate_channel(),
        ];
        self.call(
            "subscribe",
            self.backend
                .subscribe(&patterns, self.config.channel_capacity),
        )
        .await
        .ok()
    }

    /// Cache search results under their stable hash
    pub async fn cache_search(&self, key: &SearchKey, results: &SearchResults) -> bool {
        let data = match serde_json::to_vec(results) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!(error = %e, "Failed to encode search results");
                return false;
            }
        };
        let redis_key = self.search_key(key);
        self.call(
            "cache_search",
            self.backend
                .set_ex(&redis_key, data, self.ttl(TtlClass::Search)),
        )
        .await
        .is_ok()
    }

    /// Cached search results, if any
    pub async fn cached_search(&self, key: &SearchKey) -> Option<SearchResults> {
        let redis_key = self.search_key(key);
        let data = self
            .call("cached_search", self.backend.get(&redis_key))
            .await
            .ok()??;
        serde_json::from_slice(&data)
            .map_err(|e| warn!(key = %redis_key, error = %e, "Undecodable search results"))
            .ok()
    }

    async fn clear_prefix(&self, prefix: &str) -> u64 {
        let Ok(keys) = self
            .call("scan", self.backend.keys_with_prefix(prefix))
            .await
        else {
            return 0;
        };
        if keys.is_empty() {
            return 0;
        }
        self.call("clear", self.backend.delete(&keys))
            .await
            .unwrap_or(0)
    }

    /// Delete every key under the search prefix
    pub async fn clear_search(&self) -> u64 {
        self.clear_prefix(&self.search_prefix()).await
    }

    /// Delete every document key
    pub async fn clear_documents(&self) -> u64 {
        self.clear_prefix(&self.doc_prefix()).await
    }

    /// Broadcast a search invalidation
    pub async fn publish_invalidation(&self, invalidation: &SearchInvalidation) -> bool {
        let payload = match serde_json::to_string(invalidation) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode invalidation");
                return false;
            }
        };
        let channel = self.invalidate_channel();
        self.call("publish", self.backend.publish(&channel, &payload))
            .await
            .is_ok()
    }

    /// Number of document keys, for statistics
    pub async fn document_count(&self) -> Option<u64> {
        let prefix = self.doc_prefix();
        self.call("scan_documents", self.backend.keys_with_prefix(&prefix))
            .await
            .ok()
            .map(|keys| keys.len() as u64)
    }

    /// Release backend connections
    pub async fn close(&self) {
        let _ = self.call("close", self.backend.close()).await;
    }
}

// =============================================================================
// Tests
// =============================================================================
