//! Distributed Backend - Tier 2 Capability Trait
//!
//! Key/value storage with TTL plus publish/subscribe channels. One
//! implementation is chosen when the coordinator is built.
//!
//! [`InMemoryBackend`] plays the role of a shared server: several
//! coordinators holding the same `Arc<InMemoryBackend>` see each other's
//! keys and messages, which is how convergence is tested in-process.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

impl ChannelMessage {
    /// Build from a raw payload
    ///
    /// Invalid UTF-8 is replaced rather than dropped so the receiver still
    /// sees, rejects and counts the message.
    pub fn from_bytes(channel: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            channel: channel.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

/// Tier 2 backend trait
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Get a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Set a value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// All live keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Publish a message on a channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to glob patterns; messages arrive on a bounded queue
    async fn subscribe(
        &self,
        patterns: &[String],
        capacity: usize,
    ) -> Result<mpsc::Receiver<ChannelMessage>>;

    /// Release connections
    async fn close(&self) -> Result<()>;
}

/// Redis-style glob match supporting `*` and `?`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // Let the last star absorb one more character
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

struct StoredValue {
    data: Bytes,
    /// Epoch milliseconds
    expires_at: u64,
}

struct Subscriber {
    patterns: Vec<String>,
    tx: mpsc::Sender<ChannelMessage>,
}

impl Subscriber {
    fn wants(&self, channel: &str) -> bool {
        self.patterns.iter().any(|p| glob_match(p, channel))
    }
}

/// In-process backend with lazy TTL expiry
pub struct InMemoryBackend {
    values: DashMap<String, StoredValue>,
    subscribers: Mutex<Vec<Subscriber>>,
    clock: Arc<dyn Clock>,
    /// Simulated outage: every call fails while set
    offline: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with an injected clock for TTL expiry
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            clock,
            offline: AtomicBool::new(false),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Toggle the simulated outage
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::TierUnavailable("in-memory backend offline".into()));
        }
        Ok(())
    }

    /// Live key count
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.values.iter().filter(|v| v.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages delivered to at least one queue
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages dropped because a subscriber queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DistributedBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_online()?;
        let now = self.clock.now_millis();

        if let Some(value) = self.values.get(key) {
            if value.expires_at > now {
                return Ok(Some(value.data.clone()));
            }
        } else {
            return Ok(None);
        }

        // Expired: drop lazily
        self.values.remove_if(key, |_, v| v.expires_at <= now);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.ensure_online()?;
        let expires_at = self
            .clock
            .now_millis()
            .saturating_add(ttl.as_millis() as u64);
        self.values.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.ensure_online()?;
        let now = self.clock.now_millis();
        let mut deleted = 0;
        for key in keys {
            if let Some((_, value)) = self.values.remove(key) {
                if value.expires_at > now {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_online()?;
        let now = self.clock.now_millis();
        Ok(self
            .values
            .iter()
            .filter(|v| v.expires_at > now && v.key().starts_with(prefix))
            .map(|v| v.key().clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.ensure_online()?;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = false;
        for subscriber in subscribers.iter().filter(|s| s.wants(channel)) {
            let message = ChannelMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            match subscriber.tx.try_send(message) {
                Ok(()) => delivered = true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %channel, "Subscriber queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        if delivered {
            self.published.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        patterns: &[String],
        capacity: usize,
    ) -> Result<mpsc::Receiver<ChannelMessage>> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.lock().push(Subscriber {
            patterns: patterns.to_vec(),
            tx,
        });
        debug!(patterns = ?patterns, "Subscribed");
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        // Shared server: nothing to tear down per client
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
