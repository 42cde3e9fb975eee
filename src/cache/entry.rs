//! Cache Entry Types
//!
//! Documents as they move between tier 1, tier 2 and the overflow banks.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Ordered risk classification of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Medium
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Store currently holding the authoritative copy of an entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Tier {
    /// In-process document store
    Tier1,
    /// Distributed cache
    Tier2,
    /// Overflow bank, by name
    Bank(String),
}

impl Tier {
    /// Bank name if the entry lives in a bank
    pub fn bank(&self) -> Option<&str> {
        match self {
            Tier::Bank(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Tier1 => write!(f, "tier1"),
            Tier::Tier2 => write!(f, "tier2"),
            Tier::Bank(name) => write!(f, "bank:{}", name),
        }
    }
}

impl From<Tier> for String {
    fn from(tier: Tier) -> Self {
        tier.to_string()
    }
}

impl TryFrom<String> for Tier {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "tier1" => Ok(Tier::Tier1),
            "tier2" => Ok(Tier::Tier2),
            other => match other.strip_prefix("bank:") {
                Some(name) if !name.is_empty() => Ok(Tier::Bank(name.to_string())),
                _ => Err(format!("unknown tier: {}", other)),
            },
        }
    }
}

/// Replication state relative to tier 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Tier 2 holds the same version
    Synced,
    /// Tier 2 write failed or was skipped
    Dirty,
    /// Tier 2 write not yet attempted
    Pending,
}

/// Opaque document body plus structured metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub data: Bytes,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A cached document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub document_type: String,
    pub payload: Payload,
    pub size_bytes: u64,
    /// Higher is more important
    pub priority: u8,
    pub risk_level: RiskLevel,
    /// Epoch milliseconds, 0 until first stored
    pub created_at: u64,
    /// Epoch milliseconds
    pub last_accessed_at: u64,
    pub access_count: u64,
    pub tier: Tier,
    pub sync_status: SyncStatus,
}

impl CacheEntry {
    /// Create an entry; size is taken from the payload bytes
    pub fn new(
        id: impl Into<String>,
        document_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            id: id.into(),
            document_type: document_type.into(),
            size_bytes: data.len() as u64,
            payload: Payload {
                data,
                metadata: BTreeMap::new(),
            },
            priority: 128,
            risk_level: RiskLevel::default(),
            created_at: 0,
            last_accessed_at: 0,
            access_count: 0,
            tier: Tier::Tier1,
            sync_status: SyncStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Override the accounted size (e.g. when bytes are stored elsewhere)
    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_created_at(mut self, millis: u64) -> Self {
        self.created_at = millis;
        self
    }

    pub fn with_access_count(mut self, count: u64) -> Self {
        self.access_count = count;
        self
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&mut self, now_millis: u64) -> u64 {
        self.last_accessed_at = now_millis;
        self.access_count += 1;
        self.access_count
    }

    /// Milliseconds since creation
    #[inline]
    pub fn age_millis(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.created_at)
    }

    /// Searchable text field: `id`, `document_type`, or a string metadata value
    pub fn text_field(&self, name: &str) -> Option<&str> {
        match name {
            "id" => Some(&self.id),
            "document_type" => Some(&self.document_type),
            _ => self.payload.metadata.get(name).and_then(|v| v.as_str()),
        }
    }

    /// Case-insensitive substring match over the given text fields
    pub fn contains_text<S: AsRef<str>>(&self, needle: &str, fields: &[S]) -> bool {
        let needle = needle.to_lowercase();
        fields.iter().any(|field| {
            self.text_field(field.as_ref())
                .map(|text| text.to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
    }
}

/// Bookkeeping for an entry held in a bank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: String,
    pub bank: String,
    pub size_bytes: u64,
    /// Epoch milliseconds
    pub last_accessed_at: u64,
    /// Pinned while greater than zero
    pub ref_count: u32,
}

impl AllocationRecord {
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.ref_count > 0
    }
}

// =============================================================================
// Tests
// =============================================================================
