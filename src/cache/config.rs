//! Cache Configuration
//!
//! Everything the coordinator needs at construction, loadable from YAML.
//! Durations are written as whole seconds, except the tier 2 operation
//! timeout which is in milliseconds.
//!
//! ```yaml
//! tier1:
//!   capacity: 52428800
//!   partitions: [contract, memo]
//! distributed:
//!   key_prefix: legal
//!   operation_timeout_ms: 250
//! banks:
//!   fallback: persistent
//! promotion:
//!   bank_promotion_threshold: 3
//! flush_on_destroy: true
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::bank::BankSpec;
use super::distributed::TtlClass;
use super::policy::{OverflowPolicy, PromotionPolicy};
use super::tier_store::Tier1Config;
use super::{DEFAULT_KEY_PREFIX, PERSISTENT_BANK};
use crate::error::{Error, Result};

/// Serialize a `Duration` as whole seconds
pub(crate) mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serialize a `Duration` as whole milliseconds
pub(crate) mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Tier 2 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Prefix for every key and channel
    pub key_prefix: String,
    #[serde(with = "serde_secs")]
    pub document_ttl: Duration,
    #[serde(with = "serde_secs")]
    pub search_ttl: Duration,
    #[serde(with = "serde_secs")]
    pub analysis_ttl: Duration,
    #[serde(with = "serde_secs")]
    pub embedding_ttl: Duration,
    /// Deadline for every tier 2 call
    #[serde(rename = "operation_timeout_ms", with = "serde_millis")]
    pub operation_timeout: Duration,
    /// Bound of the pub/sub queue feeding the sync worker
    pub channel_capacity: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            document_ttl: TtlClass::Document.default_ttl(),
            search_ttl: TtlClass::Search.default_ttl(),
            analysis_ttl: TtlClass::Analysis.default_ttl(),
            embedding_ttl: TtlClass::Embedding.default_ttl(),
            operation_timeout: Duration::from_secs(2),
            channel_capacity: 1024,
        }
    }
}

impl DistributedConfig {
    /// Configured TTL for a class of value
    pub fn ttl(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Document => self.document_ttl,
            TtlClass::Search => self.search_ttl,
            TtlClass::Analysis => self.analysis_ttl,
            TtlClass::Embedding => self.embedding_ttl,
        }
    }
}

/// Bank layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BankConfig {
    pub banks: Vec<BankSpec>,
    /// Unbounded bank of last resort
    pub fallback: String,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            banks: BankSpec::defaults(),
            fallback: PERSISTENT_BANK.to_string(),
        }
    }
}

/// Complete cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub tier1: Tier1Config,
    pub distributed: DistributedConfig,
    pub banks: BankConfig,
    pub overflow: OverflowPolicy,
    pub promotion: PromotionPolicy,
    /// Period of the background statistics refresh
    #[serde(with = "serde_secs")]
    pub stats_interval: Duration,
    /// Write tier 1 into the bulk store on destroy
    pub flush_on_destroy: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tier1: Tier1Config::default(),
            distributed: DistributedConfig::default(),
            banks: BankConfig::default(),
            overflow: OverflowPolicy::default(),
            promotion: PromotionPolicy::default(),
            stats_interval: Duration::from_secs(10),
            flush_on_destroy: false,
        }
    }
}

impl CacheConfig {
    /// Default configuration with the given partitions
    pub fn with_partitions<I, S>(partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::default();
        config.tier1.partitions = partitions.into_iter().map(Into::into).collect();
        config
    }

    /// Parse from YAML and validate
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file and validate
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let tier1 = &self.tier1;
        if tier1.capacity == 0 {
            return Err(Error::Config("tier1.capacity must be > 0".into()));
        }
        if tier1.partitions.is_empty() {
            return Err(Error::Config("tier1.partitions must not be empty".into()));
        }
        let threshold = tier1.eviction.threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(
                "tier1.eviction.threshold must be in (0, 1]".into(),
            ));
        }
        let batch = tier1.eviction.batch_fraction;
        if !(batch > 0.0 && batch <= 1.0) {
            return Err(Error::Config(
                "tier1.eviction.batch_fraction must be in (0, 1]".into(),
            ));
        }

        if self.distributed.operation_timeout.is_zero() {
            return Err(Error::Config(
                "distributed.operation_timeout_ms must be > 0".into(),
            ));
        }
        if self.distributed.channel_capacity == 0 {
            return Err(Error::Config(
                "distributed.channel_capacity must be > 0".into(),
            ));
        }

        let mut names = HashSet::new();
        for spec in &self.banks.banks {
            if !names.insert(spec.name.as_str()) {
                return Err(Error::Config(format!("duplicate bank: {}", spec.name)));
            }
            if spec.capacity_bytes == Some(0) {
                return Err(Error::Config(format!(
                    "bank {} must have a capacity > 0",
                    spec.name
                )));
            }
        }
        match self.banks.banks.iter().find(|b| b.name == self.banks.fallback) {
            None => {
                return Err(Error::Config(format!(
                    "fallback bank {} is not declared",
                    self.banks.fallback
                )))
            }
            Some(spec) if spec.capacity_bytes.is_some() => {
                return Err(Error::Config(format!(
                    "fallback bank {} must be unbounded",
                    spec.name
                )))
            }
            Some(_) => {}
        }
        for (document_type, bank) in &self.overflow.routes {
            if !names.contains(bank.as_str()) {
                return Err(Error::Config(format!(
                    "route for {} targets unknown bank {}",
                    document_type, bank
                )));
            }
        }

        if self.stats_interval.is_zero() {
            return Err(Error::Config("stats_interval must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tier1.eviction.threshold, 0.85);
        assert_eq!(config.distributed.document_ttl, Duration::from_secs(3600));
        assert_eq!(config.distributed.search_ttl, Duration::from_secs(1800));
        assert_eq!(config.stats_interval, Duration::from_secs(10));
        assert_eq!(config.banks.banks.len(), 4);
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
tier1:
  capacity: 1000
  partitions: [contract, memo]
distributed:
  key_prefix: legal
  operation_timeout_ms: 250
  search_ttl: 60
overflow:
  size_threshold: 1000
promotion:
  bank_promotion_threshold: 5
flush_on_destroy: true
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.tier1.capacity, 1000);
        assert_eq!(config.tier1.partitions, vec!["contract", "memo"]);
        assert_eq!(config.distributed.key_prefix, "legal");
        assert_eq!(config.distributed.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.distributed.ttl(TtlClass::Search), Duration::from_secs(60));
        // Untouched fields keep defaults
        assert_eq!(config.distributed.ttl(TtlClass::Embedding), Duration::from_secs(86400));
        assert_eq!(config.overflow.size_threshold, 1000);
        assert_eq!(config.promotion.bank_promotion_threshold, 5);
        assert!(config.flush_on_destroy);
    }

    #[test]
    fn test_yaml_round_trip_uses_seconds() {
        let yaml = serde_yaml::to_string(&CacheConfig::default()).unwrap();
        assert!(yaml.contains("document_ttl: 3600"));
        assert!(yaml.contains("operation_timeout_ms: 2000"));
        assert!(yaml.contains("stats_interval: 10"));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let mut config = CacheConfig::default();
        config.tier1.eviction.threshold = 1.5;
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_rejects_bounded_fallback() {
        let mut config = CacheConfig::default();
        config.banks.fallback = "fast".into();
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("unbounded"));
    }

    #[test]
    fn test_rejects_unknown_route() {
        let mut config = CacheConfig::default();
        config
            .overflow
            .routes
            .insert("contract".into(), "archive".into());
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        assert_matches!(
            CacheConfig::from_yaml_str("tier1: [not, a, map]"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            CacheConfig::from_yaml_file("/nonexistent/doctier.yaml"),
            Err(Error::Io(_))
        );
    }
}
