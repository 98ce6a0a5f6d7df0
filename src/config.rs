use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data_model::Keyspace;

/// Durability required of every write made by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DurabilityLevel {
    None,
    #[default]
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl DurabilityLevel {
    /// Wire name used by the query service.
    pub fn as_query_param(&self) -> &'static str {
        match self {
            DurabilityLevel::None => "none",
            DurabilityLevel::Majority => "majority",
            DurabilityLevel::MajorityAndPersistToActive => "majorityAndPersistToActive",
            DurabilityLevel::PersistToMajority => "persistToMajority",
        }
    }

    /// Short code stored in ATR entries.
    pub fn as_atr_code(&self) -> &'static str {
        match self {
            DurabilityLevel::None => "n",
            DurabilityLevel::Majority => "m",
            DurabilityLevel::MajorityAndPersistToActive => "pa",
            DurabilityLevel::PersistToMajority => "pm",
        }
    }

    pub fn from_atr_code(code: &str) -> Option<Self> {
        match code {
            "n" => Some(DurabilityLevel::None),
            "m" => Some(DurabilityLevel::Majority),
            "pa" => Some(DurabilityLevel::MajorityAndPersistToActive),
            "pm" => Some(DurabilityLevel::PersistToMajority),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryScanConsistency {
    NotBounded,
    #[default]
    RequestPlus,
}

impl QueryScanConsistency {
    pub fn as_query_param(&self) -> &'static str {
        match self {
            QueryScanConsistency::NotBounded => "not_bounded",
            QueryScanConsistency::RequestPlus => "request_plus",
        }
    }
}

/// Configuration shared by every transaction run through [`crate::Transactions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Overall time budget of a transaction, across all of its attempts.
    pub expiration_time: Duration,
    pub key_value_timeout: Duration,
    pub durability_level: DurabilityLevel,
    /// Window over which lost-transaction cleaners sweep every ATR once.
    pub cleanup_window: Duration,
    pub cleanup_lost_attempts: bool,
    pub cleanup_client_attempts: bool,
    /// Collection holding ATRs; the document's bucket default collection otherwise.
    pub metadata_collection: Option<Keyspace>,
    pub scan_consistency: QueryScanConsistency,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            expiration_time: Duration::from_secs(15),
            key_value_timeout: Duration::from_secs(10),
            durability_level: DurabilityLevel::Majority,
            cleanup_window: Duration::from_secs(60),
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
            metadata_collection: None,
            scan_consistency: QueryScanConsistency::RequestPlus,
        }
    }
}

impl TransactionConfig {
    pub fn builder() -> TransactionConfigBuilder {
        TransactionConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionConfigBuilder {
    config: TransactionConfig,
}

impl TransactionConfigBuilder {
    pub fn expiration_time(mut self, expiration_time: Duration) -> Self {
        self.config.expiration_time = expiration_time;
        self
    }

    pub fn key_value_timeout(mut self, timeout: Duration) -> Self {
        self.config.key_value_timeout = timeout;
        self
    }

    pub fn durability_level(mut self, level: DurabilityLevel) -> Self {
        self.config.durability_level = level;
        self
    }

    pub fn cleanup_window(mut self, window: Duration) -> Self {
        self.config.cleanup_window = window;
        self
    }

    pub fn cleanup_lost_attempts(mut self, enabled: bool) -> Self {
        self.config.cleanup_lost_attempts = enabled;
        self
    }

    pub fn cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.config.cleanup_client_attempts = enabled;
        self
    }

    pub fn metadata_collection(mut self, keyspace: Keyspace) -> Self {
        self.config.metadata_collection = Some(keyspace);
        self
    }

    pub fn scan_consistency(mut self, consistency: QueryScanConsistency) -> Self {
        self.config.scan_consistency = consistency;
        self
    }

    pub fn build(self) -> TransactionConfig {
        self.config
    }
}

/// Overrides applied to a single transaction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerTransactionConfig {
    pub durability_level: Option<DurabilityLevel>,
    pub expiration_time: Option<Duration>,
    pub key_value_timeout: Option<Duration>,
}

impl PerTransactionConfig {
    /// Resolves the overrides against `base`.
    pub fn apply(&self, base: &TransactionConfig) -> TransactionConfig {
        let mut merged = base.clone();
        if let Some(level) = self.durability_level {
            merged.durability_level = level;
        }
        if let Some(expiration) = self.expiration_time {
            merged.expiration_time = expiration;
        }
        if let Some(timeout) = self.key_value_timeout {
            merged.key_value_timeout = timeout;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = TransactionConfig::default();
        assert_eq!(c.expiration_time, Duration::from_secs(15));
        assert_eq!(c.key_value_timeout, Duration::from_secs(10));
        assert_eq!(c.durability_level, DurabilityLevel::Majority);
        assert!(c.cleanup_lost_attempts);
    }

    #[test]
    fn test_per_transaction_overrides() {
        let base = TransactionConfig::builder()
            .durability_level(DurabilityLevel::None)
            .build();
        let per = PerTransactionConfig {
            expiration_time: Some(Duration::from_millis(250)),
            ..Default::default()
        };
        let merged = per.apply(&base);
        assert_eq!(merged.durability_level, DurabilityLevel::None);
        assert_eq!(merged.expiration_time, Duration::from_millis(250));
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let c: TransactionConfig =
            serde_json::from_str(r#"{"durability_level":"persistToMajority"}"#).unwrap();
        assert_eq!(c.durability_level, DurabilityLevel::PersistToMajority);
        assert_eq!(c.cleanup_window, Duration::from_secs(60));
    }
}
