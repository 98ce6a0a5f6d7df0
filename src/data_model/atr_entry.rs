use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::data_model::ids::{DocId, Keyspace};
use crate::errors::AttemptError;
use crate::forward_compat::ForwardCompatibility;

/// Lifecycle of an attempt as recorded in its ATR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    NothingWritten,
    Pending,
    Aborted,
    Committed,
    Completed,
    RolledBack,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::NothingWritten => "nothing_written",
            AttemptState::Pending => "pending",
            AttemptState::Aborted => "aborted",
            AttemptState::Committed => "committed",
            AttemptState::Completed => "completed",
            AttemptState::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::RolledBack)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = AttemptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nothing_written" => Ok(AttemptState::NothingWritten),
            "pending" => Ok(AttemptState::Pending),
            "aborted" => Ok(AttemptState::Aborted),
            "committed" => Ok(AttemptState::Committed),
            "completed" => Ok(AttemptState::Completed),
            "rolled_back" => Ok(AttemptState::RolledBack),
            other => Err(AttemptError::illegal_state(format!(
                "unknown attempt state '{other}'"
            ))),
        }
    }
}

/// A document identity as listed in an ATR entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRecord {
    #[serde(rename = "bkt")]
    pub bucket: String,
    #[serde(rename = "scp")]
    pub scope: String,
    #[serde(rename = "col")]
    pub collection: String,
    #[serde(rename = "id")]
    pub key: String,
}

impl DocRecord {
    pub fn doc_id(&self) -> DocId {
        DocId::new(
            Keyspace::new(&self.bucket, &self.scope, &self.collection),
            &self.key,
        )
    }
}

impl From<&DocId> for DocRecord {
    fn from(id: &DocId) -> Self {
        Self {
            bucket: id.keyspace.bucket.clone(),
            scope: id.keyspace.scope.clone(),
            collection: id.keyspace.collection.clone(),
            key: id.key.clone(),
        }
    }
}

/// One attempt's record inside an ATR document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrEntry {
    /// Key of this entry in the ATR's attempt map.
    #[serde(skip)]
    pub attempt_id: String,
    #[serde(rename = "tid")]
    pub transaction_id: String,
    /// Raw status string; unknown values come from newer protocols.
    #[serde(rename = "st")]
    pub state: String,
    #[serde(rename = "tst")]
    pub timestamp_start_ms: u64,
    #[serde(rename = "exp")]
    pub expires_after_ms: u64,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub pending_sentinel: Option<u32>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub durability_level: Option<String>,
    #[serde(rename = "ins", default)]
    pub inserted: Vec<DocRecord>,
    #[serde(rename = "rep", default)]
    pub replaced: Vec<DocRecord>,
    #[serde(rename = "rem", default)]
    pub removed: Vec<DocRecord>,
    #[serde(rename = "fc", default, skip_serializing_if = "Option::is_none")]
    pub forward_compatibility: Option<ForwardCompatibility>,
}

impl AtrEntry {
    pub fn attempt_state(&self) -> Result<AttemptState, AttemptError> {
        self.state.parse()
    }

    /// True once the entry's expiry budget has elapsed on the local clock.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms > self.timestamp_start_ms.saturating_add(self.expires_after_ms)
    }

    pub fn age_ms(&self) -> u64 {
        now_millis().saturating_sub(self.timestamp_start_ms)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
