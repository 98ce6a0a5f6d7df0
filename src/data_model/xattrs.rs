use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data_model::ids::{AtrRef, CompositeId};
use crate::errors::AttemptError;
use crate::forward_compat::ForwardCompatibility;

/// Staged body written for a pending remove.
pub const STAGED_REMOVE_SENTINEL: &str = "<<REMOVE>>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedOperationType {
    Insert,
    Replace,
    Remove,
}

impl StagedOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagedOperationType::Insert => "insert",
            StagedOperationType::Replace => "replace",
            StagedOperationType::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedOperation {
    #[serde(rename = "type")]
    pub op_type: StagedOperationType,
    /// Staged body, or [`STAGED_REMOVE_SENTINEL`] for removes.
    #[serde(rename = "stgd", default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
}

/// Pre-transaction metadata needed to undo staging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "CAS", default, skip_serializing_if = "Option::is_none")]
    pub cas: Option<String>,
    #[serde(rename = "revid", default, skip_serializing_if = "Option::is_none")]
    pub rev_id: Option<String>,
    #[serde(rename = "exptime", default, skip_serializing_if = "Option::is_none")]
    pub exp_time: Option<u64>,
    #[serde(rename = "value_crc32c", default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
}

/// Transaction metadata attached to a document while it is staged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionXattrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CompositeId>,
    #[serde(rename = "atr", default, skip_serializing_if = "Option::is_none")]
    pub atr_ref: Option<AtrRef>,
    #[serde(rename = "op", default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<StagedOperation>,
    #[serde(rename = "restore", default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<DocumentMetadata>,
    #[serde(rename = "fc", default, skip_serializing_if = "Option::is_none")]
    pub forward_compatibility: Option<ForwardCompatibility>,
}

impl TransactionXattrs {
    pub fn transaction_id(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.transaction_id.as_str())
    }

    pub fn attempt_id(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.attempt_id.as_str())
    }

    pub fn operation_type(&self) -> Option<StagedOperationType> {
        self.operation.as_ref().map(|op| op.op_type)
    }

    pub fn staged_content(&self) -> Option<&Value> {
        self.operation.as_ref().and_then(|op| op.staged.as_ref())
    }

    /// Enough metadata to locate the owning attempt's ATR entry.
    pub fn validate_minimum(&self) -> Result<(&CompositeId, &AtrRef), AttemptError> {
        match (&self.id, &self.atr_ref) {
            (Some(id), Some(atr)) => Ok((id, atr)),
            _ => Err(AttemptError::illegal_state(
                "transaction metadata lacks id or ATR reference",
            )),
        }
    }
}
