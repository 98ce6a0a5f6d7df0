//! The query-service collaborator and the transactional payloads sent to it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::QueryScanConsistency;
use crate::data_model::{AtrRef, CompositeId};
use crate::errors::KvError;

/// Query error codes with a transactional meaning.
pub mod codes {
    pub const FEATURE_NOT_AVAILABLE: u32 = 1065;
    pub const TIMEOUT: u32 = 1080;
    pub const ATTEMPT_NOT_FOUND: u32 = 17004;
    pub const ATTEMPT_EXPIRED: u32 = 17010;
    pub const DOCUMENT_EXISTS: u32 = 17012;
    pub const DOCUMENT_NOT_FOUND: u32 = 17014;
    pub const CAS_MISMATCH: u32 = 17015;

    /// Range reserved for transaction-specific errors.
    pub const TRANSACTION_RANGE: std::ops::Range<u32> = 17000..18000;
}

/// Per-statement options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub positional_parameters: Vec<Value>,
    pub named_parameters: Map<String, Value>,
    /// Passed through to the service untouched.
    pub raw: Map<String, Value>,
    pub scan_consistency: Option<QueryScanConsistency>,
    /// Node the statement must be routed to.
    pub target_node: Option<String>,
}

impl QueryOptions {
    pub fn parameter(mut self, value: impl Into<Value>) -> Self {
        self.positional_parameters.push(value.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named_parameters.insert(name.into(), value.into());
        self
    }

    pub fn raw(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.raw.insert(name.into(), value.into());
        self
    }

    pub fn scan_consistency(mut self, consistency: QueryScanConsistency) -> Self {
        self.scan_consistency = Some(consistency);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub statement: String,
    /// `bucket.scope` the statement is scoped to.
    pub query_context: Option<String>,
    pub options: QueryOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    #[default]
    Success,
    Running,
    Completed,
    Errors,
    Stopped,
    Timeout,
    Closed,
    Fatal,
    Aborted,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub status: QueryStatus,
    /// Node that served the request.
    pub dispatched_to: Option<String>,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn query(&self, request: QueryRequest) -> Result<QueryResult, KvError>;
}

/// The structured cause attached by the service to transactional errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryErrorCause {
    #[serde(default)]
    pub cause: Option<Value>,
    #[serde(default)]
    pub raise: Option<String>,
    #[serde(default)]
    pub retry: Option<bool>,
    #[serde(default)]
    pub rollback: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryErrorEntry {
    pub code: u32,
    #[serde(rename = "msg", default)]
    pub message: String,
    #[serde(default)]
    pub cause: Option<QueryErrorCause>,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("query failed with {} error(s), first code {:?}", .errors.len(), .errors.first().map(|e| e.code))]
pub struct QueryError {
    pub errors: Vec<QueryErrorEntry>,
}

impl QueryError {
    pub fn single(code: u32, message: impl Into<String>) -> Self {
        Self {
            errors: vec![QueryErrorEntry {
                code,
                message: message.into(),
                cause: None,
            }],
        }
    }

    /// The entry that best describes the failure: one carrying a transactional
    /// cause, then one in the transaction code range, then the first.
    pub fn choose(&self) -> Option<&QueryErrorEntry> {
        self.errors
            .iter()
            .find(|e| e.cause.is_some())
            .or_else(|| {
                self.errors
                    .iter()
                    .find(|e| codes::TRANSACTION_RANGE.contains(&e.code))
            })
            .or_else(|| self.errors.first())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDataState {
    pub time_left_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDataConfig {
    pub kv_timeout_ms: u64,
    pub num_atrs: u16,
    pub durability_level: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxDataMutation {
    pub scp: String,
    pub coll: String,
    pub bkt: String,
    pub id: String,
    pub cas: String,
    #[serde(rename = "type")]
    pub op_type: &'static str,
}

/// The `txdata` blob handed to `BEGIN WORK` so the query service can take
/// over an attempt that may already have staged mutations over KV.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxData {
    pub id: CompositeId,
    pub state: TxDataState,
    pub config: TxDataConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_ref: Option<AtrRef>,
    pub mutations: Vec<TxDataMutation>,
}
