//! Finishing attempts that did not finish themselves.
//!
//! Attempts of this client that end with work left over are handed to the
//! [`CleanupWorkQueue`]. Attempts of clients that crashed are found by the
//! [`LostTransactionManager`], which sweeps every ATR of every bucket. Both
//! drive the same [`Cleaner`].

mod cleaner;
mod lost;
mod queue;

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::DurabilityLevel;
use crate::data_model::{AtrEntry, AtrRef, AttemptState, DocRecord};
use crate::errors::AttemptError;
use crate::forward_compat::ForwardCompatibility;
use crate::repository::KvResult;

pub use cleaner::{Cleaner, CleanupOutcome};
pub use lost::{DISCOVER_BUCKETS_PERIOD, LostCleanupConfig, LostTransactionManager};
pub use queue::CleanupWorkQueue;

/// Everything needed to finish one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupRequest {
    pub attempt_id: String,
    pub atr_ref: AtrRef,
    pub inserted: Vec<DocRecord>,
    pub replaced: Vec<DocRecord>,
    pub removed: Vec<DocRecord>,
    /// Last state the attempt was known to be in.
    pub state: AttemptState,
    /// Not processed before this instant.
    pub when_ready: Instant,
    pub forward_compatibility: Option<ForwardCompatibility>,
    pub durability_level: DurabilityLevel,
}

impl CleanupRequest {
    /// Rebuilds a request from an entry found while sweeping an ATR.
    pub fn from_atr_entry(atr_ref: &AtrRef, entry: &AtrEntry) -> Result<Self, AttemptError> {
        Ok(Self {
            attempt_id: entry.attempt_id.clone(),
            atr_ref: atr_ref.clone(),
            inserted: entry.inserted.clone(),
            replaced: entry.replaced.clone(),
            removed: entry.removed.clone(),
            state: entry.attempt_state()?,
            when_ready: Instant::now(),
            forward_compatibility: entry.forward_compatibility.clone(),
            durability_level: entry
                .durability_level
                .as_deref()
                .and_then(DurabilityLevel::from_atr_code)
                .unwrap_or_default(),
        })
    }
}

/// Lists the buckets lost-transaction cleanup should cover.
#[async_trait]
pub trait ClusterTopology: Send + Sync {
    async fn bucket_names(&self) -> KvResult<Vec<String>>;
}

/// This client's view of the clients cleaning a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecordDetails {
    pub client_uuid: String,
    /// Position of this client among the active ones, in `0..num_active_clients`.
    pub index_of_this_client: usize,
    pub num_active_clients: usize,
    /// Clients whose heartbeat has lapsed.
    pub expired_client_ids: Vec<String>,
}

/// Per-bucket registry of the clients running lost-transaction cleanup, so
/// that they can split the bucket's ATRs between them.
#[async_trait]
pub trait CleanerRepository: Send + Sync {
    /// Registers `client_uuid` or refreshes its heartbeat. Clients that have
    /// not refreshed within `client_expiry` are reported as expired.
    async fn create_or_update_client_record(
        &self,
        bucket: &str,
        client_uuid: &str,
        client_expiry: Duration,
    ) -> KvResult<ClientRecordDetails>;

    async fn remove_client_record(&self, bucket: &str, client_uuid: &str) -> KvResult<()>;
}
