use async_trait::async_trait;
use serde_json::Value;

use crate::config::DurabilityLevel;
use crate::data_model::{
    AtrEntry, AtrRef, CompositeId, DocId, DocRecord, DocumentLookupResult, DocumentMetadata,
    StagedOperation, StagedOperationType, TransactionGetResult, TransactionXattrs,
};
use crate::errors::KvError;

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Sequence position of a mutation, used for read-your-writes consistency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationToken {
    pub bucket: String,
    pub vbucket_id: u16,
    pub vbucket_uuid: u64,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
    pub token: Option<MutationToken>,
}

/// Who is staging, and where their outcome will be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingContext {
    pub id: CompositeId,
    pub atr_ref: AtrRef,
    pub durability: DurabilityLevel,
}

impl StagingContext {
    /// The transaction metadata a staged `op` carries.
    pub fn xattrs(
        &self,
        op: StagedOperationType,
        staged: Option<Value>,
        restore: Option<DocumentMetadata>,
    ) -> TransactionXattrs {
        TransactionXattrs {
            id: Some(self.id.clone()),
            atr_ref: Some(self.atr_ref.clone()),
            operation: Some(StagedOperation {
                op_type: op,
                staged,
                crc32: None,
            }),
            restore,
            forward_compatibility: None,
        }
    }
}

/// Document lists written into an ATR entry at commit or abort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtrMutations {
    pub inserted: Vec<DocRecord>,
    pub replaced: Vec<DocRecord>,
    pub removed: Vec<DocRecord>,
}

/// Stages and unstages changes on individual documents.
///
/// Staging never touches a document's body: the staged content and the
/// owning attempt are written as transaction metadata next to it, guarded by
/// the document's CAS. Staged inserts live in tombstones so they stay
/// invisible to non-transactional readers.
///
/// Implementations must be `Send` and `Sync`; a single repository is shared by
/// every attempt of a [`crate::Transactions`] instance.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Reads body, transaction metadata and document metadata, including
    /// tombstones. `Ok(None)` when neither document nor tombstone exists.
    async fn lookup_document(
        &self,
        id: &DocId,
        full_document: bool,
    ) -> KvResult<Option<DocumentLookupResult>>;

    /// Stages an insert into a tombstone.
    ///
    /// With `cas == None` the tombstone is created and the call fails with
    /// [`KvError::DocumentExists`] if the key is taken. With `Some(cas)` an
    /// existing tombstone is overwritten, guarded by that CAS.
    async fn mutate_staged_insert(
        &self,
        id: &DocId,
        content: &Value,
        staging: &StagingContext,
        cas: Option<u64>,
    ) -> KvResult<MutationResult>;

    /// Stages a replace of `doc`, recording its restore metadata.
    async fn mutate_staged_replace(
        &self,
        doc: &TransactionGetResult,
        content: &Value,
        staging: &StagingContext,
        access_deleted: bool,
    ) -> KvResult<MutationResult>;

    async fn mutate_staged_remove(
        &self,
        doc: &TransactionGetResult,
        staging: &StagingContext,
    ) -> KvResult<MutationResult>;

    /// Makes `content` the document body and strips transaction metadata.
    /// `cas == 0` skips the CAS check. In insert mode the document is created
    /// over its tombstone.
    async fn unstage_insert_or_replace(
        &self,
        id: &DocId,
        cas: u64,
        content: &Value,
        insert_mode: bool,
        durability: DurabilityLevel,
    ) -> KvResult<MutationResult>;

    /// Deletes the document. `cas == 0` skips the CAS check.
    async fn unstage_remove(
        &self,
        id: &DocId,
        cas: u64,
        durability: DurabilityLevel,
    ) -> KvResult<MutationResult>;

    /// Strips transaction metadata, leaving the pre-transaction body (or the
    /// bare tombstone when `is_deleted`).
    async fn clear_transaction_metadata(
        &self,
        id: &DocId,
        cas: u64,
        is_deleted: bool,
    ) -> KvResult<()>;
}

/// Reads and writes attempt entries inside ATR documents.
///
/// Missing ATR documents surface as [`KvError::DocumentNotFound`], missing
/// entries as [`KvError::PathNotFound`].
#[async_trait]
pub trait AtrRepository: Send + Sync {
    /// Creates the attempt's entry in state `pending`. Fails with
    /// [`KvError::PathExists`] if it already exists and
    /// [`KvError::ValueTooLarge`] if the ATR has no room.
    async fn mutate_atr_pending(
        &self,
        atr: &AtrRef,
        id: &CompositeId,
        expires_after_ms: u64,
        durability: DurabilityLevel,
    ) -> KvResult<()>;

    async fn mutate_atr_commit(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
        mutations: &AtrMutations,
    ) -> KvResult<()>;

    async fn mutate_atr_complete(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<()>;

    async fn mutate_atr_aborted(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
        mutations: &AtrMutations,
    ) -> KvResult<()>;

    async fn mutate_atr_rolled_back(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<()>;

    /// Raw status string of the entry.
    async fn lookup_atr_state(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<String>;

    /// `Ok(None)` when the ATR exists but holds no entry for `attempt_id`.
    async fn find_entry(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<Option<AtrEntry>>;

    /// Every entry of the ATR, for cleanup scans.
    async fn lookup_entries(&self, atr: &AtrRef) -> KvResult<Vec<AtrEntry>>;

    async fn remove_entry(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<()>;
}
