//! Injection points for fault and expiry simulation.
//!
//! Production code uses [`DefaultTestHooks`], whose every hook is a no-op.
//! A hook returning `Err` makes the surrounding protocol step fail with that
//! error, exactly as if the storage collaborator had returned it.

use async_trait::async_trait;

use crate::repository::KvResult;

/// Stage names passed to [`TestHooks::has_expired_client_side`].
pub mod stage {
    pub const GET: &str = "get";
    pub const INSERT: &str = "insert";
    pub const REPLACE: &str = "replace";
    pub const REMOVE: &str = "remove";
    pub const BEFORE_COMMIT: &str = "commit";
    pub const ROLLBACK: &str = "rollback";
    pub const CREATE_STAGED_INSERT: &str = "createStagedInsert";
    pub const ATR_PENDING: &str = "atrPending";
    pub const ATR_COMMIT: &str = "atrCommit";
    pub const ATR_COMMIT_AMBIGUITY_RESOLUTION: &str = "atrCommitAmbiguityResolution";
    pub const ATR_COMPLETE: &str = "atrComplete";
    pub const ATR_ABORT: &str = "atrAbort";
    pub const ATR_ROLLBACK_COMPLETE: &str = "atrRollbackComplete";
    pub const COMMIT_DOC: &str = "commitDoc";
    pub const REMOVE_DOC: &str = "removeDoc";
    pub const ROLLBACK_DOC: &str = "rollbackDoc";
    pub const DELETE_INSERTED: &str = "deleteInserted";
    pub const CHECK_WRITE_WRITE_CONFLICT: &str = "checkWriteWriteConflict";
    pub const QUERY: &str = "query";
    pub const QUERY_BEGIN_WORK: &str = "queryBeginWork";
    pub const QUERY_COMMIT: &str = "queryCommit";
    pub const QUERY_ROLLBACK: &str = "queryRollback";
    pub const QUERY_KV_GET: &str = "queryKvGet";
    pub const QUERY_KV_INSERT: &str = "queryKvInsert";
    pub const QUERY_KV_REPLACE: &str = "queryKvReplace";
    pub const QUERY_KV_REMOVE: &str = "queryKvRemove";
}

#[allow(unused_variables)]
#[async_trait]
pub trait TestHooks: Send + Sync {
    async fn before_atr_pending(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_atr_pending(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_atr_commit(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_atr_commit(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_atr_commit_ambiguity_resolution(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_atr_complete(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_atr_complete(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_atr_aborted(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_atr_aborted(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_atr_rolled_back(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_atr_rolled_back(&self, attempt_id: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_doc_get(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_get_complete(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_staged_insert(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_staged_insert_complete(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_staged_replace(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_staged_replace_complete(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_staged_remove(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_staged_remove_complete(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_get_doc_in_exists_during_staged_insert(
        &self,
        attempt_id: &str,
        key: &str,
    ) -> KvResult<()> {
        Ok(())
    }

    async fn before_overwriting_staged_insert_removal(
        &self,
        attempt_id: &str,
        key: &str,
    ) -> KvResult<()> {
        Ok(())
    }

    async fn before_check_atr_entry_for_blocking_doc(
        &self,
        attempt_id: &str,
        key: &str,
    ) -> KvResult<()> {
        Ok(())
    }

    async fn before_doc_committed(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_doc_committed(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_doc_removed(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_doc_removed(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_rollback_delete_inserted(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_rollback_delete_inserted(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_doc_rolled_back(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_rollback_replace_or_remove(&self, attempt_id: &str, key: &str) -> KvResult<()> {
        Ok(())
    }

    async fn before_query(&self, attempt_id: &str, statement: &str) -> KvResult<()> {
        Ok(())
    }

    async fn after_query(&self, attempt_id: &str, statement: &str) -> KvResult<()> {
        Ok(())
    }

    /// Forces the attempt to consider itself expired at `stage`.
    fn has_expired_client_side(&self, attempt_id: &str, stage: &str, key: Option<&str>) -> bool {
        false
    }

    /// Overrides the ATR key chosen for `vbucket`.
    fn atr_id_for_vbucket(&self, vbucket: u16) -> Option<String> {
        None
    }
}

/// The production no-op hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTestHooks;

impl TestHooks for DefaultTestHooks {}
