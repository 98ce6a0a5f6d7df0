//! A single attempt of a transaction.
//!
//! An [`AttemptContext`] is handed to the application's transaction logic.
//! Every document operation stages its change under the attempt's ATR entry;
//! [`AttemptContext::commit`] flips that entry to committed and unstages, and
//! [`AttemptContext::rollback`] undoes whatever was staged.

mod commit;
mod query_mode;
mod rollback;
mod staging;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashSet;
use log::{Level, debug, info, log, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::atr_ids;
use crate::cleanup::CleanupRequest;
use crate::config::TransactionConfig;
use crate::conflict::detection::{ConflictType, detect_conflicts};
use crate::conflict::resolution::read_visible_version;
use crate::data_model::{
    AtrRef, AttemptState, CompositeId, DocId, Keyspace, TransactionGetResult,
};
use crate::errors::{
    AttemptError, ErrorBuilder, ErrorClass, FinalError, KvError, Result,
    TransactionOperationFailed,
};
use crate::forward_compat::{self, ForwardCompatibilityFailure, InteractionPoint};
use crate::hooks::{TestHooks, stage};
use crate::ledger::{StagedMutation, StagedMutationKind, StagedMutationLedger};
use crate::query::QueryEngine;
use crate::repository::{
    AtrMutations, AtrRepository, DocumentRepository, MutationToken, StagingContext,
};
use crate::retry::{RepeatAction, RetryLoop};
use crate::transactions::{TransactionAttempt, TransactionContext};
use crate::triage;

/// How long after its start an attempt fails fast on a write-write conflict
/// instead of waiting for the blocking attempt.
pub const WRITE_WRITE_CONFLICT_GRACE: Duration = Duration::from_secs(1);

/// Storage, query and hook collaborators shared by every attempt.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) docs: Arc<dyn DocumentRepository>,
    pub(crate) atrs: Arc<dyn AtrRepository>,
    pub(crate) query: Option<Arc<dyn QueryEngine>>,
    pub(crate) hooks: Arc<dyn TestHooks>,
}

/// Represents one attempt of a transaction.
///
/// All operations take `&self`, so the context can be shared (it is handed
/// out as an `Arc`) by concurrent operations of the application's logic.
pub struct AttemptContext {
    /// Unique identifier of this attempt.
    attempt_id: String,
    /// The transaction this attempt belongs to, and its overall deadline.
    overall: Arc<TransactionContext>,
    config: TransactionConfig,
    docs: Arc<dyn DocumentRepository>,
    atrs: Arc<dyn AtrRepository>,
    query_engine: Option<Arc<dyn QueryEngine>>,
    hooks: Arc<dyn TestHooks>,
    started: Instant,
    state: Mutex<AttemptState>,
    /// Staged changes, at most one per document.
    ledger: Mutex<StagedMutationLedger>,
    /// The ATR chosen by the first mutation.
    atr: Mutex<Option<AtrRef>>,
    /// Failures of earlier operations, keyed by their sequence number.
    previous_errors: Mutex<BTreeMap<u64, TransactionOperationFailed>>,
    unstaged_tokens: Mutex<Vec<MutationToken>>,
    is_done: AtomicBool,
    /// Set once the deadline has passed; the attempt may then only clean up.
    overtime: AtomicBool,
    expiry_reported: AtomicBool,
    /// Documents this attempt has read or inserted, the only ones it may
    /// replace or remove.
    fetched: Mutex<AHashSet<DocId>>,
    unstaging_complete: AtomicBool,
    query_mode: AtomicBool,
    /// Serializes entry into query mode.
    query_begin: tokio::sync::Mutex<()>,
    last_dispatched_node: Mutex<Option<String>>,
}

impl AttemptContext {
    pub(crate) fn new(
        overall: Arc<TransactionContext>,
        config: TransactionConfig,
        collaborators: Collaborators,
    ) -> Self {
        let attempt_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "Starting attempt {} of transaction {}",
            attempt_id,
            overall.transaction_id()
        );
        Self {
            attempt_id,
            overall,
            config,
            docs: collaborators.docs,
            atrs: collaborators.atrs,
            query_engine: collaborators.query,
            hooks: collaborators.hooks,
            started: Instant::now(),
            state: Mutex::new(AttemptState::NothingWritten),
            ledger: Mutex::new(StagedMutationLedger::new()),
            atr: Mutex::new(None),
            previous_errors: Mutex::new(BTreeMap::new()),
            unstaged_tokens: Mutex::new(Vec::new()),
            is_done: AtomicBool::new(false),
            overtime: AtomicBool::new(false),
            expiry_reported: AtomicBool::new(false),
            fetched: Mutex::new(AHashSet::new()),
            unstaging_complete: AtomicBool::new(false),
            query_mode: AtomicBool::new(false),
            query_begin: tokio::sync::Mutex::new(()),
            last_dispatched_node: Mutex::new(None),
        }
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn transaction_id(&self) -> &str {
        self.overall.transaction_id()
    }

    pub fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    pub fn is_done(&self) -> bool {
        self.is_done.load(Ordering::SeqCst)
    }

    pub fn is_query_mode(&self) -> bool {
        self.query_mode.load(Ordering::SeqCst)
    }

    pub fn is_in_overtime(&self) -> bool {
        self.overtime.load(Ordering::SeqCst)
    }

    /// True once every staged change has been made visible.
    pub fn unstaging_complete(&self) -> bool {
        self.unstaging_complete.load(Ordering::SeqCst)
    }

    /// The ATR this attempt records its state in, once it has mutated.
    pub fn atr_ref(&self) -> Option<AtrRef> {
        self.atr.lock().clone()
    }

    pub fn staged_mutations(&self) -> Vec<StagedMutation> {
        self.ledger.lock().snapshot()
    }

    /// Fetches `id`, failing with [`ErrorClass::FailDocNotFound`] when it is
    /// not visible to this attempt.
    pub async fn get(&self, id: &DocId) -> Result<TransactionGetResult> {
        match self.get_optional(id).await? {
            Some(doc) => Ok(doc),
            None => Err(ErrorBuilder::new(ErrorClass::FailDocNotFound)
                .cause(KvError::DocumentNotFound)
                .build()),
        }
    }

    /// Fetches `id`, returning `None` when it is not visible to this attempt.
    pub async fn get_optional(&self, id: &DocId) -> Result<Option<TransactionGetResult>> {
        if self.is_query_mode() {
            return self.get_with_query(id).await;
        }
        self.get_with_kv(id).await
    }

    pub async fn insert(&self, id: &DocId, content: Value) -> Result<TransactionGetResult> {
        if self.is_query_mode() {
            return self.insert_with_query(id, content).await;
        }
        self.insert_with_kv(id, content).await
    }

    pub async fn replace(
        &self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> Result<TransactionGetResult> {
        if self.is_query_mode() {
            return self.replace_with_query(doc, content).await;
        }
        self.replace_with_kv(doc, content).await
    }

    pub async fn remove(&self, doc: &TransactionGetResult) -> Result<()> {
        if self.is_query_mode() {
            return self.remove_with_query(doc).await;
        }
        self.remove_with_kv(doc).await
    }

    pub async fn commit(&self) -> Result<()> {
        if self.is_query_mode() {
            return self.commit_with_query().await;
        }
        self.commit_with_kv().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.rollback_internal(true).await
    }

    pub(crate) async fn rollback_internal(&self, is_app_rollback: bool) -> Result<()> {
        if self.is_query_mode() {
            return self.rollback_with_query(is_app_rollback).await;
        }
        self.rollback_with_kv(is_app_rollback).await
    }

    /// Commits unless the application already committed or rolled back.
    pub(crate) async fn auto_commit(&self) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        match self.state() {
            AttemptState::NothingWritten | AttemptState::Pending => self.commit().await,
            _ => Ok(()),
        }
    }

    /// What a cleaner needs to finish this attempt, if it left anything behind.
    pub fn get_cleanup_request(&self) -> Option<CleanupRequest> {
        let atr_ref = self.atr_ref()?;
        let state = self.state();
        if matches!(
            state,
            AttemptState::NothingWritten | AttemptState::Completed | AttemptState::RolledBack
        ) {
            return None;
        }
        let mutations = self.atr_mutations();
        Some(CleanupRequest {
            attempt_id: self.attempt_id.clone(),
            atr_ref,
            inserted: mutations.inserted,
            replaced: mutations.replaced,
            removed: mutations.removed,
            state,
            when_ready: Instant::now(),
            forward_compatibility: None,
            durability_level: self.config.durability_level,
        })
    }

    pub(crate) fn to_attempt_summary(&self) -> TransactionAttempt {
        let ledger = self.ledger.lock();
        let ids = |kind: StagedMutationKind| -> Vec<DocId> {
            ledger.of_kind(kind).map(|m| m.id().clone()).collect()
        };
        TransactionAttempt {
            attempt_id: self.attempt_id.clone(),
            atr_ref: self.atr_ref(),
            final_state: self.state(),
            staged_insert_ids: ids(StagedMutationKind::Insert),
            staged_replace_ids: ids(StagedMutationKind::Replace),
            staged_remove_ids: ids(StagedMutationKind::Remove),
            staged_mutation_tokens: ledger.mutation_tokens(),
            mutation_tokens: self.unstaged_tokens.lock().clone(),
            time_taken: self.started.elapsed(),
        }
    }

    async fn get_with_kv(&self, id: &DocId) -> Result<Option<TransactionGetResult>> {
        self.done_check()?;
        self.check_errors()?;
        self.check_expiry_and_throw(stage::GET, Some(&id.key))?;

        let own = self.ledger.lock().find(id).cloned();
        if let Some(staged) = own {
            debug!(
                "Attempt {} reading its own staged {:?} of {}",
                self.attempt_id, staged.kind, id
            );
            return Ok(match staged.kind {
                StagedMutationKind::Remove => None,
                _ => {
                    let mut doc = staged.doc.with_content(staged.content);
                    doc.is_deleted = false;
                    Some(doc)
                }
            });
        }

        let res: std::result::Result<_, AttemptError> = async {
            self.hooks.before_doc_get(&self.attempt_id, &id.key).await?;
            let doc =
                read_visible_version(self.docs.as_ref(), self.atrs.as_ref(), id, &self.attempt_id)
                    .await?;
            self.hooks.after_get_complete(&self.attempt_id, &id.key).await?;
            if let Some(doc) = &doc {
                self.forward_compat_check(
                    doc.transaction_xattrs()
                        .and_then(|x| x.forward_compatibility.as_ref()),
                    InteractionPoint::Gets,
                )
                .await?;
            }
            Ok(doc)
        }
        .await;

        match res {
            Ok(doc) => {
                if let Some(doc) = &doc {
                    self.fetched.lock().insert(doc.id().clone());
                }
                Ok(doc)
            }
            Err(err) => {
                let triaged = triage::get(&err);
                if triaged.0 == ErrorClass::FailDocNotFound && triaged.1.is_none() {
                    return Ok(None);
                }
                warn!("Attempt {} failed to get {}: {}", self.attempt_id, id, err);
                self.record(Err(triage::assert_not_null(triaged, &err)))
            }
        }
    }

    /// Waits out, or fails on, a live attempt of another transaction holding `doc`.
    ///
    /// Within [`WRITE_WRITE_CONFLICT_GRACE`] of this attempt's start the
    /// conflict fails fast with a retryable error. Past it, the blocking
    /// attempt's ATR entry is polled with backoff until it clears or expires.
    async fn check_write_write_conflict(
        &self,
        doc: &TransactionGetResult,
        point: InteractionPoint,
    ) -> Result<()> {
        let mut retry = RetryLoop::new("check_write_write_conflict");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            forward_compat::check(
                doc.transaction_xattrs()
                    .and_then(|x| x.forward_compatibility.as_ref()),
                point,
            )
            .await
            .map_err(ForwardCompatibilityFailure::into_operation_failed)?;

            if doc
                .transaction_xattrs()
                .and_then(|x| x.transaction_id())
                .is_none_or(|tid| tid == self.transaction_id())
            {
                return Ok(());
            }
            self.check_expiry_and_throw(stage::CHECK_WRITE_WRITE_CONFLICT, Some(&doc.id().key))?;

            let probe: std::result::Result<_, AttemptError> = async {
                self.hooks
                    .before_check_atr_entry_for_blocking_doc(&self.attempt_id, &doc.id().key)
                    .await?;
                detect_conflicts(self.atrs.as_ref(), doc, self.transaction_id()).await
            }
            .await;
            match probe {
                Ok(ConflictType::None) => return Ok(()),
                Ok(ConflictType::WriteWrite { attempt_id, state }) => {
                    if self.started.elapsed() < WRITE_WRITE_CONFLICT_GRACE {
                        info!(
                            "Attempt {} found {} staged by attempt {} ({}), retrying the transaction",
                            self.attempt_id,
                            doc.id(),
                            attempt_id,
                            state
                        );
                        return Err(write_write_conflict(None));
                    }
                    debug!(
                        "Attempt {} waiting for attempt {} ({}) to release {}",
                        self.attempt_id,
                        attempt_id,
                        state,
                        doc.id()
                    );
                    retry.pause(RepeatAction::RepeatWithBackoff).await;
                }
                Err(AttemptError::Operation(op)) => return Err(op),
                Err(err) => return Err(write_write_conflict(Some(err))),
            }
        }
    }

    fn init_atr_if_needed(&self, id: &DocId) -> AtrRef {
        let mut atr = self.atr.lock();
        if let Some(selected) = atr.as_ref() {
            return selected.clone();
        }
        let keyspace = self
            .config
            .metadata_collection
            .clone()
            .unwrap_or_else(|| Keyspace::default_collection(id.bucket()));
        let vbucket = atr_ids::vbucket_for_key(&id.key);
        let atr_key = self
            .hooks
            .atr_id_for_vbucket(vbucket)
            .unwrap_or_else(|| atr_ids::atr_id_for_vbucket(vbucket).to_string());
        let selected = AtrRef::new(&keyspace, atr_key);
        debug!(
            "Attempt {} using ATR {} (first mutated document {})",
            self.attempt_id, selected, id
        );
        *atr = Some(selected.clone());
        selected
    }

    fn required_atr(&self) -> Result<AtrRef> {
        self.atr_ref().ok_or_else(|| {
            ErrorBuilder::new(ErrorClass::FailOther)
                .cause(AttemptError::illegal_state("no ATR selected"))
                .build()
        })
    }

    fn composite_id(&self) -> CompositeId {
        CompositeId {
            transaction_id: self.transaction_id().to_string(),
            attempt_id: self.attempt_id.clone(),
        }
    }

    fn staging_context(&self, atr: &AtrRef) -> StagingContext {
        StagingContext {
            id: self.composite_id(),
            atr_ref: atr.clone(),
            durability: self.config.durability_level,
        }
    }

    fn atr_mutations(&self) -> AtrMutations {
        let ledger = self.ledger.lock();
        AtrMutations {
            inserted: ledger.doc_records(StagedMutationKind::Insert),
            replaced: ledger.doc_records(StagedMutationKind::Replace),
            removed: ledger.doc_records(StagedMutationKind::Remove),
        }
    }

    /// The expiry recorded in the pending ATR entry: what is left of the
    /// transaction's budget, never more than the configured expiration.
    fn pending_expiry_ms(&self) -> u64 {
        let budget = self.overall.remaining().min(self.config.expiration_time);
        u64::try_from(budget.as_millis()).unwrap_or(u64::MAX)
    }

    fn set_state(&self, state: AttemptState) {
        let mut current = self.state.lock();
        debug!(
            "Attempt {} state {} -> {}",
            self.attempt_id, *current, state
        );
        *current = state;
    }

    fn done_check(&self) -> Result<()> {
        if self.is_done() {
            return Err(ErrorBuilder::new(ErrorClass::FailOther)
                .cause(AttemptError::illegal_state(
                    "attempt has already been committed or rolled back",
                ))
                .do_not_rollback_attempt()
                .build());
        }
        Ok(())
    }

    fn check_errors(&self) -> Result<()> {
        let previous = self.previous_errors();
        if previous.is_empty() {
            return Ok(());
        }
        Err(triage::commit_with_previous_errors(previous))
    }

    fn previous_errors(&self) -> Vec<TransactionOperationFailed> {
        self.previous_errors.lock().values().cloned().collect()
    }

    fn save_error(&self, err: &TransactionOperationFailed) {
        self.previous_errors
            .lock()
            .insert(err.sequence(), err.clone());
    }

    /// Remembers a failed result so later operations and commit see it.
    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.save_error(err);
        }
        result
    }

    fn has_expired_client_side(&self, stage: &str, key: Option<&str>) -> bool {
        let over = self.overall.is_expired();
        let forced = self
            .hooks
            .has_expired_client_side(&self.attempt_id, stage, key);
        if !over && !forced {
            return false;
        }
        let level = if self.expiry_reported.swap(true, Ordering::SeqCst) {
            Level::Debug
        } else {
            Level::Info
        };
        if over {
            log!(
                level,
                "Attempt {} expired in {} ({:?} elapsed of {:?})",
                self.attempt_id,
                stage,
                self.overall.elapsed(),
                self.config.expiration_time
            );
        } else {
            log!(level, "Attempt {} forced to expire in {}", self.attempt_id, stage);
        }
        true
    }

    fn expired(&self, stage: &str) -> AttemptError {
        AttemptError::Expired {
            attempt_id: self.attempt_id.clone(),
            stage: stage.to_string(),
        }
    }

    fn enter_overtime(&self) {
        if !self.overtime.swap(true, Ordering::SeqCst) {
            warn!("Attempt {} entering expiry overtime", self.attempt_id);
        }
    }

    /// Pre-commit expiry check: past the deadline the attempt enters overtime
    /// and the operation fails.
    fn check_expiry_and_throw(&self, stage: &str, key: Option<&str>) -> Result<()> {
        if self.has_expired_client_side(stage, key) {
            self.enter_overtime();
            return Err(ErrorBuilder::new(ErrorClass::FailExpiry)
                .cause(self.expired(stage))
                .raise(FinalError::TransactionExpired)
                .build());
        }
        Ok(())
    }

    /// Expiry check inside a protocol step; skipped once in overtime so that
    /// cleanup can finish.
    fn error_if_expired_and_not_in_overtime(
        &self,
        stage: &str,
        key: Option<&str>,
    ) -> std::result::Result<(), AttemptError> {
        if self.is_in_overtime() {
            debug!(
                "Attempt {} skipping expiry check in {}, already in overtime",
                self.attempt_id, stage
            );
            return Ok(());
        }
        if self.has_expired_client_side(stage, key) {
            return Err(self.expired(stage));
        }
        Ok(())
    }

    fn bailout_if_in_overtime(&self, stage: &str) -> Result<()> {
        if self.is_in_overtime() {
            return Err(ErrorBuilder::new(ErrorClass::FailExpiry)
                .cause(self.expired(stage))
                .do_not_rollback_attempt()
                .raise(FinalError::TransactionExpired)
                .build());
        }
        Ok(())
    }

    async fn forward_compat_check(
        &self,
        fc: Option<&forward_compat::ForwardCompatibility>,
        point: InteractionPoint,
    ) -> std::result::Result<(), AttemptError> {
        forward_compat::check(fc, point)
            .await
            .map_err(|f| AttemptError::Operation(f.into_operation_failed()))
    }
}

/// A protocol loop that ran out of iterations fails the attempt for good.
fn retry_exhausted(err: AttemptError) -> TransactionOperationFailed {
    ErrorBuilder::new(ErrorClass::FailOther)
        .cause(err)
        .do_not_rollback_attempt()
        .build()
}

fn write_write_conflict(cause: Option<AttemptError>) -> TransactionOperationFailed {
    let builder = ErrorBuilder::new(ErrorClass::FailWriteWriteConflict).retry_transaction();
    match cause {
        Some(cause) => builder.cause(cause),
        None => builder,
    }
    .build()
}
