use log::{debug, error, warn};
use serde_json::Value;

use super::{AttemptContext, retry_exhausted};
use crate::data_model::{
    AttemptState, DocId, DocumentLookupResult, StagedOperationType, TransactionGetResult,
};
use crate::errors::{AttemptError, ErrorBuilder, ErrorClass, KvError, Result};
use crate::forward_compat::InteractionPoint;
use crate::hooks::stage;
use crate::repository::StagingContext;
use crate::retry::{RepeatAction, RetryLoop};
use crate::triage;

/// Where the staged-insert algorithm currently is.
#[derive(Debug)]
enum InsertStep {
    /// Write the staged insert, creating the tombstone or overwriting the
    /// one with CAS `cas`.
    Stage { cas: Option<u64> },
    /// The key is taken: find out by what.
    ProbeExisting,
    /// A tombstone not owned by any live transaction is in the way.
    OverwriteTombstone { cas: u64 },
    /// Another transaction staged an insert of the same key.
    ResolveForeignInsert { existing: DocumentLookupResult },
}

impl AttemptContext {
    pub(super) async fn insert_with_kv(
        &self,
        id: &DocId,
        content: Value,
    ) -> Result<TransactionGetResult> {
        self.done_check()?;
        self.check_errors()?;
        if self.ledger.lock().contains(id) {
            return Err(ErrorBuilder::new(ErrorClass::FailDocAlreadyExists)
                .cause(KvError::DocumentExists)
                .build());
        }
        self.check_expiry_and_throw(stage::INSERT, Some(&id.key))?;
        self.init_atr_if_needed(id);

        let res = async {
            self.set_atr_pending_if_first_mutation().await?;
            self.create_staged_insert(id, &content, None).await
        }
        .await;
        self.record(res)
    }

    pub(super) async fn replace_with_kv(
        &self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> Result<TransactionGetResult> {
        self.done_check()?;
        self.check_errors()?;
        self.check_expiry_and_throw(stage::REPLACE, Some(&doc.id().key))?;
        self.record(self.check_fetched(doc.id()))?;
        self.record(
            self.check_write_write_conflict(doc, InteractionPoint::WriteWriteConflictReplacing)
                .await,
        )?;
        self.init_atr_if_needed(doc.id());

        let current = self.current_version(doc);
        let restaging_insert = self.ledger.lock().is_staged_insert(doc.id());
        let res = async {
            self.set_atr_pending_if_first_mutation().await?;
            if restaging_insert {
                // Still an insert: overwrite our own staged tombstone.
                return self
                    .create_staged_insert(current.id(), &content, Some(current.cas()))
                    .await;
            }
            self.create_staged_replace(&current, &content).await
        }
        .await;
        self.record(res)
    }

    pub(super) async fn remove_with_kv(&self, doc: &TransactionGetResult) -> Result<()> {
        self.done_check()?;
        self.check_errors()?;
        self.check_expiry_and_throw(stage::REMOVE, Some(&doc.id().key))?;
        if self.ledger.lock().is_staged_insert(doc.id()) {
            return self.record(Err(ErrorBuilder::new(ErrorClass::FailOther)
                .cause(AttemptError::illegal_state(format!(
                    "cannot remove {} after inserting it in the same attempt",
                    doc.id()
                )))
                .build()));
        }
        self.record(self.check_fetched(doc.id()))?;
        self.record(
            self.check_write_write_conflict(doc, InteractionPoint::WriteWriteConflictRemoving)
                .await,
        )?;
        self.init_atr_if_needed(doc.id());

        let current = self.current_version(doc);
        let res = async {
            self.set_atr_pending_if_first_mutation().await?;
            self.create_staged_remove(&current).await
        }
        .await;
        self.record(res)
    }

    /// Only documents read or staged by this attempt may be changed.
    fn check_fetched(&self, id: &DocId) -> Result<()> {
        if self.fetched.lock().contains(id) || self.ledger.lock().contains(id) {
            return Ok(());
        }
        Err(ErrorBuilder::new(ErrorClass::FailOther)
            .cause(AttemptError::illegal_state(format!(
                "{} was not read by attempt {}",
                id, self.attempt_id
            )))
            .build())
    }

    /// `doc` with the CAS and tombstone flag of this attempt's latest staging
    /// of it, if any.
    fn current_version(&self, doc: &TransactionGetResult) -> TransactionGetResult {
        match self.ledger.lock().find(doc.id()) {
            Some(staged) => {
                let mut current = doc.clone().with_cas(staged.cas());
                current.is_deleted = staged.doc.is_deleted;
                current
            }
            None => doc.clone(),
        }
    }

    async fn set_atr_pending_if_first_mutation(&self) -> Result<()> {
        if self.state() == AttemptState::NothingWritten {
            return self.set_atr_pending().await;
        }
        Ok(())
    }

    async fn set_atr_pending(&self) -> Result<()> {
        let atr = self.required_atr()?;
        let mut retry = RetryLoop::new("set_atr_pending");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            let res: std::result::Result<(), AttemptError> = async {
                self.error_if_expired_and_not_in_overtime(stage::ATR_PENDING, None)?;
                self.hooks.before_atr_pending(&self.attempt_id).await?;
                self.atrs
                    .mutate_atr_pending(
                        &atr,
                        &self.composite_id(),
                        self.pending_expiry_ms(),
                        self.config.durability_level,
                    )
                    .await?;
                self.hooks.after_atr_pending(&self.attempt_id).await?;
                Ok(())
            }
            .await;

            let err = match res {
                Ok(()) => {
                    debug!("Attempt {} is pending in ATR {}", self.attempt_id, atr);
                    self.set_state(AttemptState::Pending);
                    return Ok(());
                }
                Err(err) => err,
            };
            let triaged = triage::set_atr_pending(&err, self.is_in_overtime());
            warn!(
                "Attempt {} failed to set ATR {} pending ({:?}): {}",
                self.attempt_id, atr, triaged.0, err
            );
            match triaged.0 {
                ErrorClass::FailExpiry => self.enter_overtime(),
                ErrorClass::FailAmbiguous if triaged.1.is_none() => {
                    retry.pause(RepeatAction::RepeatWithDelay).await;
                    continue;
                }
                ErrorClass::FailPathAlreadyExists if triaged.1.is_none() => {
                    self.set_state(AttemptState::Pending);
                    return Ok(());
                }
                _ => {}
            }
            return Err(triage::assert_not_null(triaged, &err));
        }
    }

    async fn create_staged_insert(
        &self,
        id: &DocId,
        content: &Value,
        cas: Option<u64>,
    ) -> Result<TransactionGetResult> {
        let atr = self.required_atr()?;
        let staging = self.staging_context(&atr);
        let mut retry = RetryLoop::new("create_staged_insert");
        let mut step = InsertStep::Stage { cas };
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            debug!("Attempt {} staging insert of {}: {:?}", self.attempt_id, id, step);
            step = match step {
                InsertStep::Stage { cas } => {
                    let err = match self.try_stage_insert(id, content, &staging, cas).await {
                        Ok(doc) => return Ok(doc),
                        Err(err) => err,
                    };
                    let triaged = triage::create_staged_insert(&err, self.is_in_overtime());
                    match triaged {
                        (ErrorClass::FailExpiry, _) => {
                            self.enter_overtime();
                            return Err(triage::assert_not_null(triaged, &err));
                        }
                        (ErrorClass::FailAmbiguous, None) => {
                            retry.pause(RepeatAction::RepeatWithDelay).await;
                            InsertStep::Stage { cas }
                        }
                        (ErrorClass::FailCasMismatch | ErrorClass::FailDocAlreadyExists, None) => {
                            InsertStep::ProbeExisting
                        }
                        _ => return Err(triage::assert_not_null(triaged, &err)),
                    }
                }
                InsertStep::ProbeExisting => match self.probe_existing_on_insert(id).await {
                    Ok(next) => next,
                    Err(err) => {
                        return Err(triage::assert_not_null(
                            triage::doc_exists_on_staged_insert(&err),
                            &err,
                        ));
                    }
                },
                InsertStep::OverwriteTombstone { cas } => InsertStep::Stage { cas: Some(cas) },
                InsertStep::ResolveForeignInsert { existing } => {
                    match self.resolve_foreign_insert(existing).await {
                        Ok(next) => next,
                        Err(err) => {
                            return Err(triage::assert_not_null(
                                triage::doc_exists_on_staged_insert(&err),
                                &err,
                            ));
                        }
                    }
                }
            };
        }
    }

    async fn try_stage_insert(
        &self,
        id: &DocId,
        content: &Value,
        staging: &StagingContext,
        cas: Option<u64>,
    ) -> std::result::Result<TransactionGetResult, AttemptError> {
        self.error_if_expired_and_not_in_overtime(stage::CREATE_STAGED_INSERT, Some(&id.key))?;
        self.hooks
            .before_staged_insert(&self.attempt_id, &id.key)
            .await?;
        let result = self
            .docs
            .mutate_staged_insert(id, content, staging, cas)
            .await?;
        debug!(
            "Attempt {} staged insert of {} (cas {})",
            self.attempt_id, id, result.cas
        );
        self.hooks
            .after_staged_insert_complete(&self.attempt_id, &id.key)
            .await?;

        let mut doc = TransactionGetResult::new(id.clone(), result.cas, Some(content.clone()));
        doc.xattrs = Some(staging.xattrs(
            StagedOperationType::Insert,
            Some(content.clone()),
            None,
        ));
        doc.is_deleted = true;
        self.ledger
            .lock()
            .stage_insert(doc.clone(), content.clone(), result.token);
        doc.is_deleted = false;
        Ok(doc)
    }

    /// Works out what occupies the key of a failed staged insert.
    async fn probe_existing_on_insert(
        &self,
        id: &DocId,
    ) -> std::result::Result<InsertStep, AttemptError> {
        self.hooks
            .before_get_doc_in_exists_during_staged_insert(&self.attempt_id, &id.key)
            .await?;
        let Some(existing) = self.docs.lookup_document(id, false).await? else {
            return Err(KvError::DocumentNotFound.into());
        };
        self.forward_compat_check(
            existing
                .xattrs
                .as_ref()
                .and_then(|x| x.forward_compatibility.as_ref()),
            InteractionPoint::WriteWriteConflictInsertingGet,
        )
        .await?;

        let in_txn = existing.in_transaction();
        if existing.is_deleted && !in_txn {
            debug!(
                "Attempt {} found a plain tombstone at {}, overwriting it",
                self.attempt_id, id
            );
            return Ok(InsertStep::OverwriteTombstone { cas: existing.cas });
        }
        if !in_txn {
            return Err(ErrorBuilder::new(ErrorClass::FailDocAlreadyExists)
                .cause(KvError::DocumentExists)
                .build()
                .into());
        }
        let op = existing.xattrs.as_ref().and_then(|x| x.operation_type());
        if op != Some(StagedOperationType::Insert) {
            warn!(
                "Attempt {} cannot insert {}: it is staged for {:?} by another transaction",
                self.attempt_id, id, op
            );
            return Err(ErrorBuilder::new(ErrorClass::FailDocAlreadyExists)
                .cause(KvError::DocumentExists)
                .build()
                .into());
        }
        Ok(InsertStep::ResolveForeignInsert { existing })
    }

    /// Another transaction staged an insert of the same key. Once that
    /// transaction no longer blocks, its staged insert is overwritten.
    async fn resolve_foreign_insert(
        &self,
        existing: DocumentLookupResult,
    ) -> std::result::Result<InsertStep, AttemptError> {
        let blocked = existing.post_transaction_result();
        self.check_write_write_conflict(&blocked, InteractionPoint::WriteWriteConflictInserting)
            .await?;
        if existing.is_deleted {
            return Ok(InsertStep::OverwriteTombstone { cas: existing.cas });
        }

        // A staged insert on a live document cannot be overwritten as a
        // tombstone: remove it and start the transaction over.
        error!(
            "Attempt {} found a staged insert of {} on a live document, removing it",
            self.attempt_id, existing.id
        );
        self.hooks
            .before_overwriting_staged_insert_removal(&self.attempt_id, &existing.id.key)
            .await?;
        if let Err(e) = self
            .docs
            .unstage_remove(&existing.id, existing.cas, self.config.durability_level)
            .await
        {
            let class = e.classify();
            let builder = ErrorBuilder::new(class).cause(e);
            return Err(match class {
                ErrorClass::FailDocNotFound | ErrorClass::FailCasMismatch => {
                    builder.retry_transaction()
                }
                _ => builder,
            }
            .build()
            .into());
        }
        Err(ErrorBuilder::new(ErrorClass::FailDocAlreadyExists)
            .cause(KvError::DocumentExists)
            .retry_transaction()
            .build()
            .into())
    }

    async fn create_staged_replace(
        &self,
        doc: &TransactionGetResult,
        content: &Value,
    ) -> Result<TransactionGetResult> {
        let atr = self.required_atr()?;
        let staging = self.staging_context(&atr);
        let res: std::result::Result<_, AttemptError> = async {
            self.error_if_expired_and_not_in_overtime(stage::REPLACE, Some(&doc.id().key))?;
            self.hooks
                .before_staged_replace(&self.attempt_id, &doc.id().key)
                .await?;
            let result = self
                .docs
                .mutate_staged_replace(doc, content, &staging, doc.is_deleted())
                .await?;
            debug!(
                "Attempt {} staged replace of {} (cas {})",
                self.attempt_id,
                doc.id(),
                result.cas
            );
            self.hooks
                .after_staged_replace_complete(&self.attempt_id, &doc.id().key)
                .await?;

            let mut staged = doc
                .clone()
                .with_cas(result.cas)
                .with_content(Some(content.clone()));
            staged.xattrs = Some(staging.xattrs(
                StagedOperationType::Replace,
                Some(content.clone()),
                doc.metadata().cloned(),
            ));
            self.ledger
                .lock()
                .stage_replace(staged.clone(), content.clone(), result.token);
            staged.is_deleted = false;
            Ok(staged)
        }
        .await;

        res.map_err(|err| {
            let triaged = triage::create_staged_replace_or_remove(&err);
            if triaged.0 == ErrorClass::FailExpiry {
                self.enter_overtime();
            }
            triage::assert_not_null(triaged, &err)
        })
    }

    async fn create_staged_remove(&self, doc: &TransactionGetResult) -> Result<()> {
        let atr = self.required_atr()?;
        let staging = self.staging_context(&atr);
        let res: std::result::Result<(), AttemptError> = async {
            self.error_if_expired_and_not_in_overtime(stage::REMOVE, Some(&doc.id().key))?;
            self.hooks
                .before_staged_remove(&self.attempt_id, &doc.id().key)
                .await?;
            let result = self.docs.mutate_staged_remove(doc, &staging).await?;
            debug!(
                "Attempt {} staged remove of {} (cas {})",
                self.attempt_id,
                doc.id(),
                result.cas
            );
            self.hooks
                .after_staged_remove_complete(&self.attempt_id, &doc.id().key)
                .await?;

            let mut staged = doc.clone().with_cas(result.cas).with_content(None);
            staged.xattrs = Some(staging.xattrs(
                StagedOperationType::Remove,
                None,
                doc.metadata().cloned(),
            ));
            self.ledger.lock().stage_remove(staged, result.token)
        }
        .await;

        res.map_err(|err| {
            let triaged = triage::create_staged_replace_or_remove(&err);
            if triaged.0 == ErrorClass::FailExpiry {
                self.enter_overtime();
            }
            triage::assert_not_null(triaged, &err)
        })
    }
}
