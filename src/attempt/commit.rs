use std::sync::atomic::Ordering;

use log::{debug, error, info, warn};
use serde_json::Value;

use super::{AttemptContext, retry_exhausted};
use crate::data_model::{AtrRef, AttemptState};
use crate::errors::{AttemptError, ErrorBuilder, ErrorClass, Result};
use crate::hooks::stage;
use crate::ledger::{StagedMutation, StagedMutationKind};
use crate::retry::{RepeatAction, RetryLoop};
use crate::triage;

/// What re-reading the ATR after an ambiguous commit write showed.
enum CommitAmbiguity {
    Committed,
    StillPending,
}

impl AttemptContext {
    pub(super) async fn commit_with_kv(&self) -> Result<()> {
        let previous = self.previous_errors();
        if !previous.is_empty() {
            info!(
                "Attempt {} cannot commit, {} earlier operation(s) failed",
                self.attempt_id,
                previous.len()
            );
            return Err(triage::commit_with_previous_errors(previous));
        }
        self.check_expiry_and_throw(stage::BEFORE_COMMIT, None)?;
        self.done_check()?;
        self.is_done.store(true, Ordering::SeqCst);

        if self.ledger.lock().is_empty() {
            debug!("Attempt {} has nothing to commit", self.attempt_id);
            return Ok(());
        }

        let atr = self.required_atr()?;
        self.set_atr_commit(&atr).await?;
        self.unstage_docs().await?;
        self.unstaging_complete.store(true, Ordering::SeqCst);
        self.set_atr_complete(&atr).await?;
        info!("Attempt {} committed", self.attempt_id);
        Ok(())
    }

    async fn set_atr_commit(&self, atr: &AtrRef) -> Result<()> {
        let mut retry = RetryLoop::new("set_atr_commit");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            let res: std::result::Result<(), AttemptError> = async {
                self.error_if_expired_and_not_in_overtime(stage::ATR_COMMIT, None)?;
                self.hooks.before_atr_commit(&self.attempt_id).await?;
                let mutations = self.atr_mutations();
                self.atrs
                    .mutate_atr_commit(atr, &self.attempt_id, &mutations)
                    .await?;
                self.hooks.after_atr_commit(&self.attempt_id).await?;
                Ok(())
            }
            .await;

            let err = match res {
                Ok(()) => {
                    self.set_state(AttemptState::Committed);
                    return Ok(());
                }
                Err(err) => err,
            };
            let triaged = triage::set_atr_commit(&err);
            warn!(
                "Attempt {} failed to commit ATR {} ({:?}): {}",
                self.attempt_id, atr, triaged.0, err
            );
            match triaged {
                (ErrorClass::FailExpiry, _) => self.enter_overtime(),
                (ErrorClass::FailAmbiguous, None) => {
                    match self.resolve_set_atr_commit_ambiguity(atr).await? {
                        CommitAmbiguity::Committed => {
                            self.set_state(AttemptState::Committed);
                            return Ok(());
                        }
                        CommitAmbiguity::StillPending => {
                            retry.pause(RepeatAction::RepeatWithDelay).await;
                            continue;
                        }
                    }
                }
                _ => {}
            }
            return Err(triage::assert_not_null(triaged, &err));
        }
    }

    /// Re-reads the entry after an ambiguous commit write to learn whether it
    /// took effect.
    async fn resolve_set_atr_commit_ambiguity(&self, atr: &AtrRef) -> Result<CommitAmbiguity> {
        let mut retry = RetryLoop::new("resolve_set_atr_commit_ambiguity");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            let res: std::result::Result<_, AttemptError> = async {
                self.error_if_expired_and_not_in_overtime(
                    stage::ATR_COMMIT_AMBIGUITY_RESOLUTION,
                    None,
                )?;
                self.hooks
                    .before_atr_commit_ambiguity_resolution(&self.attempt_id)
                    .await?;
                let raw = self.atrs.lookup_atr_state(atr, &self.attempt_id).await?;
                let state = raw.parse::<AttemptState>().map_err(|e| {
                    ErrorBuilder::new(ErrorClass::FailOther)
                        .cause(e)
                        .do_not_rollback_attempt()
                        .build()
                })?;
                debug!(
                    "Attempt {} commit ambiguity resolved, ATR says {}",
                    self.attempt_id, state
                );
                match state {
                    AttemptState::Committed => Ok(CommitAmbiguity::Committed),
                    AttemptState::Pending => Ok(CommitAmbiguity::StillPending),
                    AttemptState::Aborted | AttemptState::RolledBack => Err(ErrorBuilder::new(
                        ErrorClass::FailOther,
                    )
                    .cause(AttemptError::AbortedExternally)
                    .do_not_rollback_attempt()
                    .build()
                    .into()),
                    other => Err(ErrorBuilder::new(ErrorClass::FailOther)
                        .cause(AttemptError::illegal_state(format!(
                            "unexpected ATR state {other} while resolving commit ambiguity"
                        )))
                        .do_not_rollback_attempt()
                        .build()
                        .into()),
                }
            }
            .await;

            let err = match res {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            let triaged = triage::set_atr_commit_ambiguity(&err);
            match triaged {
                (ErrorClass::FailExpiry, _) => {
                    self.enter_overtime();
                    return Err(triage::assert_not_null(triaged, &err));
                }
                (ErrorClass::FailTransient | ErrorClass::FailOther, None) => {
                    debug!(
                        "Attempt {} retrying commit ambiguity resolution: {}",
                        self.attempt_id, err
                    );
                    retry.pause(RepeatAction::RepeatWithDelay).await;
                }
                _ => return Err(triage::assert_not_null(triaged, &err)),
            }
        }
    }

    async fn unstage_docs(&self) -> Result<()> {
        let staged = self.ledger.lock().snapshot();
        for mutation in &staged {
            match mutation.kind {
                StagedMutationKind::Remove => self.unstage_remove(mutation).await?,
                StagedMutationKind::Insert => {
                    self.unstage_insert_or_replace(mutation, true).await?
                }
                StagedMutationKind::Replace => {
                    self.unstage_insert_or_replace(mutation, false).await?
                }
            }
        }
        Ok(())
    }

    async fn unstage_insert_or_replace(
        &self,
        mutation: &StagedMutation,
        mut insert_mode: bool,
    ) -> Result<()> {
        let id = mutation.id();
        let content = mutation.content.clone().unwrap_or(Value::Null);
        let mut cas = mutation.cas();
        let mut ambiguity_resolution_mode = false;
        let mut retry = RetryLoop::new("unstage_insert_or_replace");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            if !self.is_in_overtime() && self.has_expired_client_side(stage::COMMIT_DOC, Some(&id.key)) {
                self.enter_overtime();
            }
            let res: std::result::Result<_, AttemptError> = async {
                self.hooks
                    .before_doc_committed(&self.attempt_id, &id.key)
                    .await?;
                let result = self
                    .docs
                    .unstage_insert_or_replace(
                        id,
                        cas,
                        &content,
                        insert_mode,
                        self.config.durability_level,
                    )
                    .await?;
                self.hooks
                    .after_doc_committed(&self.attempt_id, &id.key)
                    .await?;
                Ok(result)
            }
            .await;

            let err = match res {
                Ok(result) => {
                    debug!(
                        "Attempt {} unstaged {} (insert mode {})",
                        self.attempt_id, id, insert_mode
                    );
                    if let Some(token) = result.token {
                        self.unstaged_tokens.lock().push(token);
                    }
                    self.ledger.lock().update_cas(id, result.cas);
                    return Ok(());
                }
                Err(err) => err,
            };
            let triaged = triage::unstage_insert_or_replace(&err, self.is_in_overtime());
            match triaged.0 {
                ErrorClass::FailAmbiguous => {
                    ambiguity_resolution_mode = true;
                }
                ErrorClass::FailCasMismatch if !ambiguity_resolution_mode => {
                    // Someone touched the document after staging; the staged
                    // content is still ours to write.
                    cas = 0;
                }
                ErrorClass::FailDocNotFound => {
                    error!(
                        "Attempt {} found {} missing while unstaging, inserting it",
                        self.attempt_id, id
                    );
                    insert_mode = true;
                }
                ErrorClass::FailDocAlreadyExists if !ambiguity_resolution_mode => {
                    error!(
                        "Attempt {} found {} already present while unstaging, replacing it",
                        self.attempt_id, id
                    );
                    insert_mode = false;
                    cas = 0;
                }
                _ => {
                    warn!(
                        "Attempt {} failed to unstage {}: {}",
                        self.attempt_id, id, err
                    );
                    return Err(triage::assert_not_null(triaged, &err));
                }
            }
            retry.pause(RepeatAction::RepeatWithDelay).await;
        }
    }

    async fn unstage_remove(&self, mutation: &StagedMutation) -> Result<()> {
        let id = mutation.id();
        let mut retry = RetryLoop::new("unstage_remove");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            if !self.is_in_overtime() && self.has_expired_client_side(stage::REMOVE_DOC, Some(&id.key)) {
                self.enter_overtime();
            }
            let res: std::result::Result<_, AttemptError> = async {
                self.hooks
                    .before_doc_removed(&self.attempt_id, &id.key)
                    .await?;
                let result = self
                    .docs
                    .unstage_remove(id, mutation.cas(), self.config.durability_level)
                    .await?;
                self.hooks
                    .after_doc_removed(&self.attempt_id, &id.key)
                    .await?;
                Ok(result)
            }
            .await;

            let err = match res {
                Ok(result) => {
                    debug!("Attempt {} removed {}", self.attempt_id, id);
                    if let Some(token) = result.token {
                        self.unstaged_tokens.lock().push(token);
                    }
                    return Ok(());
                }
                Err(err) => err,
            };
            let triaged = triage::unstage_remove(&err, self.is_in_overtime());
            if triaged.0 == ErrorClass::FailAmbiguous {
                retry.pause(RepeatAction::RepeatWithDelay).await;
                continue;
            }
            warn!(
                "Attempt {} failed to remove {}: {}",
                self.attempt_id, id, err
            );
            return Err(triage::assert_not_null(triaged, &err));
        }
    }

    /// Marks the entry completed. Failures here leave the transaction
    /// committed and are only surfaced when the storage is broken.
    async fn set_atr_complete(&self, atr: &AtrRef) -> Result<()> {
        if self.has_expired_client_side(stage::ATR_COMPLETE, None) && !self.is_in_overtime() {
            debug!(
                "Attempt {} expired before completing its ATR entry, leaving it to cleanup",
                self.attempt_id
            );
            return Ok(());
        }
        let res: std::result::Result<(), AttemptError> = async {
            self.hooks.before_atr_complete(&self.attempt_id).await?;
            self.atrs
                .mutate_atr_complete(atr, &self.attempt_id)
                .await?;
            self.hooks.after_atr_complete(&self.attempt_id).await?;
            Ok(())
        }
        .await;

        match res {
            Ok(()) => {
                self.set_state(AttemptState::Completed);
                Ok(())
            }
            Err(err) => match triage::set_atr_complete(&err) {
                (_, Some(to_throw)) => Err(to_throw),
                (class, None) => {
                    info!(
                        "Attempt {} ignoring failure to complete ATR entry ({:?}): {}",
                        self.attempt_id, class, err
                    );
                    Ok(())
                }
            },
        }
    }
}
