use std::sync::atomic::Ordering;

use log::{debug, info, warn};

use super::{AttemptContext, retry_exhausted};
use crate::data_model::{AtrRef, AttemptState};
use crate::errors::{AttemptError, ErrorClass, Result};
use crate::hooks::stage;
use crate::ledger::{StagedMutation, StagedMutationKind};
use crate::retry::{RepeatAction, RetryLoop};
use crate::triage;

impl AttemptContext {
    pub(super) async fn rollback_with_kv(&self, is_app_rollback: bool) -> Result<()> {
        if !self.is_in_overtime() && self.has_expired_client_side(stage::ROLLBACK, None) {
            self.enter_overtime();
        }
        if self.state() == AttemptState::NothingWritten {
            debug!("Attempt {} has nothing to roll back", self.attempt_id);
            self.is_done.store(true, Ordering::SeqCst);
            return Ok(());
        }
        if is_app_rollback {
            self.done_check()?;
        }
        self.is_done.store(true, Ordering::SeqCst);

        let atr = self.required_atr()?;
        self.set_atr_aborted(&atr).await?;
        let staged = self.ledger.lock().snapshot();
        for mutation in &staged {
            match mutation.kind {
                StagedMutationKind::Insert => self.rollback_staged_insert(mutation).await?,
                StagedMutationKind::Replace | StagedMutationKind::Remove => {
                    self.rollback_staged_replace_or_remove(mutation).await?
                }
            }
        }
        self.set_atr_rolled_back(&atr).await?;
        info!("Attempt {} rolled back", self.attempt_id);
        Ok(())
    }

    async fn set_atr_aborted(&self, atr: &AtrRef) -> Result<()> {
        let mut retry = RetryLoop::new("set_atr_aborted");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            let res: std::result::Result<(), AttemptError> = async {
                self.error_if_expired_and_not_in_overtime(stage::ATR_ABORT, None)?;
                self.hooks.before_atr_aborted(&self.attempt_id).await?;
                let mutations = self.atr_mutations();
                self.atrs
                    .mutate_atr_aborted(atr, &self.attempt_id, &mutations)
                    .await?;
                self.hooks.after_atr_aborted(&self.attempt_id).await?;
                Ok(())
            }
            .await;

            let err = match res {
                Ok(()) => {
                    self.set_state(AttemptState::Aborted);
                    return Ok(());
                }
                Err(err) => err,
            };
            warn!(
                "Attempt {} failed to abort ATR entry in {}: {}",
                self.attempt_id, atr, err
            );
            self.bailout_if_in_overtime(stage::ATR_ABORT)?;
            let triaged = triage::set_atr_aborted(&err);
            match triaged {
                (ErrorClass::FailExpiry, _) => self.enter_overtime(),
                (ErrorClass::FailAmbiguous, None) => {
                    if self
                        .atr_reached(atr, &[AttemptState::Aborted, AttemptState::RolledBack])
                        .await
                    {
                        self.set_state(AttemptState::Aborted);
                        return Ok(());
                    }
                }
                (_, Some(to_throw)) => return Err(to_throw),
                (_, None) => {}
            }
            retry.pause(RepeatAction::RepeatWithBackoff).await;
        }
    }

    async fn set_atr_rolled_back(&self, atr: &AtrRef) -> Result<()> {
        let mut retry = RetryLoop::new("set_atr_rolled_back");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            let res: std::result::Result<(), AttemptError> = async {
                self.error_if_expired_and_not_in_overtime(stage::ATR_ROLLBACK_COMPLETE, None)?;
                self.hooks.before_atr_rolled_back(&self.attempt_id).await?;
                self.atrs
                    .mutate_atr_rolled_back(atr, &self.attempt_id)
                    .await?;
                self.hooks.after_atr_rolled_back(&self.attempt_id).await?;
                Ok(())
            }
            .await;

            let err = match res {
                Ok(()) => {
                    self.set_state(AttemptState::RolledBack);
                    return Ok(());
                }
                Err(err) => err,
            };
            warn!(
                "Attempt {} failed to mark ATR entry rolled back in {}: {}",
                self.attempt_id, atr, err
            );
            self.bailout_if_in_overtime(stage::ATR_ROLLBACK_COMPLETE)?;
            let triaged = triage::set_atr_rolled_back(&err);
            match triaged {
                (ErrorClass::FailPathNotFound | ErrorClass::FailDocNotFound, None) => {
                    // The entry is already gone, which is as rolled back as it gets.
                    self.set_state(AttemptState::RolledBack);
                    return Ok(());
                }
                (ErrorClass::FailAmbiguous, None) => {
                    if self.atr_reached(atr, &[AttemptState::RolledBack]).await {
                        self.set_state(AttemptState::RolledBack);
                        return Ok(());
                    }
                }
                (_, Some(to_throw)) => return Err(to_throw),
                (_, None) => {}
            }
            retry.pause(RepeatAction::RepeatWithBackoff).await;
        }
    }

    /// Whether an ambiguous abort or rollback write actually landed. The
    /// write itself is idempotent, so a failed lookup just means writing again.
    async fn atr_reached(&self, atr: &AtrRef, states: &[AttemptState]) -> bool {
        match self.atrs.lookup_atr_state(atr, &self.attempt_id).await {
            Ok(raw) => match raw.parse::<AttemptState>() {
                Ok(state) => {
                    debug!(
                        "Attempt {} ambiguous ATR write resolved, entry is {}",
                        self.attempt_id, state
                    );
                    states.contains(&state)
                }
                Err(_) => false,
            },
            Err(e) => {
                debug!(
                    "Attempt {} could not read ATR entry after ambiguous write: {}",
                    self.attempt_id, e
                );
                false
            }
        }
    }

    async fn rollback_staged_insert(&self, mutation: &StagedMutation) -> Result<()> {
        let id = mutation.id();
        let mut retry = RetryLoop::new("rollback_staged_insert");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            let res: std::result::Result<(), AttemptError> = async {
                self.error_if_expired_and_not_in_overtime(stage::DELETE_INSERTED, Some(&id.key))?;
                self.hooks
                    .before_rollback_delete_inserted(&self.attempt_id, &id.key)
                    .await?;
                self.docs
                    .clear_transaction_metadata(id, mutation.cas(), true)
                    .await?;
                self.hooks
                    .after_rollback_delete_inserted(&self.attempt_id, &id.key)
                    .await?;
                Ok(())
            }
            .await;

            let err = match res {
                Ok(()) => {
                    debug!("Attempt {} rolled back staged insert of {}", self.attempt_id, id);
                    return Ok(());
                }
                Err(err) => err,
            };
            warn!(
                "Attempt {} failed to roll back staged insert of {}: {}",
                self.attempt_id, id, err
            );
            self.bailout_if_in_overtime(stage::DELETE_INSERTED)?;
            match triage::rollback_staged_insert(&err) {
                (ErrorClass::FailExpiry, None) => self.enter_overtime(),
                (ErrorClass::FailDocNotFound | ErrorClass::FailPathNotFound, None) => {
                    return Ok(());
                }
                (_, Some(to_throw)) => return Err(to_throw),
                (_, None) => {}
            }
            retry.pause(RepeatAction::RepeatWithBackoff).await;
        }
    }

    async fn rollback_staged_replace_or_remove(&self, mutation: &StagedMutation) -> Result<()> {
        let id = mutation.id();
        let mut retry = RetryLoop::new("rollback_staged_replace_or_remove");
        loop {
            retry.next_iteration().map_err(retry_exhausted)?;
            let res: std::result::Result<(), AttemptError> = async {
                self.error_if_expired_and_not_in_overtime(stage::ROLLBACK_DOC, Some(&id.key))?;
                self.hooks
                    .before_doc_rolled_back(&self.attempt_id, &id.key)
                    .await?;
                self.docs
                    .clear_transaction_metadata(id, mutation.cas(), mutation.doc.is_deleted)
                    .await?;
                self.hooks
                    .after_rollback_replace_or_remove(&self.attempt_id, &id.key)
                    .await?;
                Ok(())
            }
            .await;

            let err = match res {
                Ok(()) => {
                    debug!("Attempt {} rolled back {}", self.attempt_id, id);
                    return Ok(());
                }
                Err(err) => err,
            };
            warn!(
                "Attempt {} failed to roll back {}: {}",
                self.attempt_id, id, err
            );
            self.bailout_if_in_overtime(stage::ROLLBACK_DOC)?;
            match triage::rollback_staged_replace_or_remove(&err) {
                (ErrorClass::FailExpiry, None) => self.enter_overtime(),
                (ErrorClass::FailPathNotFound, None) => return Ok(()),
                (_, Some(to_throw)) => return Err(to_throw),
                (_, None) => {}
            }
            retry.pause(RepeatAction::RepeatWithBackoff).await;
        }
    }
}
