use log::debug;

use crate::data_model::{AttemptState, DocId, DocumentLookupResult, StagedOperationType, TransactionGetResult};
use crate::errors::AttemptError;
use crate::forward_compat::{self, InteractionPoint};
use crate::repository::{AtrRepository, DocumentRepository};
use crate::triage;

/// Defines which version of a staged document a reader gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// The staged change is committed (or is our own): read through it.
    PostTransaction,
    /// The staged change is not committed: read the body underneath.
    PreTransaction,
    /// The owning attempt is pending and not yet seen: look again.
    Reread,
}

/// Decides which version of a staged document is visible.
pub fn resolve(owner_state: Option<AttemptState>, seen_pending_before: bool) -> ConflictResolution {
    match owner_state {
        Some(AttemptState::Committed | AttemptState::Completed) => ConflictResolution::PostTransaction,
        Some(AttemptState::Pending) if !seen_pending_before => ConflictResolution::Reread,
        _ => ConflictResolution::PreTransaction,
    }
}

fn visible(lookup: &DocumentLookupResult, resolution: ConflictResolution) -> Option<TransactionGetResult> {
    let op = lookup.xattrs.as_ref().and_then(|x| x.operation_type());
    match resolution {
        ConflictResolution::PostTransaction => match op {
            Some(StagedOperationType::Remove) => None,
            _ => {
                let mut doc = lookup.post_transaction_result();
                doc.is_deleted = false;
                Some(doc)
            }
        },
        _ => {
            if lookup.is_deleted || op == Some(StagedOperationType::Insert) {
                None
            } else {
                Some(lookup.pre_transaction_result())
            }
        }
    }
}

/// Reads `id` as a transaction must see it (monotonic atomic view).
///
/// Staged changes of `own_attempt_id` and committed changes of other attempts
/// are visible; uncommitted ones are not. A document staged by a pending
/// attempt is re-read once, in case that attempt commits in between.
pub async fn read_visible_version(
    docs: &dyn DocumentRepository,
    atrs: &dyn AtrRepository,
    id: &DocId,
    own_attempt_id: &str,
) -> Result<Option<TransactionGetResult>, AttemptError> {
    let mut seen_pending: Option<String> = None;
    loop {
        let Some(lookup) = docs.lookup_document(id, true).await? else {
            return Ok(None);
        };
        let Some((owner, atr_ref)) = lookup
            .xattrs
            .as_ref()
            .and_then(|x| x.validate_minimum().ok())
        else {
            return Ok(visible(&lookup, ConflictResolution::PreTransaction));
        };

        if owner.attempt_id == own_attempt_id {
            return Ok(visible(&lookup, ConflictResolution::PostTransaction));
        }

        let entry = atrs
            .find_entry(atr_ref, &owner.attempt_id)
            .await
            .map_err(|e| {
                let err = AttemptError::from(e);
                AttemptError::Operation(triage::assert_not_null(
                    triage::atr_lookup_in_mav(&err),
                    &err,
                ))
            })?;
        let Some(entry) = entry else {
            debug!(
                "{} is staged by attempt {} which has no ATR entry, reading the committed body",
                id, owner.attempt_id
            );
            return Ok(visible(&lookup, ConflictResolution::PreTransaction));
        };
        forward_compat::check(
            entry.forward_compatibility.as_ref(),
            InteractionPoint::GetsReadingAtr,
        )
        .await
        .map_err(|f| AttemptError::Operation(f.into_operation_failed()))?;

        let state = entry.attempt_state().ok();
        let resolution = resolve(
            state,
            seen_pending.as_deref() == Some(owner.attempt_id.as_str()),
        );
        if resolution == ConflictResolution::Reread {
            debug!("{} is staged by pending attempt {}, reading again", id, owner.attempt_id);
            seen_pending = Some(owner.attempt_id.clone());
            continue;
        }
        return Ok(visible(&lookup, resolution));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve(Some(AttemptState::Committed), false),
            ConflictResolution::PostTransaction
        );
        assert_eq!(
            resolve(Some(AttemptState::Completed), true),
            ConflictResolution::PostTransaction
        );
        assert_eq!(resolve(Some(AttemptState::Pending), false), ConflictResolution::Reread);
        assert_eq!(
            resolve(Some(AttemptState::Pending), true),
            ConflictResolution::PreTransaction
        );
        assert_eq!(
            resolve(Some(AttemptState::Aborted), false),
            ConflictResolution::PreTransaction
        );
        assert_eq!(resolve(None, false), ConflictResolution::PreTransaction);
    }
}
