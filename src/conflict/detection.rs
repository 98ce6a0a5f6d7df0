use log::debug;

use crate::data_model::TransactionGetResult;
use crate::errors::{AttemptError, KvError};
use crate::forward_compat::{self, InteractionPoint};
use crate::repository::AtrRepository;

/// Represents the outcome of probing the attempt that staged a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// The document is free to be staged over.
    None,
    /// The document is staged by a live attempt of another transaction.
    WriteWrite {
        /// The blocking attempt.
        attempt_id: String,
        /// Its ATR state at the time of the probe.
        state: String,
    },
}

/// Checks whether `doc` is held by a live attempt of another transaction.
///
/// A document does not conflict when it carries no transaction metadata, was
/// staged by `own_transaction_id`, or its blocking attempt has no ATR entry
/// left, has expired, or reached a terminal state.
pub async fn detect_conflicts(
    atrs: &dyn AtrRepository,
    doc: &TransactionGetResult,
    own_transaction_id: &str,
) -> Result<ConflictType, AttemptError> {
    let Some(xattrs) = doc.transaction_xattrs() else {
        return Ok(ConflictType::None);
    };
    if xattrs.atr_ref.is_none() || xattrs.transaction_id() == Some(own_transaction_id) {
        return Ok(ConflictType::None);
    }
    let (blocking, atr_ref) = xattrs.validate_minimum()?;

    let entry = match atrs.find_entry(atr_ref, &blocking.attempt_id).await {
        Ok(entry) => entry,
        Err(KvError::DocumentNotFound | KvError::PathNotFound) => None,
        Err(e) => return Err(e.into()),
    };
    let Some(entry) = entry else {
        debug!(
            "Blocking attempt {} on {} has no ATR entry, it was cleaned up",
            blocking.attempt_id,
            doc.id()
        );
        return Ok(ConflictType::None);
    };

    forward_compat::check(
        entry.forward_compatibility.as_ref(),
        InteractionPoint::WriteWriteConflictReadingAtr,
    )
    .await
    .map_err(|f| AttemptError::Operation(f.into_operation_failed()))?;

    if entry.is_expired() {
        debug!(
            "Blocking attempt {} on {} has expired ({}ms old)",
            blocking.attempt_id,
            doc.id(),
            entry.age_ms()
        );
        return Ok(ConflictType::None);
    }
    match entry.attempt_state() {
        Ok(state) if state.is_terminal() => Ok(ConflictType::None),
        _ => Ok(ConflictType::WriteWrite {
            attempt_id: blocking.attempt_id.clone(),
            state: entry.state,
        }),
    }
}
