//! Per-call-site disposition tables.
//!
//! Each function takes the failure raised inside one protocol step and
//! returns its class together with the error to surface, if any. `None`
//! means the caller handles the class itself (retry, resolve, or treat as
//! success). Failures that were already triaged further down the stack are
//! passed through untouched.

use crate::errors::{AttemptError, ErrorBuilder, ErrorClass, FinalError, TransactionOperationFailed};

pub(crate) type Triaged = (ErrorClass, Option<TransactionOperationFailed>);

fn already_triaged(err: &AttemptError) -> Option<Triaged> {
    match err {
        AttemptError::Operation(op) => Some((op.class(), Some(op.clone()))),
        _ => None,
    }
}

fn builder(class: ErrorClass, err: &AttemptError) -> ErrorBuilder {
    ErrorBuilder::new(class).cause(err.clone())
}

fn expired(err: &AttemptError) -> TransactionOperationFailed {
    builder(ErrorClass::FailExpiry, err)
        .raise(FinalError::TransactionExpired)
        .build()
}

pub(crate) fn get(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    let to_throw = match ec {
        ErrorClass::FailDocNotFound => return (ec, None),
        ErrorClass::FailHard => builder(ec, err).do_not_rollback_attempt().build(),
        ErrorClass::FailTransient => builder(ec, err).retry_transaction().build(),
        ErrorClass::FailExpiry => expired(err),
        _ => builder(ec, err).build(),
    };
    (ec, Some(to_throw))
}

pub(crate) fn atr_lookup_in_mav(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    let to_throw = match ec {
        ErrorClass::FailDocNotFound => ErrorBuilder::new(ErrorClass::FailOther)
            .cause(AttemptError::AtrNotFound)
            .build(),
        ErrorClass::FailPathNotFound => ErrorBuilder::new(ErrorClass::FailOther)
            .cause(AttemptError::AtrEntryNotFound)
            .build(),
        ErrorClass::FailTransient => builder(ec, err).retry_transaction().build(),
        ErrorClass::FailHard => builder(ec, err).do_not_rollback_attempt().build(),
        ErrorClass::FailExpiry => expired(err),
        _ => builder(ec, err).build(),
    };
    (ec, Some(to_throw))
}

pub(crate) fn create_staged_insert(err: &AttemptError, overtime: bool) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    if overtime {
        let to_throw = builder(ErrorClass::FailExpiry, err)
            .do_not_rollback_attempt()
            .raise(FinalError::TransactionExpired)
            .build();
        return (ErrorClass::FailExpiry, Some(to_throw));
    }
    let ec = err.classify();
    let to_throw = match ec {
        ErrorClass::FailExpiry => expired(err),
        ErrorClass::FailAmbiguous
        | ErrorClass::FailCasMismatch
        | ErrorClass::FailDocAlreadyExists => return (ec, None),
        ErrorClass::FailTransient => builder(ec, err).retry_transaction().build(),
        ErrorClass::FailHard => builder(ec, err).do_not_rollback_attempt().build(),
        _ => builder(ec, err).build(),
    };
    (ec, Some(to_throw))
}

pub(crate) fn doc_exists_on_staged_insert(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    let to_throw = match ec {
        ErrorClass::FailDocNotFound | ErrorClass::FailPathNotFound | ErrorClass::FailTransient => {
            builder(ec, err).retry_transaction().build()
        }
        ErrorClass::FailHard => builder(ec, err).do_not_rollback_attempt().build(),
        ErrorClass::FailExpiry => expired(err),
        _ => builder(ec, err).build(),
    };
    (ec, Some(to_throw))
}

pub(crate) fn create_staged_replace_or_remove(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    let to_throw = match ec {
        ErrorClass::FailExpiry => expired(err),
        ErrorClass::FailDocNotFound
        | ErrorClass::FailCasMismatch
        | ErrorClass::FailTransient
        | ErrorClass::FailAmbiguous => builder(ec, err).retry_transaction().build(),
        ErrorClass::FailHard => builder(ec, err).do_not_rollback_attempt().build(),
        _ => builder(ec, err).build(),
    };
    (ec, Some(to_throw))
}

pub(crate) fn set_atr_pending(err: &AttemptError, overtime: bool) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    if overtime {
        let to_throw = builder(ErrorClass::FailExpiry, err)
            .do_not_rollback_attempt()
            .raise(FinalError::TransactionExpired)
            .build();
        return (ErrorClass::FailExpiry, Some(to_throw));
    }
    let ec = err.classify();
    let to_throw = match ec {
        ErrorClass::FailAmbiguous | ErrorClass::FailPathAlreadyExists => return (ec, None),
        ErrorClass::FailExpiry => expired(err),
        ErrorClass::FailAtrFull => builder(ec, err).build(),
        ErrorClass::FailTransient => builder(ec, err).retry_transaction().build(),
        ErrorClass::FailHard => builder(ec, err).do_not_rollback_attempt().build(),
        _ => builder(ec, err).build(),
    };
    (ec, Some(to_throw))
}

pub(crate) fn set_atr_commit(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    let to_throw = match ec {
        ErrorClass::FailExpiry => expired(err),
        ErrorClass::FailAmbiguous => return (ec, None),
        ErrorClass::FailHard => builder(ec, err).do_not_rollback_attempt().build(),
        ErrorClass::FailTransient => builder(ec, err).retry_transaction().build(),
        _ => builder(ec, err).build(),
    };
    (ec, Some(to_throw))
}

pub(crate) fn set_atr_commit_ambiguity(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    match ec {
        ErrorClass::FailTransient | ErrorClass::FailOther => (ec, None),
        _ => {
            let to_throw = builder(ec, err)
                .do_not_rollback_attempt()
                .raise(FinalError::TransactionCommitAmbiguous)
                .build();
            (ec, Some(to_throw))
        }
    }
}

pub(crate) fn set_atr_complete(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    match ec {
        ErrorClass::FailHard => {
            let to_throw = builder(ec, err)
                .do_not_rollback_attempt()
                .raise(FinalError::TransactionFailedPostCommit)
                .build();
            (ec, Some(to_throw))
        }
        _ => (ec, None),
    }
}

fn failed_post_commit(ec: ErrorClass, err: &AttemptError) -> TransactionOperationFailed {
    builder(ec, err)
        .do_not_rollback_attempt()
        .raise(FinalError::TransactionFailedPostCommit)
        .build()
}

/// Unstaging happens after the commit point: every error it surfaces is a
/// post-commit failure that must not trigger rollback. The caller decides
/// which classes it can still recover from locally.
pub(crate) fn unstage_insert_or_replace(err: &AttemptError, overtime: bool) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    if overtime {
        return (
            ErrorClass::FailExpiry,
            Some(failed_post_commit(ErrorClass::FailExpiry, err)),
        );
    }
    let ec = err.classify();
    (ec, Some(failed_post_commit(ec, err)))
}

pub(crate) fn unstage_remove(err: &AttemptError, overtime: bool) -> Triaged {
    unstage_insert_or_replace(err, overtime)
}

pub(crate) fn set_atr_aborted(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    let to_throw = match ec {
        ErrorClass::FailPathNotFound => ErrorBuilder::new(ec)
            .cause(AttemptError::AtrEntryNotFound)
            .do_not_rollback_attempt()
            .build(),
        ErrorClass::FailDocNotFound => ErrorBuilder::new(ec)
            .cause(AttemptError::AtrNotFound)
            .do_not_rollback_attempt()
            .build(),
        ErrorClass::FailAtrFull | ErrorClass::FailHard => {
            builder(ec, err).do_not_rollback_attempt().build()
        }
        _ => return (ec, None),
    };
    (ec, Some(to_throw))
}

pub(crate) fn set_atr_rolled_back(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    match ec {
        ErrorClass::FailExpiry => (
            ec,
            Some(
                builder(ec, err)
                    .do_not_rollback_attempt()
                    .raise(FinalError::TransactionExpired)
                    .build(),
            ),
        ),
        ErrorClass::FailHard => (ec, Some(builder(ec, err).do_not_rollback_attempt().build())),
        _ => (ec, None),
    }
}

pub(crate) fn rollback_staged_insert(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    match ec {
        ErrorClass::FailCasMismatch | ErrorClass::FailHard => {
            (ec, Some(builder(ec, err).do_not_rollback_attempt().build()))
        }
        _ => (ec, None),
    }
}

pub(crate) fn rollback_staged_replace_or_remove(err: &AttemptError) -> Triaged {
    if let Some(t) = already_triaged(err) {
        return t;
    }
    let ec = err.classify();
    match ec {
        ErrorClass::FailDocNotFound | ErrorClass::FailCasMismatch | ErrorClass::FailHard => {
            (ec, Some(builder(ec, err).do_not_rollback_attempt().build()))
        }
        _ => (ec, None),
    }
}

/// Builds the compound failure raised when commit is attempted while earlier
/// operations of the attempt failed. Retry and rollback are granted only if
/// every prior failure grants them.
pub(crate) fn commit_with_previous_errors(
    previous: Vec<TransactionOperationFailed>,
) -> TransactionOperationFailed {
    let retry = previous.iter().all(|e| e.retry_transaction());
    let rollback = previous.iter().all(|e| e.auto_rollback());
    let mut b = ErrorBuilder::new(ErrorClass::FailOther)
        .cause(AttemptError::PreviousOperationFailed(previous));
    if retry {
        b = b.retry_transaction();
    }
    if !rollback {
        b = b.do_not_rollback_attempt();
    }
    b.build()
}

/// Converts a `None` disposition into an error for call sites that have no
/// local handling left for the class.
pub(crate) fn assert_not_null(triaged: Triaged, err: &AttemptError) -> TransactionOperationFailed {
    match triaged {
        (_, Some(to_throw)) => to_throw,
        (ec, None) => builder(ec, err).build(),
    }
}
