use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::forward_compat::ForwardCompatibilityFailure;
use crate::query::QueryError;
use crate::transactions::TransactionResult;

/// The closed set of classes every underlying failure is mapped onto.
///
/// Classification happens exactly once per failure; call sites then decide
/// what a class means for them (see [`crate::triage`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    FailDocNotFound,
    FailDocAlreadyExists,
    FailCasMismatch,
    FailPathNotFound,
    FailPathAlreadyExists,
    /// Retryable infrastructure hiccup.
    FailTransient,
    /// The server outcome is unknown.
    FailAmbiguous,
    /// Non-retryable storage fault.
    FailHard,
    FailExpiry,
    /// The shard's ATR has no free slot.
    FailAtrFull,
    FailWriteWriteConflict,
    FailOther,
}

/// The terminal error category a failed attempt should surface as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalError {
    TransactionFailed,
    TransactionExpired,
    TransactionCommitAmbiguous,
    TransactionFailedPostCommit,
}

/// Failures reported by the storage and query collaborators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KvError {
    #[error("document not found")]
    DocumentNotFound,

    #[error("document already exists")]
    DocumentExists,

    #[error("CAS mismatch")]
    CasMismatch,

    #[error("sub-document path not found")]
    PathNotFound,

    #[error("sub-document path already exists")]
    PathExists,

    #[error("value too large")]
    ValueTooLarge,

    #[error("temporary failure: {0}")]
    Temporary(String),

    #[error("operation timed out")]
    Timeout,

    #[error("ambiguous outcome: {0}")]
    Ambiguous(String),

    #[error("hard failure: {0}")]
    Hard(String),

    #[error("feature not available: {0}")]
    FeatureNotAvailable(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("{0}")]
    Other(String),
}

impl KvError {
    /// Maps a collaborator failure onto its [`ErrorClass`].
    pub fn classify(&self) -> ErrorClass {
        match self {
            KvError::DocumentNotFound => ErrorClass::FailDocNotFound,
            KvError::DocumentExists => ErrorClass::FailDocAlreadyExists,
            KvError::CasMismatch => ErrorClass::FailCasMismatch,
            KvError::PathNotFound => ErrorClass::FailPathNotFound,
            KvError::PathExists => ErrorClass::FailPathAlreadyExists,
            KvError::ValueTooLarge => ErrorClass::FailAtrFull,
            KvError::Temporary(_) | KvError::Timeout => ErrorClass::FailTransient,
            KvError::Ambiguous(_) => ErrorClass::FailAmbiguous,
            KvError::Hard(_) => ErrorClass::FailHard,
            KvError::FeatureNotAvailable(_) | KvError::Query(_) | KvError::Other(_) => {
                ErrorClass::FailOther
            }
        }
    }
}

/// Everything that can go wrong inside a single protocol step of an attempt.
#[derive(Error, Debug, Clone)]
pub enum AttemptError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("attempt {attempt_id} expired in stage {stage}")]
    Expired { attempt_id: String, stage: String },

    #[error("active transaction record not found")]
    AtrNotFound,

    #[error("active transaction record entry not found")]
    AtrEntryNotFound,

    #[error("transaction was aborted or rolled back by another actor")]
    AbortedExternally,

    #[error("{} previous operation(s) failed in this attempt", .0.len())]
    PreviousOperationFailed(Vec<TransactionOperationFailed>),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    ForwardCompatibility(#[from] ForwardCompatibilityFailure),

    #[error("attempt is not known to the query service")]
    AttemptNotFoundOnQuery,

    #[error("retry limit ({limit}) exceeded in {caller}")]
    RetryLimitExceeded { limit: u32, caller: &'static str },

    #[error("operation failed with {0:?}")]
    Classified(ErrorClass),

    #[error(transparent)]
    Operation(#[from] TransactionOperationFailed),
}

impl AttemptError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            AttemptError::Kv(kv) => kv.classify(),
            AttemptError::Expired { .. } => ErrorClass::FailExpiry,
            AttemptError::Classified(class) => *class,
            AttemptError::Operation(op) => op.class(),
            AttemptError::AtrNotFound
            | AttemptError::AtrEntryNotFound
            | AttemptError::AbortedExternally
            | AttemptError::PreviousOperationFailed(_)
            | AttemptError::IllegalState(_)
            | AttemptError::ForwardCompatibility(_)
            | AttemptError::AttemptNotFoundOnQuery
            | AttemptError::RetryLimitExceeded { .. } => ErrorClass::FailOther,
        }
    }

    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        AttemptError::IllegalState(message.into())
    }
}

static ERROR_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// The single wrapped error returned by attempt operations.
///
/// Carries the class of the failure that caused it, the cause itself and the
/// decision taken by triage: whether the whole transaction may be retried,
/// whether the attempt should be rolled back, and which terminal error the
/// transaction should surface if it gives up.
#[derive(Error, Debug, Clone)]
#[error("transaction operation failed ({class:?}): {cause}")]
pub struct TransactionOperationFailed {
    sequence: u64,
    class: ErrorClass,
    #[source]
    cause: Arc<AttemptError>,
    retry_transaction: bool,
    auto_rollback: bool,
    to_raise: FinalError,
}

impl TransactionOperationFailed {
    /// Monotonically increasing number assigned when the error was built.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn cause(&self) -> &AttemptError {
        &self.cause
    }

    pub fn retry_transaction(&self) -> bool {
        self.retry_transaction
    }

    pub fn auto_rollback(&self) -> bool {
        self.auto_rollback
    }

    pub fn to_raise(&self) -> FinalError {
        self.to_raise
    }
}

/// Fluent builder for [`TransactionOperationFailed`].
///
/// Defaults: no whole-transaction retry, roll the attempt back, raise
/// [`FinalError::TransactionFailed`].
#[derive(Debug)]
pub struct ErrorBuilder {
    class: ErrorClass,
    cause: Option<AttemptError>,
    retry_transaction: bool,
    auto_rollback: bool,
    to_raise: FinalError,
}

impl ErrorBuilder {
    pub fn new(class: ErrorClass) -> Self {
        Self {
            class,
            cause: None,
            retry_transaction: false,
            auto_rollback: true,
            to_raise: FinalError::TransactionFailed,
        }
    }

    pub fn cause(mut self, cause: impl Into<AttemptError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn retry_transaction(mut self) -> Self {
        self.retry_transaction = true;
        self
    }

    pub fn do_not_rollback_attempt(mut self) -> Self {
        self.auto_rollback = false;
        self
    }

    pub fn raise(mut self, to_raise: FinalError) -> Self {
        self.to_raise = to_raise;
        self
    }

    pub fn build(self) -> TransactionOperationFailed {
        let cause = self
            .cause
            .unwrap_or(AttemptError::Classified(self.class));
        TransactionOperationFailed {
            sequence: ERROR_SEQUENCE.fetch_add(1, Ordering::SeqCst),
            class: self.class,
            cause: Arc::new(cause),
            retry_transaction: self.retry_transaction,
            auto_rollback: self.auto_rollback,
            to_raise: self.to_raise,
        }
    }
}

/// Terminal outcome of a transaction that did not succeed.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {} failed: {cause}", .result.transaction_id)]
    Failed {
        cause: TransactionOperationFailed,
        result: TransactionResult,
    },

    #[error("transaction {} expired: {cause}", .result.transaction_id)]
    Expired {
        cause: TransactionOperationFailed,
        result: TransactionResult,
    },

    #[error("transaction {} may or may not have committed: {cause}", .result.transaction_id)]
    CommitAmbiguous {
        cause: TransactionOperationFailed,
        result: TransactionResult,
    },
}

impl TransactionError {
    pub fn cause(&self) -> &TransactionOperationFailed {
        match self {
            TransactionError::Failed { cause, .. }
            | TransactionError::Expired { cause, .. }
            | TransactionError::CommitAmbiguous { cause, .. } => cause,
        }
    }

    pub fn result(&self) -> &TransactionResult {
        match self {
            TransactionError::Failed { result, .. }
            | TransactionError::Expired { result, .. }
            | TransactionError::CommitAmbiguous { result, .. } => result,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransactionOperationFailed>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let err = ErrorBuilder::new(ErrorClass::FailOther).build();
        assert!(!err.retry_transaction());
        assert!(err.auto_rollback());
        assert_eq!(err.to_raise(), FinalError::TransactionFailed);
        assert!(matches!(
            err.cause(),
            AttemptError::Classified(ErrorClass::FailOther)
        ));
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let a = ErrorBuilder::new(ErrorClass::FailHard).build();
        let b = ErrorBuilder::new(ErrorClass::FailHard).build();
        assert!(b.sequence() > a.sequence());
    }

    #[test]
    fn test_classify_kv_errors() {
        assert_eq!(KvError::ValueTooLarge.classify(), ErrorClass::FailAtrFull);
        assert_eq!(KvError::Timeout.classify(), ErrorClass::FailTransient);
        assert_eq!(
            KvError::Ambiguous("durability".into()).classify(),
            ErrorClass::FailAmbiguous
        );
        assert_eq!(
            AttemptError::Expired {
                attempt_id: "a".into(),
                stage: "get".into()
            }
            .classify(),
            ErrorClass::FailExpiry
        );
    }

    #[test]
    fn test_wrapped_operation_keeps_class() {
        let op = ErrorBuilder::new(ErrorClass::FailWriteWriteConflict)
            .retry_transaction()
            .build();
        let wrapped = AttemptError::from(op);
        assert_eq!(wrapped.classify(), ErrorClass::FailWriteWriteConflict);
    }
}
