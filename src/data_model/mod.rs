//! Identities and metadata shapes shared by documents, ATRs and attempts.
pub mod atr_entry;
pub mod get_result;
pub mod ids;
pub mod xattrs;

pub use atr_entry::{AtrEntry, AttemptState, DocRecord};
pub use get_result::{DocumentLookupResult, TransactionGetResult};
pub use ids::{AtrRef, CompositeId, DocId, Keyspace};
pub use xattrs::{
    DocumentMetadata, STAGED_REMOVE_SENTINEL, StagedOperation, StagedOperationType,
    TransactionXattrs,
};
