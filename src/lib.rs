//! Client-side multi-document ACID transactions over a CAS key-value store.
//!
//! Changes are staged as transaction metadata next to each document and made
//! visible only once the attempt's entry in an Active Transaction Record
//! (ATR) says it committed. Readers resolve staged documents through that
//! entry, and background cleanup finishes attempts whose client went away.
//!
//! ```ignore
//! let transactions = Transactions::new(config, docs, atrs);
//! let result = transactions
//!     .run(|ctx| async move {
//!         let doc = ctx.get(&id).await?;
//!         ctx.replace(&doc, json!({"balance": 10})).await?;
//!         Ok(())
//!     })
//!     .await?;
//! ```
pub mod errors;
pub mod triage;
pub mod retry;
pub mod forward_compat;
pub mod data_model;
pub mod atr_ids;
pub mod config;
pub mod ledger;
pub mod repository;
pub mod query;
pub mod hooks;
pub mod conflict;
pub mod attempt;
pub mod cleanup;
pub mod transactions;

// Re-export key types and structs for easier access
pub use attempt::AttemptContext;
pub use cleanup::{Cleaner, CleanupRequest, CleanupWorkQueue, LostTransactionManager};
pub use config::{DurabilityLevel, PerTransactionConfig, QueryScanConsistency, TransactionConfig};
pub use data_model::{AtrRef, AttemptState, DocId, Keyspace, TransactionGetResult};
pub use errors::{
    AttemptError, ErrorBuilder, ErrorClass, FinalError, KvError, Result, TransactionError,
    TransactionOperationFailed,
};
pub use hooks::{DefaultTestHooks, TestHooks};
pub use query::{QueryEngine, QueryOptions, QueryResult};
pub use repository::{AtrRepository, DocumentRepository};
pub use transactions::{
    TransactionAttempt, TransactionContext, TransactionResult, Transactions, TransactionsBuilder,
};
