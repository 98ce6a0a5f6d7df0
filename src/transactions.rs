use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::attempt::{AttemptContext, Collaborators};
use crate::cleanup::{
    Cleaner, CleanerRepository, CleanupWorkQueue, ClusterTopology, LostCleanupConfig,
    LostTransactionManager,
};
use crate::config::{PerTransactionConfig, TransactionConfig};
use crate::data_model::{AtrRef, AttemptState, DocId};
use crate::errors::{FinalError, TransactionError, TransactionOperationFailed};
use crate::hooks::{DefaultTestHooks, TestHooks};
use crate::query::QueryEngine;
use crate::repository::{AtrRepository, DocumentRepository, MutationToken};
use crate::retry::{RepeatAction, RetryLoop};

/// Atrium prelude
pub mod prelude {
    pub use crate::attempt::*;
    pub use crate::cleanup::*;
    pub use crate::config::*;
    pub use crate::data_model::*;
    pub use crate::errors::*;
    pub use crate::hooks::*;
    pub use crate::query::*;
    pub use crate::repository::*;
    pub use crate::transactions::*;
}

/// State shared by every attempt of one transaction.
#[derive(Debug)]
pub struct TransactionContext {
    transaction_id: String,
    started: Instant,
    /// Configuration after per-transaction overrides.
    config: TransactionConfig,
    attempts: Mutex<Vec<TransactionAttempt>>,
}

impl TransactionContext {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            config,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the transaction expires, zero once it has.
    pub fn remaining(&self) -> Duration {
        self.config
            .expiration_time
            .saturating_sub(self.started.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() > self.config.expiration_time
    }

    pub fn attempts(&self) -> Vec<TransactionAttempt> {
        self.attempts.lock().clone()
    }

    fn add_attempt(&self, attempt: TransactionAttempt) {
        self.attempts.lock().push(attempt);
    }
}

/// Summary of one finished attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionAttempt {
    pub attempt_id: String,
    pub atr_ref: Option<AtrRef>,
    pub final_state: AttemptState,
    pub staged_insert_ids: Vec<DocId>,
    pub staged_replace_ids: Vec<DocId>,
    pub staged_remove_ids: Vec<DocId>,
    /// Tokens of the latest staging write of each document.
    pub staged_mutation_tokens: Vec<MutationToken>,
    /// Tokens of the unstaged writes, for read-your-writes consistency.
    pub mutation_tokens: Vec<MutationToken>,
    pub time_taken: Duration,
}

/// Outcome of a transaction that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    pub transaction_id: String,
    /// False when the transaction committed but some staged changes are yet
    /// to be made visible by cleanup.
    pub unstaging_complete: bool,
    pub attempts: Vec<TransactionAttempt>,
}

/// The main entry point: runs transaction logic against a document store.
///
/// Must be built inside a Tokio runtime when cleanup is enabled, as the
/// cleanup workers are spawned on it.
pub struct Transactions {
    config: TransactionConfig,
    collaborators: Collaborators,
    /// Finishes attempts of this client that left work behind.
    cleanup_queue: Option<CleanupWorkQueue>,
    /// Finds and finishes attempts of crashed clients.
    lost_manager: Option<LostTransactionManager>,
}

impl Transactions {
    /// Creates an instance with the default hooks and no query support.
    pub fn new(
        config: TransactionConfig,
        docs: Arc<dyn DocumentRepository>,
        atrs: Arc<dyn AtrRepository>,
    ) -> Self {
        Self::builder(config, docs, atrs).build()
    }

    pub fn builder(
        config: TransactionConfig,
        docs: Arc<dyn DocumentRepository>,
        atrs: Arc<dyn AtrRepository>,
    ) -> TransactionsBuilder {
        TransactionsBuilder {
            config,
            docs,
            atrs,
            query: None,
            hooks: Arc::new(DefaultTestHooks),
            lost: None,
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn cleanup_queue(&self) -> Option<&CleanupWorkQueue> {
        self.cleanup_queue.as_ref()
    }

    pub fn lost_transaction_manager(&self) -> Option<&LostTransactionManager> {
        self.lost_manager.as_ref()
    }

    /// Starts a transaction without running it, for callers that drive
    /// attempts themselves.
    pub fn new_transaction_context(&self, per: &PerTransactionConfig) -> Arc<TransactionContext> {
        Arc::new(TransactionContext::new(per.apply(&self.config)))
    }

    pub fn new_attempt(&self, transaction: &Arc<TransactionContext>) -> Arc<AttemptContext> {
        Arc::new(AttemptContext::new(
            Arc::clone(transaction),
            transaction.config().clone(),
            self.collaborators.clone(),
        ))
    }

    /// Runs `logic` as a transaction with the default configuration.
    ///
    /// `logic` may be called several times, once per attempt, and should have
    /// no side effects outside the [`AttemptContext`] it is given. If it
    /// returns without committing or rolling back, the attempt is committed.
    pub async fn run<F, Fut>(&self, logic: F) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(Arc<AttemptContext>) -> Fut,
        Fut: Future<Output = crate::errors::Result<()>>,
    {
        self.run_with(&PerTransactionConfig::default(), logic).await
    }

    pub async fn run_with<F, Fut>(
        &self,
        per: &PerTransactionConfig,
        logic: F,
    ) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(Arc<AttemptContext>) -> Fut,
        Fut: Future<Output = crate::errors::Result<()>>,
    {
        let transaction = self.new_transaction_context(per);
        let mut backoff = RetryLoop::new("run");
        loop {
            let attempt = self.new_attempt(&transaction);
            let outcome = match logic(Arc::clone(&attempt)).await {
                Ok(()) => attempt.auto_commit().await,
                Err(err) => Err(err),
            };

            let err = match outcome {
                Ok(()) => {
                    self.finish_attempt(&transaction, &attempt);
                    debug!(
                        "Transaction {} finished after {} attempt(s)",
                        transaction.transaction_id(),
                        transaction.attempts().len()
                    );
                    return Ok(self.result(&transaction, attempt.unstaging_complete()));
                }
                Err(err) => err,
            };

            info!(
                "Attempt {} of transaction {} failed: {}",
                attempt.attempt_id(),
                transaction.transaction_id(),
                err
            );
            if err.auto_rollback() {
                if let Err(rollback_err) = attempt.rollback_internal(false).await {
                    warn!(
                        "Attempt {} could not be rolled back, leaving it to cleanup: {}",
                        attempt.attempt_id(),
                        rollback_err
                    );
                }
            }
            self.finish_attempt(&transaction, &attempt);

            if err.retry_transaction() && !transaction.is_expired() {
                if backoff.next_iteration().is_err() {
                    return Err(self.final_error(&transaction, &attempt, err));
                }
                backoff.pause(RepeatAction::RepeatWithBackoff).await;
                continue;
            }
            if err.retry_transaction() {
                let result = self.result(&transaction, attempt.unstaging_complete());
                return Err(TransactionError::Expired { cause: err, result });
            }
            return match err.to_raise() {
                FinalError::TransactionFailedPostCommit => {
                    warn!(
                        "Transaction {} committed but some changes are left to cleanup: {}",
                        transaction.transaction_id(),
                        err
                    );
                    Ok(self.result(&transaction, false))
                }
                _ => Err(self.final_error(&transaction, &attempt, err)),
            };
        }
    }

    /// Stops the cleanup workers, waiting for in-flight work.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.cleanup_queue {
            queue.shutdown().await;
        }
        if let Some(lost) = &self.lost_manager {
            lost.shutdown().await;
        }
    }

    fn finish_attempt(&self, transaction: &TransactionContext, attempt: &AttemptContext) {
        transaction.add_attempt(attempt.to_attempt_summary());
        if !self.config.cleanup_client_attempts {
            return;
        }
        if let (Some(queue), Some(request)) = (&self.cleanup_queue, attempt.get_cleanup_request()) {
            debug!(
                "Queueing cleanup of attempt {} ({})",
                request.attempt_id, request.state
            );
            queue.add(request);
        }
    }

    fn result(&self, transaction: &TransactionContext, unstaging_complete: bool) -> TransactionResult {
        TransactionResult {
            transaction_id: transaction.transaction_id().to_string(),
            unstaging_complete,
            attempts: transaction.attempts(),
        }
    }

    fn final_error(
        &self,
        transaction: &TransactionContext,
        attempt: &AttemptContext,
        cause: TransactionOperationFailed,
    ) -> TransactionError {
        let result = self.result(transaction, attempt.unstaging_complete());
        match cause.to_raise() {
            FinalError::TransactionExpired => TransactionError::Expired { cause, result },
            FinalError::TransactionCommitAmbiguous => {
                TransactionError::CommitAmbiguous { cause, result }
            }
            FinalError::TransactionFailed | FinalError::TransactionFailedPostCommit => {
                TransactionError::Failed { cause, result }
            }
        }
    }
}

pub struct TransactionsBuilder {
    config: TransactionConfig,
    docs: Arc<dyn DocumentRepository>,
    atrs: Arc<dyn AtrRepository>,
    query: Option<Arc<dyn QueryEngine>>,
    hooks: Arc<dyn TestHooks>,
    lost: Option<(Arc<dyn ClusterTopology>, Arc<dyn CleanerRepository>)>,
}

impl TransactionsBuilder {
    pub fn query_engine(mut self, engine: Arc<dyn QueryEngine>) -> Self {
        self.query = Some(engine);
        self
    }

    pub fn test_hooks(mut self, hooks: Arc<dyn TestHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Enables lost-transaction cleanup over the buckets `topology` reports.
    /// Only takes effect when `cleanup_lost_attempts` is configured.
    pub fn lost_transaction_cleanup(
        mut self,
        topology: Arc<dyn ClusterTopology>,
        client_records: Arc<dyn CleanerRepository>,
    ) -> Self {
        self.lost = Some((topology, client_records));
        self
    }

    pub fn build(self) -> Transactions {
        let cleaner = Arc::new(Cleaner::new(
            Arc::clone(&self.docs),
            Arc::clone(&self.atrs),
        ));
        let cleanup_queue = self
            .config
            .cleanup_client_attempts
            .then(|| CleanupWorkQueue::start(Arc::clone(&cleaner)));
        let lost_manager = match self.lost {
            Some((topology, client_records)) if self.config.cleanup_lost_attempts => {
                Some(LostTransactionManager::start(
                    topology,
                    client_records,
                    Arc::clone(&self.atrs),
                    cleaner,
                    LostCleanupConfig::from(&self.config),
                ))
            }
            _ => None,
        };
        Transactions {
            config: self.config,
            collaborators: Collaborators {
                docs: self.docs,
                atrs: self.atrs,
                query: self.query,
                hooks: self.hooks,
            },
            cleanup_queue,
            lost_manager,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_budget() {
        let ctx = TransactionContext::new(
            TransactionConfig::builder()
                .expiration_time(Duration::from_secs(60))
                .build(),
        );
        assert!(!ctx.is_expired());
        assert!(ctx.remaining() <= Duration::from_secs(60));
        assert!(ctx.remaining() > Duration::from_secs(59));

        let ctx = TransactionContext::new(
            TransactionConfig::builder()
                .expiration_time(Duration::ZERO)
                .build(),
        );
        std::thread::sleep(Duration::from_millis(2));
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = TransactionContext::new(TransactionConfig::default());
        let b = TransactionContext::new(TransactionConfig::default());
        assert_ne!(a.transaction_id(), b.transaction_id());
    }
}
