use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use atrium::{KvError, PerTransactionConfig, TransactionConfig, Transactions};

mod common;
use common::{BUCKET, FaultInjector, MockCluster, doc_id, eventually};

fn lost_cleanup_config() -> TransactionConfig {
    TransactionConfig::builder()
        .expiration_time(Duration::from_millis(200))
        .cleanup_window(Duration::from_millis(500))
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(true)
        .build()
}

/// A cluster with lost-transaction cleanup running against it.
fn setup_lost_cleanup() -> (Arc<MockCluster>, Arc<FaultInjector>, Transactions) {
    let cluster = Arc::new(MockCluster::new());
    let hooks = Arc::new(FaultInjector::default());
    let transactions = Transactions::builder(lost_cleanup_config(), cluster.clone(), cluster.clone())
        .test_hooks(hooks.clone())
        .lost_transaction_cleanup(cluster.clone(), cluster.clone())
        .build();
    (cluster, hooks, transactions)
}

#[tokio::test]
async fn test_abandoned_attempt_is_rolled_back() {
    let (cluster, _hooks, transactions) = setup_lost_cleanup();

    // Stage an insert, then walk away without committing or rolling back.
    let attempt_id = {
        let transaction = transactions.new_transaction_context(&PerTransactionConfig::default());
        let attempt = transactions.new_attempt(&transaction);
        attempt.insert(&doc_id("b"), json!({"k": 1})).await.unwrap();
        attempt.attempt_id().to_string()
    };
    assert!(cluster.atr_entry(&attempt_id).is_some());

    let cleaned = eventually(Duration::from_secs(10), || {
        cluster.atr_entry(&attempt_id).is_none()
    })
    .await;
    assert!(cleaned, "lost attempt {attempt_id} was never cleaned up");
    assert_eq!(cluster.body("b"), None);
    // The pending entry named no documents, so the staged tombstone keeps its
    // metadata; with the entry gone it no longer belongs to a live attempt.
    assert!(cluster.stored("b").is_some_and(|d| d.deleted));
    assert!(cluster.has_txn_metadata("b"));

    // Nothing of the abandoned insert is visible to a later transaction.
    let reader = transactions.new_attempt(
        &transactions.new_transaction_context(&PerTransactionConfig {
            expiration_time: Some(Duration::from_secs(5)),
            ..Default::default()
        }),
    );
    assert!(reader.get_optional(&doc_id("b")).await.unwrap().is_none());

    transactions.shutdown().await;
}

#[tokio::test]
async fn test_committed_attempt_is_unstaged() {
    let (cluster, hooks, transactions) = setup_lost_cleanup();
    hooks.fail_once("before_doc_committed", KvError::Hard("disk".into()));

    let result = transactions
        .run(|ctx| async move {
            ctx.insert(&doc_id("c"), json!({"k": 2})).await?;
            Ok(())
        })
        .await
        .unwrap();
    assert!(!result.unstaging_complete);
    assert_eq!(cluster.body("c"), None);

    let unstaged = eventually(Duration::from_secs(10), || {
        cluster.body("c") == Some(json!({"k": 2}))
    })
    .await;
    assert!(unstaged, "committed attempt was never unstaged");
    assert!(!cluster.has_txn_metadata("c"));
    let attempt_id = &result.attempts[0].attempt_id;
    assert!(
        eventually(Duration::from_secs(2), || cluster.atr_entry(attempt_id).is_none()).await
    );

    transactions.shutdown().await;
}

#[tokio::test]
async fn test_client_record_lifecycle() {
    let (cluster, _hooks, transactions) = setup_lost_cleanup();
    let manager = transactions.lost_transaction_manager().unwrap();

    assert!(
        eventually(Duration::from_secs(2), || {
            manager.discovered_bucket_count() == 1 && cluster.client_count(BUCKET) == 1
        })
        .await
    );
    assert_eq!(manager.running_count(), 1);
    assert!(eventually(Duration::from_secs(5), || manager.total_run_count() > 0).await);

    // Stopping deregisters the client from every bucket it swept.
    transactions.shutdown().await;
    assert_eq!(manager.running_count(), 0);
    assert_eq!(cluster.client_count(BUCKET), 0);
}

#[tokio::test]
async fn test_lost_cleanup_disabled() {
    let cluster = Arc::new(MockCluster::new());
    let config = TransactionConfig::builder()
        .cleanup_lost_attempts(false)
        .cleanup_client_attempts(false)
        .build();
    let transactions = Transactions::builder(config, cluster.clone(), cluster.clone())
        .lost_transaction_cleanup(cluster.clone(), cluster.clone())
        .build();

    assert!(transactions.lost_transaction_manager().is_none());
    assert!(transactions.cleanup_queue().is_none());
}
