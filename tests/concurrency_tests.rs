use std::time::Duration;

use serde_json::{Value, json};

use atrium::data_model::StagedOperationType;
use atrium::{ErrorClass, PerTransactionConfig, TransactionGetResult, Transactions};

mod common;
use common::{doc_id, setup, test_config};

fn counter(doc: &TransactionGetResult) -> i64 {
    doc.content()
        .and_then(|c| c.get("v"))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

async fn increment_ten_times(transactions: &Transactions) {
    for _ in 0..10 {
        transactions
            .run(|ctx| async move {
                let id = doc_id("counter");
                let doc = ctx.get(&id).await?;
                let next = counter(&doc) + 1;
                ctx.replace(&doc, json!({"v": next})).await?;
                Ok(())
            })
            .await
            .unwrap();
    }
}

/// What a fresh transaction reads at `key`.
async fn read_in_new_transaction(transactions: &Transactions, key: &str) -> Option<Value> {
    let attempt = transactions.new_attempt(
        &transactions.new_transaction_context(&PerTransactionConfig::default()),
    );
    attempt
        .get_optional(&doc_id(key))
        .await
        .unwrap()
        .and_then(|doc| doc.content().cloned())
}

async fn replace_with_two(transactions: &Transactions, key: &'static str) -> usize {
    let result = transactions
        .run(|ctx| async move {
            let doc = ctx.get(&doc_id(key)).await?;
            ctx.replace(&doc, json!({"v": 2})).await?;
            Ok(())
        })
        .await
        .unwrap();
    result.attempts.len()
}

async fn insert_owned(transactions: &Transactions, key: &'static str) -> u64 {
    let result = transactions
        .run(|ctx| async move {
            ctx.insert(&doc_id(key), json!({"owner": key})).await?;
            Ok(())
        })
        .await
        .unwrap();
    result.attempts.len() as u64
}

#[tokio::test]
async fn test_write_write_conflict_retries_until_blocker_commits() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("x", json!({"v": 1}));

    // Attempt A stages a replace and holds it.
    let blocker = transactions.new_attempt(
        &transactions.new_transaction_context(&PerTransactionConfig::default()),
    );
    let doc = blocker.get(&doc_id("x")).await.unwrap();
    blocker.replace(&doc, json!({"v": 10})).await.unwrap();

    let commit_blocker = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        blocker.commit().await
    };
    let increment = transactions.run(|ctx| async move {
        let id = doc_id("x");
        let doc = ctx.get(&id).await?;
        let next = counter(&doc) + 1;
        ctx.replace(&doc, json!({"v": next})).await?;
        Ok(())
    });

    let (committed, result) = tokio::join!(commit_blocker, increment);
    committed.unwrap();
    let result = result.unwrap();

    // The incrementing transaction only succeeded on top of A's value.
    assert!(result.attempts.len() > 1);
    assert_eq!(cluster.body("x"), Some(json!({"v": 11})));
    assert!(!cluster.has_txn_metadata("x"));
}

#[tokio::test]
async fn test_concurrent_increments_are_serialized() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("counter", json!({"v": 0}));

    tokio::join!(
        increment_ten_times(&transactions),
        increment_ten_times(&transactions)
    );

    assert_eq!(cluster.body("counter"), Some(json!({"v": 20})));
    assert!(!cluster.has_txn_metadata("counter"));
}

#[tokio::test]
async fn test_disjoint_transactions_do_not_conflict() {
    let (cluster, transactions) = setup(test_config());

    let (a, b) = tokio::join!(
        insert_owned(&transactions, "left"),
        insert_owned(&transactions, "right")
    );
    assert_eq!((a, b), (1, 1));
    assert_eq!(cluster.body("left"), Some(json!({"owner": "left"})));
    assert_eq!(cluster.body("right"), Some(json!({"owner": "right"})));
}

#[tokio::test]
async fn test_write_write_conflict_waits_for_blocker_after_grace() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("x", json!({"v": 1}));

    let blocker = transactions.new_attempt(
        &transactions.new_transaction_context(&PerTransactionConfig::default()),
    );
    let doc = blocker.get(&doc_id("x")).await.unwrap();
    blocker.replace(&doc, json!({"v": 10})).await.unwrap();

    let commit_blocker = async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        blocker.commit().await
    };
    let increment = transactions.run(|ctx| async move {
        let id = doc_id("x");
        let doc = ctx.get(&id).await?;
        let next = counter(&doc) + 1;
        if next == 2 {
            // Outlast the fail-fast window while the blocker still holds x.
            tokio::time::sleep(Duration::from_millis(1100)).await;
        }
        ctx.replace(&doc, json!({"v": next})).await?;
        Ok(())
    });

    let (committed, result) = tokio::join!(commit_blocker, increment);
    committed.unwrap();
    let result = result.unwrap();

    // The first attempt waited on the blocker instead of failing at once, then
    // lost the CAS race to its commit and was retried on top of it.
    assert_eq!(result.attempts.len(), 2);
    assert!(result.attempts[0].time_taken >= Duration::from_millis(1400));
    assert_eq!(cluster.body("x"), Some(json!({"v": 11})));
    assert!(!cluster.has_txn_metadata("x"));
}

#[tokio::test]
async fn test_write_proceeds_when_blocker_entry_is_gone() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("x", json!({"v": 1}));
    let blocker = cluster.stage_foreign(
        "x",
        StagedOperationType::Replace,
        Some(json!({"v": 10})),
        Some("pending"),
    );
    cluster.drop_atr_entry(&blocker);

    assert_eq!(replace_with_two(&transactions, "x").await, 1);
    assert_eq!(cluster.body("x"), Some(json!({"v": 2})));
    assert!(!cluster.has_txn_metadata("x"));
}

#[tokio::test]
async fn test_write_proceeds_when_blocker_entry_expired() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("x", json!({"v": 1}));
    let blocker = cluster.stage_foreign(
        "x",
        StagedOperationType::Replace,
        Some(json!({"v": 10})),
        Some("pending"),
    );
    cluster.expire_atr_entry(&blocker);

    assert_eq!(replace_with_two(&transactions, "x").await, 1);
    assert_eq!(cluster.body("x"), Some(json!({"v": 2})));
}

#[tokio::test]
async fn test_read_of_doc_staged_without_atr_entry() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("x", json!({"v": 1}));
    cluster.stage_foreign("x", StagedOperationType::Replace, Some(json!({"v": 5})), None);

    assert_eq!(read_in_new_transaction(&transactions, "x").await, Some(json!({"v": 1})));
}

#[tokio::test]
async fn test_read_of_committed_but_not_unstaged_doc() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("x", json!({"v": 1}));
    cluster.upsert("y", json!({"v": 1}));
    cluster.stage_foreign(
        "x",
        StagedOperationType::Replace,
        Some(json!({"v": 5})),
        Some("committed"),
    );
    cluster.stage_foreign("y", StagedOperationType::Remove, None, Some("committed"));

    assert_eq!(read_in_new_transaction(&transactions, "x").await, Some(json!({"v": 5})));
    assert_eq!(read_in_new_transaction(&transactions, "y").await, None);
    // Nothing was unstaged by reading.
    assert_eq!(cluster.body("x"), Some(json!({"v": 1})));
    assert_eq!(cluster.body("y"), Some(json!({"v": 1})));
}

#[tokio::test]
async fn test_read_of_uncommitted_doc_returns_committed_content() {
    let (cluster, transactions) = setup(test_config());
    for (key, state) in [("p", "pending"), ("a", "aborted")] {
        cluster.upsert(key, json!({"v": 1}));
        cluster.stage_foreign(key, StagedOperationType::Replace, Some(json!({"v": 5})), Some(state));
        assert_eq!(
            read_in_new_transaction(&transactions, key).await,
            Some(json!({"v": 1})),
            "{state} change leaked"
        );
    }

    cluster.stage_foreign("i", StagedOperationType::Insert, Some(json!({"v": 5})), Some("pending"));
    assert_eq!(read_in_new_transaction(&transactions, "i").await, None);
}

#[tokio::test]
async fn test_insert_over_abandoned_staged_insert() {
    let (cluster, transactions) = setup(test_config());
    cluster.stage_foreign("n", StagedOperationType::Insert, Some(json!({"v": 5})), None);

    let attempts = insert_owned(&transactions, "n").await;
    assert_eq!(attempts, 1);
    assert_eq!(cluster.body("n"), Some(json!({"owner": "n"})));
    assert!(!cluster.has_txn_metadata("n"));
}

#[tokio::test]
async fn test_insert_retries_while_foreign_insert_is_pending() {
    let (cluster, transactions) = setup(test_config());
    let blocker = cluster.stage_foreign(
        "n",
        StagedOperationType::Insert,
        Some(json!({"v": 5})),
        Some("pending"),
    );

    let roll_back_blocker = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cluster.set_atr_state(&blocker, "rolled_back");
    };
    let ((), attempts) = tokio::join!(roll_back_blocker, insert_owned(&transactions, "n"));

    assert!(attempts > 1);
    assert_eq!(cluster.body("n"), Some(json!({"owner": "n"})));
    assert!(!cluster.has_txn_metadata("n"));
}

#[tokio::test]
async fn test_swallowed_write_write_conflict_blocks_commit() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("x", json!({"v": 1}));
    cluster.stage_foreign(
        "x",
        StagedOperationType::Replace,
        Some(json!({"v": 5})),
        Some("pending"),
    );

    let attempt = transactions.new_attempt(
        &transactions.new_transaction_context(&PerTransactionConfig::default()),
    );
    let doc = attempt.get(&doc_id("x")).await.unwrap();
    let err = attempt.replace(&doc, json!({"v": 2})).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::FailWriteWriteConflict);

    assert!(attempt.commit().await.is_err());
    assert_eq!(cluster.body("x"), Some(json!({"v": 1})));
}

#[tokio::test]
async fn test_replace_of_doc_read_by_another_attempt_is_refused() {
    let (cluster, transactions) = setup(test_config());
    cluster.upsert("x", json!({"v": 1}));

    let reader = transactions.new_attempt(
        &transactions.new_transaction_context(&PerTransactionConfig::default()),
    );
    let doc = reader.get(&doc_id("x")).await.unwrap();

    let writer = transactions.new_attempt(
        &transactions.new_transaction_context(&PerTransactionConfig::default()),
    );
    let err = writer.replace(&doc, json!({"v": 2})).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::FailOther);
    let err = writer.remove(&doc).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::FailOther);

    assert!(writer.commit().await.is_err());
    assert_eq!(cluster.body("x"), Some(json!({"v": 1})));
    assert!(!cluster.has_txn_metadata("x"));
}
