use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

mod common;
use common::{doc_id, setup, test_config};

const KEYS: [&str; 5] = ["k0", "k1", "k2", "k3", "k4"];

#[derive(Debug, Clone)]
enum Op {
    Insert(&'static str, i64),
    Replace(&'static str, i64),
    Remove(&'static str),
}

/// Where a key stands inside the transaction being planned.
#[derive(Debug, Clone, Copy, PartialEq)]
enum KeyState {
    Absent,
    Present,
    Inserted,
    Replaced,
    Removed,
}

/// Plans a transaction against the committed `model`, returning its ops and
/// the model as it would be after a commit.
fn plan(rng: &mut StdRng, model: &BTreeMap<&'static str, i64>) -> (Vec<Op>, BTreeMap<&'static str, i64>) {
    let mut states: BTreeMap<&'static str, KeyState> = KEYS
        .iter()
        .map(|k| {
            let state = if model.contains_key(k) {
                KeyState::Present
            } else {
                KeyState::Absent
            };
            (*k, state)
        })
        .collect();
    let mut after = model.clone();
    let mut ops = Vec::new();

    for _ in 0..rng.random_range(1..6) {
        let key = KEYS[rng.random_range(0..KEYS.len())];
        let value = rng.random_range(0..1000);
        let state = states[key];
        let (op, next) = match state {
            KeyState::Absent => (Op::Insert(key, value), KeyState::Inserted),
            KeyState::Present | KeyState::Replaced if rng.random_bool(0.3) => {
                (Op::Remove(key), KeyState::Removed)
            }
            KeyState::Present | KeyState::Replaced => (Op::Replace(key, value), KeyState::Replaced),
            KeyState::Inserted => (Op::Replace(key, value), KeyState::Inserted),
            KeyState::Removed => continue,
        };
        match op {
            Op::Insert(k, v) | Op::Replace(k, v) => {
                after.insert(k, v);
            }
            Op::Remove(k) => {
                after.remove(k);
            }
        }
        states.insert(key, next);
        ops.push(op);
    }
    (ops, after)
}

#[tokio::test]
async fn test_random_transactions_match_model() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (cluster, transactions) = setup(test_config());
        let mut model: BTreeMap<&'static str, i64> = BTreeMap::new();

        for _ in 0..10 {
            let (ops, after) = plan(&mut rng, &model);
            let rollback = rng.random_bool(0.25);

            transactions
                .run(|ctx| {
                    let ops = ops.clone();
                    async move {
                        for op in ops {
                            match op {
                                Op::Insert(key, v) => {
                                    ctx.insert(&doc_id(key), json!({"v": v})).await?;
                                }
                                Op::Replace(key, v) => {
                                    let doc = ctx.get(&doc_id(key)).await?;
                                    ctx.replace(&doc, json!({"v": v})).await?;
                                }
                                Op::Remove(key) => {
                                    let doc = ctx.get(&doc_id(key)).await?;
                                    ctx.remove(&doc).await?;
                                }
                            }
                        }
                        if rollback {
                            ctx.rollback().await?;
                        }
                        Ok(())
                    }
                })
                .await
                .unwrap_or_else(|e| panic!("seed {seed}: {ops:?} failed: {e}"));

            if !rollback {
                model = after;
            }
            for key in KEYS {
                assert_eq!(
                    cluster.body(key),
                    model.get(key).map(|v| json!({"v": v})),
                    "seed {seed}: {key} diverged after {ops:?}"
                );
                assert!(!cluster.has_txn_metadata(key), "seed {seed}: {key} left staged");
            }
        }
    }
}
