//! Buffered store reads and flushed durable state must both match a model
//! that applies every operation directly, in order.

use kiln_core::{
    BufferConfig, ColumnDef, ColumnType, EventId, FunctionId, Patch, PrimaryKey, RetryConfig, Row,
    SchemaRegistry, TableSchema, WriteOrigin,
};
use kiln_storage::{BufferedStore, InMemoryStore};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, i64),
    Update(i64, i64),
    Upsert(i64, i64, i64),
    Delete(i64),
    Flush,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4i64, 0..100i64).prop_map(|(k, v)| Op::Insert(k, v)),
        (0..4i64, 0..100i64).prop_map(|(k, v)| Op::Update(k, v)),
        (0..4i64, 0..100i64, 0..100i64).prop_map(|(k, v, c)| Op::Upsert(k, v, c)),
        (0..4i64).prop_map(Op::Delete),
        Just(Op::Flush),
    ]
}

fn registry() -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            TableSchema::new(
                "accounts",
                vec![
                    ColumnDef::new("id", ColumnType::Int),
                    ColumnDef::new("balance", ColumnType::Int),
                ],
                vec!["id".into()],
            )
            .unwrap(),
        )
        .unwrap();
    Arc::new(registry)
}

fn account(id: i64, balance: i64) -> Row {
    Row::new("accounts").with("id", id).with("balance", balance)
}

fn balance(v: i64) -> Patch {
    Patch::new().set("balance", v)
}

/// Direct application of each operation to a map. Returns whether the
/// operation is an insert that collides with an existing row.
fn apply_model(model: &mut BTreeMap<i64, Row>, op: &Op) -> bool {
    match *op {
        Op::Insert(k, v) => {
            if model.contains_key(&k) {
                return true;
            }
            model.insert(k, account(k, v));
        }
        Op::Update(k, v) => {
            if let Some(row) = model.get_mut(&k) {
                row.apply(&balance(v));
            }
        }
        Op::Upsert(k, v, c) => match model.get_mut(&k) {
            Some(row) => row.apply(&balance(c)),
            None => {
                model.insert(k, account(k, v));
            }
        },
        Op::Delete(k) => {
            model.remove(&k);
        }
        Op::Flush => {}
    }
    false
}

/// Run `ops` against a buffered store and the model.
///
/// With `warm`, every key is read before each operation and the cache is
/// checked against the model after it. Without, the store only learns a
/// row's durable state when a write or flush forces the read.
async fn run(seed: Vec<(i64, i64)>, ops: Vec<Op>, warm: bool) -> Result<(), TestCaseError> {
    let registry = registry();
    let schema = registry.get("accounts").unwrap();
    let durable = Arc::new(InMemoryStore::new());
    let mut model = BTreeMap::new();
    for (k, v) in seed {
        durable.seed(&schema, account(k, v)).unwrap();
        model.insert(k, account(k, v));
    }
    let store = BufferedStore::new(
        durable.clone(),
        registry,
        BufferConfig::default(),
        RetryConfig::default(),
    );

    let mut expected_errors = Vec::new();
    let mut errors = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        let event = EventId::new(i as u64, 0);
        let function = match op {
            Op::Insert(..) => "mint",
            _ => "transfer",
        };
        let origin = WriteOrigin::new(event, FunctionId::new(function));
        let key = match *op {
            Op::Insert(k, _) | Op::Update(k, _) | Op::Upsert(k, _, _) | Op::Delete(k) => Some(k),
            Op::Flush => None,
        };
        if let (true, Some(k)) = (warm, key) {
            store.find("accounts", PrimaryKey::from(k)).await.unwrap();
        }
        match *op {
            Op::Insert(k, v) => store.insert("accounts", account(k, v), &origin).await.unwrap(),
            Op::Update(k, v) => store
                .update("accounts", PrimaryKey::from(k), balance(v), &origin)
                .unwrap(),
            Op::Upsert(k, v, c) => store
                .upsert("accounts", account(k, v), balance(c), &origin)
                .unwrap(),
            Op::Delete(k) => store.delete("accounts", PrimaryKey::from(k), &origin).unwrap(),
            Op::Flush => {
                errors.extend(store.flush().await.unwrap().errors);
            }
        }
        if apply_model(&mut model, op) {
            expected_errors.push((event, PrimaryKey::from(key.unwrap_or_default())));
        }

        if warm {
            for k in 0..4 {
                let cached = store.find("accounts", PrimaryKey::from(k)).await.unwrap();
                prop_assert_eq!(cached.as_ref(), model.get(&k), "key {} after {:?}", k, op);
            }
        }
    }

    if !warm {
        for k in 0..4 {
            let cached = store.find("accounts", PrimaryKey::from(k)).await.unwrap();
            prop_assert_eq!(cached.as_ref(), model.get(&k), "key {} at end", k);
        }
    }

    errors.extend(store.drain().await.unwrap().errors);
    prop_assert_eq!(store.unflushed_writes(), 0);
    for k in 0..4 {
        let stored = durable.get("accounts", &PrimaryKey::from(k));
        prop_assert_eq!(stored.as_ref(), model.get(&k), "durable key {}", k);
    }

    for error in &errors {
        prop_assert_eq!(&error.function, &FunctionId::new("mint"));
    }
    let mut reported: Vec<(EventId, PrimaryKey)> =
        errors.into_iter().map(|e| (e.event, e.key)).collect();
    reported.sort();
    expected_errors.sort();
    prop_assert_eq!(reported, expected_errors);
    Ok(())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_warm_cache_matches_sequential_model(
        seed in prop::collection::vec((0..4i64, 0..100i64), 0..4),
        ops in prop::collection::vec(op_strategy(), 1..24),
    ) {
        runtime().block_on(run(seed, ops, true))?;
    }

    #[test]
    fn prop_cold_cache_matches_sequential_model(
        seed in prop::collection::vec((0..4i64, 0..100i64), 0..4),
        ops in prop::collection::vec(op_strategy(), 1..24),
    ) {
        runtime().block_on(run(seed, ops, false))?;
    }
}

#[tokio::test]
async fn test_update_after_colliding_insert_applies_to_durable_row() {
    let (seed, ops) = (vec![(0, 0)], vec![Op::Insert(0, 0), Op::Update(0, 1)]);
    run(seed, ops, false).await.unwrap();
}

#[tokio::test]
async fn test_two_inserts_same_key_report_one_error_for_later_write() {
    let registry = registry();
    let durable = Arc::new(InMemoryStore::new());
    let store = BufferedStore::new(
        durable.clone(),
        registry,
        BufferConfig::default(),
        RetryConfig::default(),
    );

    let first = WriteOrigin::new(EventId::new(10, 0), FunctionId::new("mint"));
    let second = WriteOrigin::new(EventId::new(11, 2), FunctionId::new("airdrop"));
    store.insert("accounts", account(1, 5), &first).await.unwrap();
    store.insert("accounts", account(1, 9), &second).await.unwrap();

    let outcome = store.flush().await.unwrap();
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].event, EventId::new(11, 2));
    assert_eq!(outcome.errors[0].function, FunctionId::new("airdrop"));
    assert_eq!(
        durable.get("accounts", &PrimaryKey::from(1)),
        Some(account(1, 5))
    );
}
