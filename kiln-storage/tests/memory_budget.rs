use kiln_core::{
    BufferConfig, ColumnDef, ColumnType, EventId, FunctionId, PrimaryKey, RetryConfig, Row,
    RowKey, SchemaRegistry, TableSchema, WriteOrigin,
};
use kiln_storage::{BufferedStore, InMemoryStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn store(budget: usize, retry: RetryConfig) -> (Arc<InMemoryStore>, BufferedStore) {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            TableSchema::new(
                "holders",
                vec![
                    ColumnDef::new("address", ColumnType::Text),
                    ColumnDef::new("label", ColumnType::Text),
                ],
                vec!["address".into()],
            )
            .unwrap(),
        )
        .unwrap();
    let durable = Arc::new(InMemoryStore::new());
    let config = BufferConfig {
        memory_budget_bytes: budget,
        eviction_target_ratio: 0.5,
        ..BufferConfig::default()
    };
    let store = BufferedStore::new(durable.clone(), Arc::new(registry), config, retry);
    (durable, store)
}

fn holder(i: usize) -> Row {
    Row::new("holders")
        .with("address", format!("0x{:040x}", i))
        .with("label", "x".repeat(64))
}

fn origin(i: usize) -> WriteOrigin {
    WriteOrigin::new(EventId::new(i as u64, 0), FunctionId::new("on_holder"))
}

#[tokio::test]
async fn test_budget_breach_restores_usage_without_losing_writes() {
    let (durable, store) = store(16 * 1024, RetryConfig::default());
    for i in 0..400 {
        store.insert("holders", holder(i), &origin(i)).await.unwrap();
    }
    assert!(store.over_budget());

    let relief = store
        .relieve_pressure(&HashSet::new())
        .await
        .unwrap()
        .expect("over budget");
    assert_eq!(relief.flushed.committed, 400);
    assert!(relief.evicted > 0);
    assert!(!store.over_budget());
    assert_eq!(store.unflushed_writes(), 0);
    assert_eq!(durable.row_count("holders"), 400);

    // Evicted rows are still readable, just not cached.
    let row = store
        .find("holders", PrimaryKey::from(format!("0x{:040x}", 3).as_str()))
        .await
        .unwrap();
    assert_eq!(row, Some(holder(3)));
}

#[tokio::test]
async fn test_predicted_keys_survive_eviction() {
    let (_durable, store) = store(16 * 1024, RetryConfig::default());
    let epoch = store.read_epoch();
    for i in 0..400 {
        let row = holder(i);
        let key = PrimaryKey::from(format!("0x{:040x}", i).as_str());
        store.populate("holders", key, Some(row), epoch).unwrap();
        if store.over_budget() {
            break;
        }
    }
    let retain: HashSet<RowKey> = (0..10)
        .map(|i| ("holders".to_string(), PrimaryKey::from(format!("0x{:040x}", i).as_str())))
        .collect();

    let evicted = store.evict(&retain).unwrap();
    assert!(evicted > 0);
    for (table, key) in &retain {
        assert!(store.is_cached(table, key));
    }
}

#[tokio::test]
async fn test_relief_failure_keeps_writes_parked() {
    let retry = RetryConfig {
        max_retries: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
        backoff_multiplier: 1.0,
    };
    let (durable, store) = store(4 * 1024, retry);
    for i in 0..100 {
        store.insert("holders", holder(i), &origin(i)).await.unwrap();
    }
    durable.fail_next_writes(10);

    let failure = store.relieve_pressure(&HashSet::new()).await.unwrap_err();
    assert_eq!(failure.unflushed_writes, 100);
    assert_eq!(durable.row_count("holders"), 0);

    durable.fail_next_writes(0);
    let outcome = store.drain().await.unwrap();
    assert_eq!(outcome.committed, 100);
    assert_eq!(durable.row_count("holders"), 100);
}
