//! In-memory durable store.
//!
//! Behaves like the relational store from the buffered store's point of
//! view (key collisions on bulk insert, patch-on-conflict upserts) and
//! counts round trips so callers can assert that a read was served from
//! cache. Transient failures can be injected for reads and writes.

use async_trait::async_trait;
use kiln_core::{KilnResult, PrimaryKey, Row, StorageError, TableSchema};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::durable::{DurableStore, WriteOp};

/// Reference [`DurableStore`] keeping every table in a `BTreeMap`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<PrimaryKey, Row>>>,
    read_round_trips: AtomicU64,
    write_round_trips: AtomicU64,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a row directly, bypassing round-trip accounting.
    pub fn seed(&self, schema: &TableSchema, row: Row) -> KilnResult<()> {
        let row = schema.validate_row(row)?;
        let key = schema.key_of(&row)?;
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        tables
            .entry(schema.name().to_string())
            .or_default()
            .insert(key, row);
        Ok(())
    }

    /// Read a row directly, bypassing round-trip accounting.
    pub fn get(&self, table: &str, key: &PrimaryKey) -> Option<Row> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table).and_then(|t| t.get(key).cloned()))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(table).map(BTreeMap::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of lookups (point or batched) served.
    pub fn read_round_trips(&self) -> u64 {
        self.read_round_trips.load(Ordering::SeqCst)
    }

    /// Number of write calls (bulk inserts and statement batches) served.
    pub fn write_round_trips(&self) -> u64 {
        self.write_round_trips.load(Ordering::SeqCst)
    }

    /// Fail the next `n` reads with a transient error.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_read(&self) -> KilnResult<()> {
        self.read_round_trips.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_reads) {
            return Err(StorageError::Unavailable {
                reason: "injected read failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn check_write(&self) -> KilnResult<()> {
        self.write_round_trips.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_writes) {
            return Err(StorageError::Unavailable {
                reason: "injected write failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, schema: &TableSchema, key: &PrimaryKey) -> KilnResult<Option<Row>> {
        self.check_read()?;
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.get(schema.name()).and_then(|t| t.get(key).cloned()))
    }

    async fn fetch_many(&self, schema: &TableSchema, keys: &[PrimaryKey]) -> KilnResult<Vec<Row>> {
        self.check_read()?;
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let Some(table) = tables.get(schema.name()) else {
            return Ok(Vec::new());
        };
        Ok(keys.iter().filter_map(|k| table.get(k).cloned()).collect())
    }

    async fn bulk_insert(&self, schema: &TableSchema, rows: &[Row]) -> KilnResult<Vec<PrimaryKey>> {
        self.check_write()?;
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let table = tables.entry(schema.name().to_string()).or_default();
        let mut collisions = Vec::new();
        for row in rows {
            let key = schema.key_of(row)?;
            if table.contains_key(&key) {
                collisions.push(key);
            } else {
                table.insert(key, row.clone());
            }
        }
        Ok(collisions)
    }

    async fn apply(&self, schema: &TableSchema, ops: &[WriteOp]) -> KilnResult<()> {
        self.check_write()?;
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let table = tables.entry(schema.name().to_string()).or_default();
        for op in ops {
            match op {
                WriteOp::Insert { row } => {
                    let key = schema.key_of(row)?;
                    table.entry(key).or_insert_with(|| row.clone());
                }
                WriteOp::Update { key, patch } => {
                    if let Some(existing) = table.get_mut(key) {
                        existing.apply(patch);
                    }
                }
                WriteOp::Upsert { row, on_conflict } => {
                    let key = schema.key_of(row)?;
                    match table.get_mut(&key) {
                        Some(existing) => existing.apply(on_conflict),
                        None => {
                            table.insert(key, row.clone());
                        }
                    }
                }
                WriteOp::Delete { key } => {
                    table.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ColumnDef, ColumnType, KilnError, Patch, Value};

    fn schema() -> TableSchema {
        TableSchema::new(
            "accounts",
            vec![
                ColumnDef::new("id", ColumnType::Int),
                ColumnDef::new("balance", ColumnType::Int),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    fn account(id: i64, balance: i64) -> Row {
        Row::new("accounts").with("id", id).with("balance", balance)
    }

    #[tokio::test]
    async fn test_bulk_insert_reports_collisions_and_commits_rest() {
        let store = InMemoryStore::new();
        let schema = schema();
        store.seed(&schema, account(1, 10)).unwrap();

        let collisions = store
            .bulk_insert(&schema, &[account(1, 99), account(2, 20)])
            .await
            .unwrap();

        assert_eq!(collisions, vec![PrimaryKey::from(1)]);
        assert_eq!(store.get("accounts", &PrimaryKey::from(1)).unwrap().get("balance"), Some(&Value::Int(10)));
        assert!(store.get("accounts", &PrimaryKey::from(2)).is_some());
    }

    #[tokio::test]
    async fn test_apply_upsert_patches_existing() {
        let store = InMemoryStore::new();
        let schema = schema();
        store.seed(&schema, account(1, 10)).unwrap();

        store
            .apply(
                &schema,
                &[
                    WriteOp::Upsert {
                        row: account(1, 0),
                        on_conflict: Patch::new().set("balance", 11i64),
                    },
                    WriteOp::Upsert {
                        row: account(2, 5),
                        on_conflict: Patch::new().set("balance", 99i64),
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.get("accounts", &PrimaryKey::from(1)).unwrap().get("balance"), Some(&Value::Int(11)));
        assert_eq!(store.get("accounts", &PrimaryKey::from(2)).unwrap().get("balance"), Some(&Value::Int(5)));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient_and_counted() {
        let store = InMemoryStore::new();
        let schema = schema();
        store.fail_next_reads(1);

        let err = store.fetch(&schema, &PrimaryKey::from(1)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, KilnError::Storage(StorageError::Unavailable { .. })));

        assert!(store.fetch(&schema, &PrimaryKey::from(1)).await.unwrap().is_none());
        assert_eq!(store.read_round_trips(), 2);
    }
}
