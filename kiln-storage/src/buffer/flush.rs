//! Flush cycle.
//!
//! A flush resolves the durable base of pending writes that need one,
//! snapshots the pending set into a [`FlushGroup`], publishes the
//! post-flush state of every snapshotted key, and transmits the group:
//! inserts through the bulk-load path, everything else as one statement
//! batch per table. Writes recorded while a group is in flight form the
//! next group. A group that exhausts its retries is parked and transmitted
//! first by the next flush.

use kiln_core::{
    DetectedAt, FlushFailure, KilnError, KilnResult, PendingError, PrimaryKey, Row, RowKey,
    StorageError, TableSchema, WriteOrigin,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::entry::{Base, CachedEntry};
use super::{BufferedStore, Slot};
use crate::durable::WriteOp;

const MAX_DRAIN_ROUNDS: usize = 4;

/// Result of a successful flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushOutcome {
    /// Groups transmitted, including previously parked ones.
    pub groups: usize,
    /// Net writes transmitted.
    pub writes: usize,
    /// Writes the durable store accepted.
    pub committed: usize,
    /// Constraint violations attributed to the writes that caused them.
    pub errors: Vec<PendingError>,
    pub duration: Duration,
}

impl FlushOutcome {
    pub fn is_empty(&self) -> bool {
        self.groups == 0
    }

    fn absorb(&mut self, other: FlushOutcome) {
        self.groups += other.groups;
        self.writes += other.writes;
        self.committed += other.committed;
        self.errors.extend(other.errors);
        self.duration += other.duration;
    }
}

#[derive(Debug)]
struct TableBatch {
    schema: Arc<TableSchema>,
    inserts: Vec<Row>,
    insert_origins: HashMap<PrimaryKey, WriteOrigin>,
    ops: Vec<WriteOp>,
    inserts_done: bool,
    ops_done: bool,
    collided: Vec<PrimaryKey>,
}

impl TableBatch {
    fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            inserts: Vec::new(),
            insert_origins: HashMap::new(),
            ops: Vec::new(),
            inserts_done: false,
            ops_done: false,
            collided: Vec::new(),
        }
    }
}

/// One snapshot of pending writes, transmitted as a unit.
#[derive(Debug)]
pub(crate) struct FlushGroup {
    id: u64,
    keys: Vec<RowKey>,
    tables: BTreeMap<String, TableBatch>,
    errors: Vec<PendingError>,
}

impl FlushGroup {
    pub(crate) fn writes(&self) -> usize {
        self.keys.len()
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}

pub(super) fn into_storage_error(error: KilnError, table: &str) -> StorageError {
    match error {
        KilnError::Storage(e) => e,
        other => StorageError::Rejected {
            table: table.to_string(),
            reason: other.to_string(),
        },
    }
}

impl BufferedStore {
    /// Transmit all pending writes.
    ///
    /// Returns the constraint violations found, both those detected in
    /// cache when the writes were recorded and those reported by the
    /// durable store. Transient failures are retried with backoff; once
    /// retries are exhausted the group is parked and a [`FlushFailure`] is
    /// returned. Flushing with nothing pending is a no-op.
    pub async fn flush(&self) -> Result<FlushOutcome, FlushFailure> {
        let _guard = self.flush_lock.lock().await;
        let started = Instant::now();

        self.resolve_pending_bases().await?;
        let mut groups = self
            .snapshot()
            .map_err(|e| self.failure(0, into_storage_error(e, ""), Vec::new()))?;

        if groups.is_empty() {
            tracing::trace!("Flush cycle completed with nothing pending");
            return Ok(FlushOutcome::default());
        }

        let mut outcome = FlushOutcome::default();
        while let Some(mut group) = groups.pop_front() {
            match self.transmit(&mut group).await {
                Ok(()) => {
                    self.commit(group, &mut outcome)
                        .map_err(|e| self.failure(0, into_storage_error(e, ""), Vec::new()))?;
                }
                Err((attempts, error)) => {
                    let tables = group.table_names();
                    groups.push_front(group);
                    if let Ok(mut state) = self.lock() {
                        while let Some(parked) = groups.pop_back() {
                            state.queue.push_front(parked);
                        }
                    }
                    let failure = self.failure(attempts, error, tables);
                    tracing::error!(
                        attempts,
                        unflushed = failure.unflushed_writes,
                        error = %failure.error,
                        "Flush failed; writes parked for the next flush"
                    );
                    return Err(failure);
                }
            }
        }

        outcome.duration = started.elapsed();
        tracing::debug!(
            groups = outcome.groups,
            writes = outcome.writes,
            committed = outcome.committed,
            errors = outcome.errors.len(),
            duration_ms = outcome.duration.as_millis() as u64,
            "Flush cycle completed"
        );
        Ok(outcome)
    }

    /// Flush until nothing is left pending. Call on shutdown.
    pub async fn drain(&self) -> Result<FlushOutcome, FlushFailure> {
        let mut total = FlushOutcome::default();
        for _ in 0..MAX_DRAIN_ROUNDS {
            total.absorb(self.flush().await?);
            if self.unflushed_writes() == 0 {
                break;
            }
        }
        tracing::info!(
            writes = total.writes,
            errors = total.errors.len(),
            remaining = self.unflushed_writes(),
            "Buffered store drained"
        );
        Ok(total)
    }

    fn failure(&self, attempts: u32, error: StorageError, tables: Vec<String>) -> FlushFailure {
        FlushFailure {
            attempts,
            unflushed_writes: self.unflushed_writes(),
            tables,
            error,
        }
    }

    /// Run `call`, retrying transient failures with backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        table: &str,
        mut call: F,
    ) -> Result<T, (u32, KilnError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KilnResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.backoff_for(attempt);
                    tracing::warn!(
                        operation,
                        table,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient durable store failure during flush; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    /// Fetch the durable row under every pending write whose visible state
    /// depends on it.
    async fn resolve_pending_bases(&self) -> Result<(), FlushFailure> {
        let wanted: BTreeMap<String, Vec<PrimaryKey>> = {
            let state = self
                .lock()
                .map_err(|e| self.failure(0, into_storage_error(e, ""), Vec::new()))?;
            let mut wanted: BTreeMap<String, Vec<PrimaryKey>> = BTreeMap::new();
            for key in &state.pending {
                if let Some(Slot {
                    entry: CachedEntry::Pending(write),
                    ..
                }) = state.slots.get(key)
                {
                    if write.needs_base() {
                        wanted.entry(key.0.clone()).or_default().push(key.1.clone());
                    }
                }
            }
            wanted
        };

        for (table, keys) in wanted {
            let schema = self
                .schemas
                .get(&table)
                .map_err(|e| self.failure(0, into_storage_error(e, &table), vec![table.clone()]))?;
            let rows = self
                .with_retry("fetch_many", &table, || self.durable.fetch_many(&schema, &keys))
                .await
                .map_err(|(attempts, e)| {
                    self.failure(attempts, into_storage_error(e, &table), vec![table.clone()])
                })?;

            let mut found: HashMap<PrimaryKey, Row> = HashMap::with_capacity(rows.len());
            for row in rows {
                if let Ok(key) = schema.key_of(&row) {
                    found.insert(key, row);
                }
            }

            let mut state = self
                .lock()
                .map_err(|e| self.failure(0, into_storage_error(e, &table), vec![table.clone()]))?;
            for key in keys {
                let row_key: RowKey = (table.clone(), key);
                let write = match state.slots.get(&row_key) {
                    Some(Slot {
                        entry: CachedEntry::Pending(write),
                        ..
                    }) if write.base == Base::Unknown => write.clone(),
                    _ => continue,
                };
                let fetched = found.remove(&row_key.1);
                state.settle(row_key, write, fetched);
            }
        }
        Ok(())
    }

    /// Move every resolvable pending write into a new group and publish
    /// the state each key will have once the group commits.
    fn snapshot(&self) -> KilnResult<VecDeque<FlushGroup>> {
        let mut state = self.lock()?;
        let keys: Vec<RowKey> = state.pending.iter().cloned().collect();

        let mut writes = Vec::with_capacity(keys.len());
        for key in keys {
            let write = match state.slots.get(&key) {
                Some(Slot {
                    entry: CachedEntry::Pending(write),
                    ..
                }) => write.clone(),
                _ => continue,
            };
            // Base still unknown: recorded after resolution, left for the next flush.
            if write.needs_base() {
                continue;
            }
            let Some(visible) = write.visible() else {
                continue;
            };
            let published = match visible {
                Some(row) => CachedEntry::Present(row),
                None => CachedEntry::Absent,
            };
            state.put(key.clone(), published);
            *state.in_flight.entry(key.clone()).or_insert(0) += 1;
            writes.push((key, write));
        }
        writes.sort_by_key(|(_, write)| write.seq);

        let errors = std::mem::take(&mut state.deferred_errors);
        let mut groups = std::mem::take(&mut state.queue);
        if writes.is_empty() && errors.is_empty() {
            return Ok(groups);
        }

        let mut tables: BTreeMap<String, TableBatch> = BTreeMap::new();
        let mut group_keys = Vec::with_capacity(writes.len());
        for (key, write) in writes {
            if !tables.contains_key(&key.0) {
                let schema = self.schemas.get(&key.0)?;
                tables.insert(key.0.clone(), TableBatch::new(schema));
            }
            if let Some(batch) = tables.get_mut(&key.0) {
                match write.op {
                    WriteOp::Insert { row } => {
                        batch.insert_origins.insert(key.1.clone(), write.origin);
                        batch.inserts.push(row);
                    }
                    op => batch.ops.push(op),
                }
            }
            group_keys.push(key);
        }

        let id = state.next_seq();
        tracing::debug!(
            group = id,
            writes = group_keys.len(),
            tables = tables.len(),
            deferred_errors = errors.len(),
            parked = groups.len(),
            "Snapshotted pending writes"
        );
        groups.push_back(FlushGroup {
            id,
            keys: group_keys,
            tables,
            errors,
        });
        Ok(groups)
    }

    /// Send every unfinished step of `group`. Steps that completed on an
    /// earlier attempt are not resent.
    async fn transmit(&self, group: &mut FlushGroup) -> Result<(), (u32, StorageError)> {
        for (table, batch) in group.tables.iter_mut() {
            if !batch.inserts_done {
                if !batch.inserts.is_empty() {
                    let schema = batch.schema.clone();
                    let rows = &batch.inserts;
                    let collided = self
                        .with_retry("bulk_insert", table, || self.durable.bulk_insert(&schema, rows))
                        .await
                        .map_err(|(attempts, e)| (attempts, into_storage_error(e, table)))?;
                    batch.collided = collided;
                }
                batch.inserts_done = true;
            }
            if !batch.ops_done {
                if !batch.ops.is_empty() {
                    let schema = batch.schema.clone();
                    let ops = &batch.ops;
                    self.with_retry("apply", table, || self.durable.apply(&schema, ops))
                        .await
                        .map_err(|(attempts, e)| (attempts, into_storage_error(e, table)))?;
                }
                batch.ops_done = true;
            }
        }
        tracing::trace!(group = group.id, "Flush group transmitted");
        Ok(())
    }

    /// Release the group's keys and map durable collisions back to the
    /// writes that caused them.
    fn commit(&self, group: FlushGroup, outcome: &mut FlushOutcome) -> KilnResult<()> {
        let mut state = self.lock()?;
        for key in &group.keys {
            if let Some(count) = state.in_flight.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    state.in_flight.remove(key);
                }
            }
        }

        let mut collisions = 0;
        for (table, batch) in &group.tables {
            for key in &batch.collided {
                collisions += 1;
                if let Some(origin) = batch.insert_origins.get(key) {
                    tracing::debug!(
                        table = %table,
                        key = %key,
                        event = %origin.event,
                        function = %origin.function,
                        "Durable store reported primary key collision"
                    );
                    outcome.errors.push(PendingError {
                        event: origin.event,
                        function: origin.function.clone(),
                        table: table.clone(),
                        key: key.clone(),
                        detected_at: DetectedAt::DurableStore,
                    });
                }

                // The published row never reached the durable store.
                let row_key: RowKey = (table.clone(), key.clone());
                let reverted = match state.slots.get(&row_key) {
                    Some(Slot {
                        entry: CachedEntry::Pending(write),
                        ..
                    }) => {
                        let mut write = write.clone();
                        write.base = Base::Unknown;
                        Some(CachedEntry::Pending(write))
                    }
                    Some(_) => None,
                    None => continue,
                };
                match reverted {
                    Some(entry) => state.put(row_key, entry),
                    None => {
                        state.remove(&row_key);
                    }
                }
            }
        }

        let writes = group.writes();
        outcome.groups += 1;
        outcome.writes += writes;
        outcome.committed += writes.saturating_sub(collisions);
        outcome.errors.extend(group.errors);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use kiln_core::{
        BufferConfig, ColumnDef, ColumnType, EventId, FunctionId, Patch, RetryConfig,
        SchemaRegistry, Value,
    };

    fn setup(retry: RetryConfig) -> (Arc<InMemoryStore>, BufferedStore) {
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
        let durable = Arc::new(InMemoryStore::new());
        let store = BufferedStore::new(
            durable.clone(),
            Arc::new(registry),
            BufferConfig::default(),
            retry,
        );
        (durable, store)
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn account(id: i64, balance: i64) -> Row {
        Row::new("accounts").with("id", id).with("balance", balance)
    }

    fn origin(block: u64, function: &str) -> WriteOrigin {
        WriteOrigin::new(EventId::new(block, 0), FunctionId::new(function))
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let (durable, store) = setup(fast_retry(0));
        let outcome = store.flush().await.unwrap();
        assert!(outcome.is_empty());
        assert_eq!(durable.write_round_trips(), 0);
    }

    #[tokio::test]
    async fn test_flush_sends_one_op_per_key() {
        let (durable, store) = setup(fast_retry(0));
        store.insert("accounts", account(1, 10), &origin(1, "mint")).await.unwrap();
        store
            .update("accounts", PrimaryKey::from(1), Patch::new().set("balance", 20i64), &origin(2, "transfer"))
            .unwrap();
        store
            .update("accounts", PrimaryKey::from(1), Patch::new().set("balance", 30i64), &origin(3, "transfer"))
            .unwrap();

        let outcome = store.flush().await.unwrap();
        assert_eq!(outcome.writes, 1);
        assert_eq!(outcome.committed, 1);
        assert_eq!(durable.write_round_trips(), 1);
        assert_eq!(
            durable.get("accounts", &PrimaryKey::from(1)).unwrap().get("balance"),
            Some(&Value::Int(30))
        );

        // Published state is served without a durable read.
        let reads = durable.read_round_trips();
        let row = store.find("accounts", PrimaryKey::from(1)).await.unwrap().unwrap();
        assert_eq!(row.get("balance"), Some(&Value::Int(30)));
        assert_eq!(durable.read_round_trips(), reads);

        assert!(store.flush().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_durable_collision_reverts_to_durable_row() {
        let (durable, store) = setup(fast_retry(0));
        let schema = store.schema("accounts").unwrap();
        durable.seed(&schema, account(1, 10)).unwrap();

        store.insert("accounts", account(1, 99), &origin(7, "mint")).await.unwrap();
        store.insert("accounts", account(2, 5), &origin(7, "mint")).await.unwrap();

        let outcome = store.flush().await.unwrap();
        assert_eq!(outcome.errors.len(), 1);
        let err = &outcome.errors[0];
        assert_eq!(err.detected_at, DetectedAt::DurableStore);
        assert_eq!(err.key, PrimaryKey::from(1));
        assert_eq!(err.function, FunctionId::new("mint"));
        assert_eq!(outcome.committed, 1);

        let row = store.find("accounts", PrimaryKey::from(1)).await.unwrap().unwrap();
        assert_eq!(row.get("balance"), Some(&Value::Int(10)));
        assert!(durable.get("accounts", &PrimaryKey::from(2)).is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (durable, store) = setup(fast_retry(3));
        store.insert("accounts", account(1, 10), &origin(1, "mint")).await.unwrap();
        durable.fail_next_writes(2);

        let outcome = store.flush().await.unwrap();
        assert_eq!(outcome.committed, 1);
        assert_eq!(durable.write_round_trips(), 3);
        assert!(durable.get("accounts", &PrimaryKey::from(1)).is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_park_group() {
        let (durable, store) = setup(fast_retry(1));
        store.insert("accounts", account(1, 10), &origin(1, "mint")).await.unwrap();
        durable.fail_next_writes(5);

        let failure = store.flush().await.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.unflushed_writes, 1);
        assert_eq!(failure.tables, vec!["accounts".to_string()]);
        assert_eq!(store.unflushed_writes(), 1);

        // A write recorded after the failure lands in a later group.
        store.insert("accounts", account(2, 20), &origin(2, "mint")).await.unwrap();
        durable.fail_next_writes(0);
        let outcome = store.flush().await.unwrap();
        assert_eq!(outcome.groups, 2);
        assert_eq!(outcome.committed, 2);
        assert_eq!(store.unflushed_writes(), 0);
        assert_eq!(durable.row_count("accounts"), 2);
    }

    #[tokio::test]
    async fn test_update_over_unknown_base_is_resolved_at_flush() {
        let (durable, store) = setup(fast_retry(0));
        let schema = store.schema("accounts").unwrap();
        durable.seed(&schema, account(1, 10)).unwrap();

        store
            .update("accounts", PrimaryKey::from(1), Patch::new().set("balance", 11i64), &origin(1, "transfer"))
            .unwrap();
        store.flush().await.unwrap();

        assert_eq!(durable.read_round_trips(), 1);
        let row = store.find("accounts", PrimaryKey::from(1)).await.unwrap().unwrap();
        assert_eq!(row.get("balance"), Some(&Value::Int(11)));
        assert_eq!(durable.read_round_trips(), 1);
    }

    #[tokio::test]
    async fn test_insert_collision_blamed_on_insert_not_later_update() {
        let (durable, store) = setup(fast_retry(0));
        let schema = store.schema("accounts").unwrap();
        durable.seed(&schema, account(1, 10)).unwrap();

        store.insert("accounts", account(1, 99), &origin(1, "mint")).await.unwrap();
        store
            .update("accounts", PrimaryKey::from(1), Patch::new().set("balance", 50i64), &origin(2, "transfer"))
            .unwrap();

        let outcome = store.flush().await.unwrap();
        assert_eq!(outcome.errors.len(), 1);
        let err = &outcome.errors[0];
        assert_eq!(err.event, EventId::new(1, 0));
        assert_eq!(err.function, FunctionId::new("mint"));
        assert_eq!(err.key, PrimaryKey::from(1));
        assert_eq!(
            durable.get("accounts", &PrimaryKey::from(1)),
            Some(account(1, 50))
        );
    }

    #[tokio::test]
    async fn test_insert_collision_survives_later_delete() {
        let (durable, store) = setup(fast_retry(0));
        let schema = store.schema("accounts").unwrap();
        durable.seed(&schema, account(1, 10)).unwrap();

        store.insert("accounts", account(1, 99), &origin(3, "mint")).await.unwrap();
        store.delete("accounts", PrimaryKey::from(1), &origin(4, "burn")).unwrap();
        assert!(store.find("accounts", PrimaryKey::from(1)).await.unwrap().is_none());

        let outcome = store.flush().await.unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].event, EventId::new(3, 0));
        assert_eq!(outcome.errors[0].function, FunctionId::new("mint"));
        assert!(durable.get("accounts", &PrimaryKey::from(1)).is_none());
    }

    #[tokio::test]
    async fn test_insert_then_update_over_vacant_key_reports_nothing() {
        let (durable, store) = setup(fast_retry(0));
        store.insert("accounts", account(1, 5), &origin(1, "mint")).await.unwrap();
        store
            .upsert("accounts", account(1, 0), Patch::new().set("balance", 6i64), &origin(2, "transfer"))
            .unwrap();

        let outcome = store.flush().await.unwrap();
        assert!(outcome.errors.is_empty());
        assert_eq!(
            durable.get("accounts", &PrimaryKey::from(1)),
            Some(account(1, 6))
        );
    }

    #[tokio::test]
    async fn test_drain_empties_store() {
        let (durable, store) = setup(fast_retry(0));
        for id in 0..10 {
            store.insert("accounts", account(id, id), &origin(1, "mint")).await.unwrap();
        }
        let outcome = store.drain().await.unwrap();
        assert_eq!(outcome.committed, 10);
        assert_eq!(store.unflushed_writes(), 0);
        assert_eq!(durable.row_count("accounts"), 10);
    }
}
