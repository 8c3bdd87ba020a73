//! Memory budget enforcement and prefetch population.
//!
//! Only clean slots that are not part of an in-flight flush group can be
//! evicted. Victims are chosen by predicted need, not recency: slots the
//! next batch is predicted to read go last, and within each class the
//! least-read slots go first.

use kiln_core::{FlushFailure, KilnResult, PrimaryKey, Row, RowKey};
use std::collections::HashSet;
use std::sync::atomic::Ordering;

use super::entry::CachedEntry;
use super::flush::into_storage_error;
use super::{BufferState, BufferedStore, FlushOutcome};

/// Result of [`BufferedStore::relieve_pressure`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PressureRelief {
    pub flushed: FlushOutcome,
    pub evicted: usize,
    pub memory_bytes: usize,
}

impl BufferedStore {
    fn eviction_target(&self) -> usize {
        (self.config.memory_budget_bytes as f64 * self.config.eviction_target_ratio) as usize
    }

    /// Evict clean slots until the estimated size is at or below the
    /// eviction target. Returns the number of slots evicted.
    pub fn evict(&self, retain: &HashSet<RowKey>) -> KilnResult<usize> {
        let mut state = self.lock()?;
        Ok(self.evict_with(&mut state, retain, None))
    }

    /// [`evict`](Self::evict) under an already held lock, using the last
    /// retain set installed with [`set_retain`](Self::set_retain).
    pub(crate) fn evict_locked(&self, state: &mut BufferState, keep: Option<&RowKey>) -> usize {
        let retain = std::mem::take(&mut state.retain);
        let evicted = self.evict_with(state, &retain, keep);
        state.retain = retain;
        evicted
    }

    fn evict_with(&self, state: &mut BufferState, retain: &HashSet<RowKey>, keep: Option<&RowKey>) -> usize {
        let target = self.eviction_target();
        if state.memory_bytes <= target {
            return 0;
        }

        let mut candidates: Vec<(bool, u64, RowKey)> = state
            .slots
            .iter()
            .filter(|(key, slot)| {
                !slot.entry.is_pending() && !state.in_flight.contains_key(*key) && Some(*key) != keep
            })
            .map(|(key, slot)| (retain.contains(key), slot.hits, key.clone()))
            .collect();
        candidates.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut evicted = 0;
        let mut retained_evicted = 0;
        for (retained, _, key) in candidates {
            if state.memory_bytes <= target {
                break;
            }
            if state.remove(&key).is_some() {
                evicted += 1;
                if retained {
                    retained_evicted += 1;
                }
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);

        tracing::debug!(
            evicted,
            retained_evicted,
            memory_bytes = state.memory_bytes,
            target,
            "Evicted clean cache entries"
        );
        evicted
    }

    /// Bring the cache back under budget: flush so pending writes become
    /// evictable, then evict. No-op while under budget.
    pub async fn relieve_pressure(
        &self,
        retain: &HashSet<RowKey>,
    ) -> Result<Option<PressureRelief>, FlushFailure> {
        if !self.over_budget() {
            return Ok(None);
        }
        let before = self.memory_bytes();
        let flushed = self.flush().await?;
        let evicted = self.evict(retain).map_err(|e| FlushFailure {
            attempts: 0,
            unflushed_writes: self.unflushed_writes(),
            tables: Vec::new(),
            error: into_storage_error(e, ""),
        })?;
        let memory_bytes = self.memory_bytes();
        tracing::info!(
            before,
            after = memory_bytes,
            budget = self.config.memory_budget_bytes,
            flushed = flushed.writes,
            evicted,
            "Relieved buffered store memory pressure"
        );
        Ok(Some(PressureRelief {
            flushed,
            evicted,
            memory_bytes,
        }))
    }

    /// Install a prefetched read.
    ///
    /// Accepted only if the slot is still vacant, no slot was removed since
    /// `read_epoch` was taken, and the cache is under budget. Returns
    /// whether the row was installed.
    pub fn populate(
        &self,
        table: &str,
        key: PrimaryKey,
        row: Option<Row>,
        read_epoch: u64,
    ) -> KilnResult<bool> {
        let mut state = self.lock()?;
        if state.generation != read_epoch || state.memory_bytes > self.config.memory_budget_bytes {
            return Ok(false);
        }
        let row_key: RowKey = (table.to_string(), key);
        if state.slots.contains_key(&row_key) || state.in_flight.contains_key(&row_key) {
            return Ok(false);
        }
        let entry = match row {
            Some(row) => CachedEntry::Present(row),
            None => CachedEntry::Absent,
        };
        state.put(row_key, entry);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use kiln_core::{
        BufferConfig, ColumnDef, ColumnType, EventId, FunctionId, RetryConfig, SchemaRegistry,
        TableSchema, WriteOrigin,
    };
    use std::sync::Arc;

    fn buffered(budget: usize) -> (Arc<InMemoryStore>, BufferedStore) {
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
        let config = BufferConfig {
            memory_budget_bytes: budget,
            eviction_target_ratio: 0.5,
            ..BufferConfig::default()
        };
        let store = BufferedStore::new(durable.clone(), Arc::new(registry), config, RetryConfig::default());
        (durable, store)
    }

    fn account(id: i64) -> Row {
        Row::new("accounts").with("id", id).with("balance", 1i64)
    }

    fn key(id: i64) -> RowKey {
        ("accounts".to_string(), PrimaryKey::from(id))
    }

    #[tokio::test]
    async fn test_populate_respects_existing_entries() {
        let (_durable, store) = buffered(1 << 20);
        let epoch = store.read_epoch();
        let origin = WriteOrigin::new(EventId::new(1, 0), FunctionId::new("f"));
        store.delete("accounts", PrimaryKey::from(1), &origin).unwrap();

        assert!(!store.populate("accounts", PrimaryKey::from(1), Some(account(1)), epoch).unwrap());
        assert!(store.populate("accounts", PrimaryKey::from(2), Some(account(2)), epoch).unwrap());
        assert!(store.find("accounts", PrimaryKey::from(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_populate_rejected_after_removal() {
        let (_durable, store) = buffered(1 << 20);
        store.populate("accounts", PrimaryKey::from(1), None, store.read_epoch()).unwrap();
        let epoch = store.read_epoch();
        {
            let mut state = store.lock().unwrap();
            state.remove(&key(1));
        }
        assert!(!store.populate("accounts", PrimaryKey::from(2), None, epoch).unwrap());
    }

    #[tokio::test]
    async fn test_evict_prefers_unpredicted_entries() {
        let (_durable, store) = buffered(usize::MAX);
        for id in 0..20 {
            store
                .populate("accounts", PrimaryKey::from(id), Some(account(id)), store.read_epoch())
                .unwrap();
        }
        let total = store.memory_bytes();
        let per_slot = total / 20;

        // Shrink the budget so roughly half the slots must go.
        let (_d, small) = store_with_budget(&store, per_slot * 12);
        let retain: HashSet<RowKey> = (0..5).map(key).collect();
        let evicted = small.evict(&retain).unwrap();

        assert!(evicted > 0);
        assert!(small.memory_bytes() <= small.eviction_target());
        for id in 0..5 {
            assert!(small.is_cached("accounts", &PrimaryKey::from(id)));
        }
    }

    fn store_with_budget(template: &BufferedStore, budget: usize) -> (Arc<InMemoryStore>, BufferedStore) {
        let (durable, store) = buffered(budget);
        let slots: Vec<(RowKey, CachedEntry)> = template
            .lock()
            .unwrap()
            .slots
            .iter()
            .map(|(k, s)| (k.clone(), s.entry.clone()))
            .collect();
        {
            let mut state = store.lock().unwrap();
            for (k, e) in slots {
                state.put(k, e);
            }
        }
        (durable, store)
    }

    #[tokio::test]
    async fn test_pending_writes_are_never_evicted() {
        let (durable, store) = buffered(256);
        let origin = WriteOrigin::new(EventId::new(1, 0), FunctionId::new("f"));
        for id in 0..10 {
            store.insert("accounts", account(id), &origin).await.unwrap();
        }
        assert!(store.over_budget());
        assert_eq!(store.evict(&HashSet::new()).unwrap(), 0);

        let relief = store.relieve_pressure(&HashSet::new()).await.unwrap().unwrap();
        assert_eq!(relief.flushed.committed, 10);
        assert!(relief.evicted > 0);
        assert!(!store.over_budget());
        assert_eq!(durable.row_count("accounts"), 10);
    }
}
