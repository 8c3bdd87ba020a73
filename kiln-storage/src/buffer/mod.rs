//! Buffered Store
//!
//! A write-back cache in front of a [`DurableStore`]. Reads are served from
//! cache when possible; writes are recorded as pending and sent to the
//! durable store in bulk by [`BufferedStore::flush`]. Primary-key
//! collisions never fail the mutating call: they are recorded as
//! [`PendingError`]s and reported when the flush group containing the write
//! is transmitted.
//!
//! # Concurrency
//!
//! All cache state lives behind one `std::sync::Mutex` that is never held
//! across an `.await`. Durable I/O happens outside the lock; results are
//! installed afterwards and discarded if a slot was removed in the meantime
//! (tracked by the cache *generation*, see [`BufferedStore::read_epoch`]).
//! Flushes are serialised by an async mutex.

mod entry;
mod eviction;
mod flush;

pub use entry::{Base, CachedEntry, PendingWrite};
pub use eviction::PressureRelief;
pub use flush::FlushOutcome;

use kiln_core::{
    BufferConfig, DetectedAt, KilnResult, Patch, PendingError, PrimaryKey, RetryConfig, Row,
    RowKey, SchemaRegistry, StorageError, TableSchema, WriteOrigin,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::durable::DurableStore;
use entry::Composed;
use flush::FlushGroup;

/// Attempts a cache-miss read makes before returning an uncached result.
const MAX_READ_ATTEMPTS: usize = 3;

/// Per-slot bookkeeping overhead added to the estimated size.
const SLOT_OVERHEAD: usize = 64;

/// Statistics about buffered store usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Reads answered from cache.
    pub hits: u64,
    /// Reads that needed a durable lookup.
    pub misses: u64,
    /// Durable lookups issued on the read path.
    pub durable_reads: u64,
    /// Number of cached slots (clean and pending).
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Slots evicted under memory pressure.
    pub evictions: u64,
    /// Writes not yet transmitted (pending plus parked groups).
    pub pending_writes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) entry: CachedEntry,
    pub(crate) hits: u64,
    pub(crate) size: usize,
}

#[derive(Debug, Default)]
pub(crate) struct BufferState {
    pub(crate) slots: HashMap<RowKey, Slot>,
    /// Keys whose slot holds a pending write.
    pub(crate) pending: HashSet<RowKey>,
    /// Keys belonging to snapshotted groups not yet committed, with the
    /// number of such groups.
    pub(crate) in_flight: HashMap<RowKey, usize>,
    /// Cache-detected collisions waiting for the next snapshot.
    pub(crate) deferred_errors: Vec<PendingError>,
    /// Snapshotted groups that have not committed, oldest first.
    pub(crate) queue: VecDeque<FlushGroup>,
    pub(crate) memory_bytes: usize,
    pub(crate) seq: u64,
    /// Bumped whenever a slot is removed.
    pub(crate) generation: u64,
    /// Keys the next batch is predicted to read; evicted last.
    pub(crate) retain: HashSet<RowKey>,
}

fn slot_size(key: &RowKey, entry: &CachedEntry) -> usize {
    SLOT_OVERHEAD + key.0.len() + key.1.estimated_size() + entry.estimated_size()
}

impl BufferState {
    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Install `entry`, keeping the hit count of the slot it replaces.
    pub(crate) fn put(&mut self, key: RowKey, entry: CachedEntry) {
        let size = slot_size(&key, &entry);
        if entry.is_pending() {
            self.pending.insert(key.clone());
        } else {
            self.pending.remove(&key);
        }
        self.memory_bytes += size;
        match self.slots.get_mut(&key) {
            Some(slot) => {
                self.memory_bytes = self.memory_bytes.saturating_sub(slot.size);
                slot.entry = entry;
                slot.size = size;
            }
            None => {
                self.slots.insert(key, Slot { entry, hits: 0, size });
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &RowKey) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.pending.remove(key);
        self.memory_bytes = self.memory_bytes.saturating_sub(slot.size);
        self.generation += 1;
        Some(slot)
    }

    /// Attach a durable read to the pending write at `key`, recording a
    /// collision if it proves a blind insert failed.
    pub(crate) fn settle(&mut self, key: RowKey, mut write: PendingWrite, fetched: Option<Row>) -> CachedEntry {
        if let Some(origin) = write.settle(fetched) {
            tracing::debug!(
                table = %key.0,
                key = %key.1,
                event = %origin.event,
                function = %origin.function,
                "Insert over unread row collides with durable row; deferring error"
            );
            self.deferred_errors.push(PendingError {
                event: origin.event,
                function: origin.function,
                table: key.0.clone(),
                key: key.1.clone(),
                detected_at: DetectedAt::DurableStore,
            });
        }
        let entry = CachedEntry::Pending(write);
        self.put(key, entry.clone());
        entry
    }

    pub(crate) fn queued_writes(&self) -> usize {
        self.queue.iter().map(FlushGroup::writes).sum()
    }
}

/// Write-back cache over a durable store.
pub struct BufferedStore {
    pub(crate) durable: Arc<dyn DurableStore>,
    pub(crate) schemas: Arc<SchemaRegistry>,
    pub(crate) config: BufferConfig,
    pub(crate) retry: RetryConfig,
    pub(crate) state: Mutex<BufferState>,
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
    flush_needed: Notify,
    hits: AtomicU64,
    misses: AtomicU64,
    durable_reads: AtomicU64,
    pub(crate) evictions: AtomicU64,
}

impl std::fmt::Debug for BufferedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedStore")
            .field("durable", &self.durable.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BufferedStore {
    /// Create an empty store. Call on pipeline start; tear down with
    /// [`drain`](Self::drain).
    pub fn new(
        durable: Arc<dyn DurableStore>,
        schemas: Arc<SchemaRegistry>,
        config: BufferConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            durable,
            schemas,
            config,
            retry,
            state: Mutex::new(BufferState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_needed: Notify::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            durable_reads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock(&self) -> KilnResult<MutexGuard<'_, BufferState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    pub fn schema(&self, table: &str) -> KilnResult<Arc<TableSchema>> {
        self.schemas.get(table)
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Notified when the pending set reaches the flush size threshold or
    /// the memory budget is exceeded.
    pub fn flush_needed(&self) -> &Notify {
        &self.flush_needed
    }

    /// Cache generation; results read from the durable store while the
    /// generation is unchanged may be installed.
    pub fn read_epoch(&self) -> u64 {
        self.lock().map(|s| s.generation).unwrap_or(u64::MAX)
    }

    pub fn is_cached(&self, table: &str, key: &PrimaryKey) -> bool {
        self.lock()
            .map(|s| s.slots.contains_key(&(table.to_string(), key.clone())))
            .unwrap_or(false)
    }

    pub fn memory_bytes(&self) -> usize {
        self.lock().map(|s| s.memory_bytes).unwrap_or(0)
    }

    pub fn over_budget(&self) -> bool {
        self.memory_bytes() > self.config.memory_budget_bytes
    }

    /// Writes recorded but not yet committed.
    pub fn unflushed_writes(&self) -> usize {
        self.lock()
            .map(|s| s.pending.len() + s.queued_writes())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let (entry_count, memory_bytes, pending) = self
            .lock()
            .map(|s| (s.slots.len(), s.memory_bytes, s.pending.len() + s.queued_writes()))
            .unwrap_or((0, 0, 0));
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            durable_reads: self.durable_reads.load(Ordering::Relaxed),
            entry_count: entry_count as u64,
            memory_bytes: memory_bytes as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
            pending_writes: pending as u64,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Look up a row.
    ///
    /// Served from cache when the slot's state is known; otherwise fetched
    /// from the durable store and cached. A key deleted in the current
    /// unflushed window reads as `None`.
    pub async fn find(&self, table: &str, key: PrimaryKey) -> KilnResult<Option<Row>> {
        let schema = self.schemas.get(table)?;
        let key = schema.validate_key(key)?;
        let row_key: RowKey = (table.to_string(), key);

        for attempt in 1..=MAX_READ_ATTEMPTS {
            let generation = {
                let mut state = self.lock()?;
                if let Some(slot) = state.slots.get_mut(&row_key) {
                    if let Some(visible) = slot.entry.visible() {
                        slot.hits += 1;
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(visible);
                    }
                }
                state.generation
            };

            if attempt == 1 {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
            self.durable_reads.fetch_add(1, Ordering::Relaxed);
            let fetched = self.durable.fetch(&schema, &row_key.1).await?;

            let mut state = self.lock()?;
            let stale = state.generation != generation;
            match state.slots.get(&row_key).map(|slot| &slot.entry) {
                Some(entry) => {
                    if let Some(visible) = entry.visible() {
                        return Ok(visible);
                    }
                    if let (false, CachedEntry::Pending(write)) = (stale, entry) {
                        let write = write.clone();
                        let settled = state.settle(row_key.clone(), write, fetched);
                        self.enforce_budget(&mut state, Some(&row_key));
                        return Ok(settled.visible().unwrap_or(None));
                    }
                }
                None if !stale => {
                    let entry = match &fetched {
                        Some(row) => CachedEntry::Present(row.clone()),
                        None => CachedEntry::Absent,
                    };
                    state.put(row_key.clone(), entry);
                    self.enforce_budget(&mut state, Some(&row_key));
                    return Ok(fetched);
                }
                None => {}
            }
            if attempt == MAX_READ_ATTEMPTS {
                tracing::debug!(table, "Returning uncached read after repeated cache churn");
                return Ok(fetched);
            }
        }
        Ok(None)
    }

    /// Resolve the durable base of a pending entry with one lookup.
    async fn resolve_base(&self, schema: &TableSchema, row_key: &RowKey) -> KilnResult<()> {
        self.durable_reads.fetch_add(1, Ordering::Relaxed);
        let fetched = self.durable.fetch(schema, &row_key.1).await?;
        let mut state = self.lock()?;
        let write = match state.slots.get(row_key) {
            Some(Slot {
                entry: CachedEntry::Pending(write),
                ..
            }) if write.base == Base::Unknown => write.clone(),
            _ => return Ok(()),
        };
        state.settle(row_key.clone(), write, fetched);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Record an insert.
    ///
    /// Never fails for a key collision: if the cache already shows a row
    /// for the key, a [`PendingError`] is recorded and reported at the next
    /// flush; otherwise the durable store detects the collision at flush.
    pub async fn insert(&self, table: &str, row: Row, origin: &WriteOrigin) -> KilnResult<()> {
        let schema = self.schemas.get(table)?;
        let row = schema.validate_row(row)?;
        let row_key: RowKey = (table.to_string(), schema.key_of(&row)?);

        loop {
            {
                let mut state = self.lock()?;
                let seq = state.next_seq();
                let current = state.slots.get(&row_key).map(|s| &s.entry);
                match entry::compose_insert(&schema, current, row.clone(), origin, seq) {
                    Composed::Entry(entry) => {
                        state.put(row_key, entry);
                        self.after_write(&mut state);
                        return Ok(());
                    }
                    Composed::Unchanged => return Ok(()),
                    Composed::Collision => {
                        tracing::debug!(
                            table,
                            key = %row_key.1,
                            event = %origin.event,
                            function = %origin.function,
                            "Insert collides with cached row; deferring error"
                        );
                        state.deferred_errors.push(PendingError {
                            event: origin.event,
                            function: origin.function.clone(),
                            table: table.to_string(),
                            key: row_key.1,
                            detected_at: DetectedAt::Cache,
                        });
                        return Ok(());
                    }
                    Composed::NeedsBase => {}
                }
            }
            self.resolve_base(&schema, &row_key).await?;
        }
    }

    /// Record a patch to an existing row. No effect if the row does not exist.
    pub fn update(
        &self,
        table: &str,
        key: PrimaryKey,
        patch: Patch,
        origin: &WriteOrigin,
    ) -> KilnResult<()> {
        let schema = self.schemas.get(table)?;
        let key = schema.validate_key(key)?;
        let patch = schema.validate_patch(patch)?;
        let row_key: RowKey = (table.to_string(), key.clone());

        let mut state = self.lock()?;
        let seq = state.next_seq();
        let current = state.slots.get(&row_key).map(|s| &s.entry);
        if let Composed::Entry(entry) = entry::compose_update(current, key, patch, origin, seq) {
            state.put(row_key, entry);
            self.after_write(&mut state);
        }
        Ok(())
    }

    /// Record an insert that applies `on_conflict` to the existing row
    /// instead of failing.
    pub fn upsert(
        &self,
        table: &str,
        row: Row,
        on_conflict: Patch,
        origin: &WriteOrigin,
    ) -> KilnResult<()> {
        let schema = self.schemas.get(table)?;
        let row = schema.validate_row(row)?;
        let on_conflict = schema.validate_patch(on_conflict)?;
        let row_key: RowKey = (table.to_string(), schema.key_of(&row)?);

        let mut state = self.lock()?;
        let seq = state.next_seq();
        let current = state.slots.get(&row_key).map(|s| &s.entry);
        if let Composed::Entry(entry) =
            entry::compose_upsert(&schema, current, row, on_conflict, origin, seq)
        {
            state.put(row_key, entry);
            self.after_write(&mut state);
        }
        Ok(())
    }

    /// Record a delete. Reads of the key return `None` until the next write.
    pub fn delete(&self, table: &str, key: PrimaryKey, origin: &WriteOrigin) -> KilnResult<()> {
        let schema = self.schemas.get(table)?;
        let key = schema.validate_key(key)?;
        let row_key: RowKey = (table.to_string(), key.clone());

        let mut state = self.lock()?;
        let seq = state.next_seq();
        let current = state.slots.get(&row_key).map(|s| &s.entry);
        if let Composed::Entry(entry) = entry::compose_delete(current, key, origin, seq) {
            state.put(row_key, entry);
            self.after_write(&mut state);
        }
        Ok(())
    }

    fn after_write(&self, state: &mut BufferState) {
        self.enforce_budget(state, None);
        if state.pending.len() >= self.config.flush_size_threshold
            || state.memory_bytes > self.config.memory_budget_bytes
        {
            self.flush_needed.notify_one();
        }
    }

    /// Over budget: evict clean slots now, sparing `keep`. Pending slots
    /// stay until a flush publishes them; the caller requests that flush.
    fn enforce_budget(&self, state: &mut BufferState, keep: Option<&RowKey>) {
        if state.memory_bytes <= self.config.memory_budget_bytes {
            return;
        }
        let evicted = self.evict_locked(state, keep);
        if state.memory_bytes > self.config.memory_budget_bytes {
            self.flush_needed.notify_one();
        }
        if evicted > 0 {
            tracing::trace!(evicted, memory_bytes = state.memory_bytes, "Evicted inline over budget");
        }
    }

    /// Replace the set of keys the next batch is predicted to read.
    pub fn set_retain(&self, retain: HashSet<RowKey>) -> KilnResult<()> {
        self.lock()?.retain = retain;
        Ok(())
    }
}
