//! The durable store seam.
//!
//! The buffered store talks to the relational store only through
//! [`DurableStore`]: point and batched lookups for cache misses and
//! prefetches, a bulk-load path for insert groups, and batched statements
//! for everything else.

use async_trait::async_trait;
use kiln_core::{KilnResult, Patch, PrimaryKey, Row, TableSchema};

/// One net write for one key, as transmitted to the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Fails with a collision if the key exists.
    Insert { row: Row },
    /// Patches the row if it exists; no effect otherwise.
    Update { key: PrimaryKey, patch: Patch },
    /// Inserts `row`, or applies `on_conflict` to the existing row.
    Upsert { row: Row, on_conflict: Patch },
    Delete { key: PrimaryKey },
}

impl WriteOp {
    pub fn estimated_size(&self) -> usize {
        match self {
            WriteOp::Insert { row } => row.estimated_size(),
            WriteOp::Update { key, patch } => key.estimated_size() + patch.estimated_size(),
            WriteOp::Upsert { row, on_conflict } => {
                row.estimated_size() + on_conflict.estimated_size()
            }
            WriteOp::Delete { key } => key.estimated_size(),
        }
    }
}

/// Durable relational store used behind the buffered store.
///
/// Implementations must be safe to call concurrently: the prefetcher issues
/// lookups while a flush is transmitting.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Point lookup.
    async fn fetch(&self, schema: &TableSchema, key: &PrimaryKey) -> KilnResult<Option<Row>>;

    /// Batched lookup; rows that do not exist are simply absent from the
    /// result.
    async fn fetch_many(&self, schema: &TableSchema, keys: &[PrimaryKey]) -> KilnResult<Vec<Row>> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = self.fetch(schema, key).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Bulk-load a group of inserts.
    ///
    /// Rows whose key already exists are *not* written and their keys are
    /// returned; every other row commits. Only failures unrelated to key
    /// collisions are reported as errors, in which case nothing committed.
    async fn bulk_insert(&self, schema: &TableSchema, rows: &[Row]) -> KilnResult<Vec<PrimaryKey>>;

    /// Apply updates, upserts and deletes atomically.
    async fn apply(&self, schema: &TableSchema, ops: &[WriteOp]) -> KilnResult<()>;
}
