//! Cached entries and pending writes.
//!
//! A pending write always holds the *net* operation for its key within the
//! current unflushed window together with the durable state it applies to
//! (its base). Composition rules keep "apply the net op to the base" equal
//! to "apply every recorded op in order", so exactly one operation per key
//! is transmitted at flush time.

use kiln_core::{Patch, Row, TableSchema, WriteOrigin};

use crate::durable::WriteOp;

/// Durable state a pending write applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Base {
    /// The row as the durable store holds it (or will, once in-flight
    /// flushes commit).
    Known(Option<Row>),
    /// Never read; resolved on demand with one durable lookup.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub op: WriteOp,
    pub base: Base,
    pub origin: WriteOrigin,
    /// An insert recorded over an unread base and since composed into
    /// another operation. If the base turns out to hold a row, that insert
    /// collided and is reported against this origin.
    pub blind_insert: Option<WriteOrigin>,
    /// Monotonic write sequence; orders the flush group.
    pub seq: u64,
}

impl PendingWrite {
    /// The row a reader should observe.
    ///
    /// `None` when the result depends on an unresolved base.
    pub fn visible(&self) -> Option<Option<Row>> {
        match (&self.op, &self.base) {
            (WriteOp::Insert { row }, _) => Some(Some(row.clone())),
            (WriteOp::Delete { .. }, _) => Some(None),
            (WriteOp::Update { patch, .. }, Base::Known(base)) => {
                Some(base.as_ref().map(|row| row.patched(patch)))
            }
            (WriteOp::Upsert { row, on_conflict }, Base::Known(base)) => Some(Some(match base {
                Some(existing) => existing.patched(on_conflict),
                None => row.clone(),
            })),
            (_, Base::Unknown) => None,
        }
    }

    /// Whether a durable read must happen before this write can be sent.
    pub fn needs_base(&self) -> bool {
        self.base == Base::Unknown && (self.blind_insert.is_some() || self.visible().is_none())
    }

    /// Attach the durable row read for this key.
    ///
    /// Returns the origin of a blind insert the row proves to have collided.
    pub fn settle(&mut self, fetched: Option<Row>) -> Option<WriteOrigin> {
        let exists = fetched.is_some();
        self.base = Base::Known(fetched);
        let blind = self.blind_insert.take();
        if exists {
            blind
        } else {
            None
        }
    }

    pub fn estimated_size(&self) -> usize {
        let base = match &self.base {
            Base::Known(Some(row)) => row.estimated_size(),
            _ => 0,
        };
        self.op.estimated_size() + base
    }
}

/// State of one (table, key) in the buffered store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedEntry {
    /// Known not to exist.
    Absent,
    /// Clean copy of the durable row.
    Present(Row),
    /// Unflushed write.
    Pending(PendingWrite),
}

impl CachedEntry {
    pub fn estimated_size(&self) -> usize {
        match self {
            CachedEntry::Absent => 0,
            CachedEntry::Present(row) => row.estimated_size(),
            CachedEntry::Pending(write) => write.estimated_size(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CachedEntry::Pending(_))
    }

    /// The row a reader should observe, `None` if a base must be fetched.
    pub fn visible(&self) -> Option<Option<Row>> {
        match self {
            CachedEntry::Absent => Some(None),
            CachedEntry::Present(row) => Some(Some(row.clone())),
            CachedEntry::Pending(write) => write.visible(),
        }
    }
}

/// Outcome of recording a mutation against an existing entry.
#[derive(Debug)]
pub(crate) enum Composed {
    /// Replace the entry.
    Entry(CachedEntry),
    /// The mutation has no effect.
    Unchanged,
    /// Insert over a visible row: a deferred constraint violation.
    Collision,
    /// The entry's base must be resolved before the mutation can be composed.
    NeedsBase,
}

fn pending(op: WriteOp, base: Base, origin: &WriteOrigin, seq: u64) -> Composed {
    Composed::Entry(CachedEntry::Pending(PendingWrite {
        op,
        base,
        origin: origin.clone(),
        blind_insert: None,
        seq,
    }))
}

/// Compose `op` over an earlier pending write, carrying its base.
///
/// A net insert keeps the inserting write's origin so durable collisions
/// are attributed to it. An insert over an unread base that becomes any
/// other operation is remembered as blind.
fn recompose(earlier: &PendingWrite, op: WriteOp, origin: &WriteOrigin, seq: u64) -> Composed {
    let stays_insert = matches!(op, WriteOp::Insert { .. });
    let blind_insert = match (&earlier.op, &earlier.base) {
        (WriteOp::Insert { .. }, Base::Unknown) if !stays_insert => Some(earlier.origin.clone()),
        _ => earlier.blind_insert.clone(),
    };
    let origin = if stays_insert {
        earlier.origin.clone()
    } else {
        origin.clone()
    };
    Composed::Entry(CachedEntry::Pending(PendingWrite {
        op,
        base: earlier.base.clone(),
        origin,
        blind_insert,
        seq,
    }))
}

/// Over an unread base an insert may yet collide, so later writes must
/// hold for the existing row as well.
fn is_blind_insert(write: &PendingWrite) -> bool {
    matches!(write.op, WriteOp::Insert { .. }) && write.base == Base::Unknown
}

/// Compose an insert of `row` onto the current entry (`None` = uncached).
pub(crate) fn compose_insert(
    schema: &TableSchema,
    current: Option<&CachedEntry>,
    row: Row,
    origin: &WriteOrigin,
    seq: u64,
) -> Composed {
    match current {
        None => pending(WriteOp::Insert { row }, Base::Unknown, origin, seq),
        Some(CachedEntry::Absent) => pending(WriteOp::Insert { row }, Base::Known(None), origin, seq),
        Some(CachedEntry::Present(_)) => Composed::Collision,
        Some(CachedEntry::Pending(write)) => match write.visible() {
            None => Composed::NeedsBase,
            Some(Some(_)) => Composed::Collision,
            Some(None) => {
                let on_conflict = schema.overwrite_patch(&row);
                recompose(write, WriteOp::Upsert { row, on_conflict }, origin, seq)
            }
        },
    }
}

/// Compose an update onto the current entry.
pub(crate) fn compose_update(
    current: Option<&CachedEntry>,
    key: kiln_core::PrimaryKey,
    patch: Patch,
    origin: &WriteOrigin,
    seq: u64,
) -> Composed {
    match current {
        None => pending(WriteOp::Update { key, patch }, Base::Unknown, origin, seq),
        Some(CachedEntry::Absent) => Composed::Unchanged,
        Some(CachedEntry::Present(row)) => pending(
            WriteOp::Update { key, patch },
            Base::Known(Some(row.clone())),
            origin,
            seq,
        ),
        Some(CachedEntry::Pending(write)) => {
            let op = match &write.op {
                WriteOp::Insert { row } if is_blind_insert(write) => WriteOp::Upsert {
                    row: row.patched(&patch),
                    on_conflict: patch,
                },
                WriteOp::Insert { row } => WriteOp::Insert {
                    row: row.patched(&patch),
                },
                WriteOp::Update { patch: earlier, .. } => {
                    let mut merged = earlier.clone();
                    merged.merge(&patch);
                    WriteOp::Update { key, patch: merged }
                }
                WriteOp::Upsert { row, on_conflict } => {
                    let mut merged = on_conflict.clone();
                    merged.merge(&patch);
                    WriteOp::Upsert {
                        row: row.patched(&patch),
                        on_conflict: merged,
                    }
                }
                WriteOp::Delete { .. } => return Composed::Unchanged,
            };
            recompose(write, op, origin, seq)
        }
    }
}

/// Compose an upsert onto the current entry.
pub(crate) fn compose_upsert(
    schema: &TableSchema,
    current: Option<&CachedEntry>,
    row: Row,
    on_conflict: Patch,
    origin: &WriteOrigin,
    seq: u64,
) -> Composed {
    match current {
        None => pending(WriteOp::Upsert { row, on_conflict }, Base::Unknown, origin, seq),
        Some(CachedEntry::Absent) => pending(
            WriteOp::Upsert { row, on_conflict },
            Base::Known(None),
            origin,
            seq,
        ),
        Some(CachedEntry::Present(existing)) => pending(
            WriteOp::Upsert { row, on_conflict },
            Base::Known(Some(existing.clone())),
            origin,
            seq,
        ),
        Some(CachedEntry::Pending(write)) => {
            let op = match &write.op {
                WriteOp::Insert { row: inserted } if is_blind_insert(write) => WriteOp::Upsert {
                    row: inserted.patched(&on_conflict),
                    on_conflict,
                },
                WriteOp::Insert { row: inserted } => WriteOp::Insert {
                    row: inserted.patched(&on_conflict),
                },
                WriteOp::Update { patch, .. } => {
                    let mut merged = patch.clone();
                    merged.merge(&on_conflict);
                    WriteOp::Upsert {
                        row,
                        on_conflict: merged,
                    }
                }
                WriteOp::Upsert {
                    row: earlier,
                    on_conflict: earlier_conflict,
                } => {
                    let mut merged = earlier_conflict.clone();
                    merged.merge(&on_conflict);
                    WriteOp::Upsert {
                        row: earlier.patched(&on_conflict),
                        on_conflict: merged,
                    }
                }
                WriteOp::Delete { .. } => {
                    let overwrite = schema.overwrite_patch(&row);
                    WriteOp::Upsert {
                        row,
                        on_conflict: overwrite,
                    }
                }
            };
            recompose(write, op, origin, seq)
        }
    }
}

/// Compose a delete onto the current entry.
pub(crate) fn compose_delete(
    current: Option<&CachedEntry>,
    key: kiln_core::PrimaryKey,
    origin: &WriteOrigin,
    seq: u64,
) -> Composed {
    match current {
        None => pending(WriteOp::Delete { key }, Base::Unknown, origin, seq),
        Some(CachedEntry::Absent) => Composed::Unchanged,
        Some(CachedEntry::Present(row)) => pending(
            WriteOp::Delete { key },
            Base::Known(Some(row.clone())),
            origin,
            seq,
        ),
        // Nothing durable to remove: the window only ever created the row.
        Some(CachedEntry::Pending(write)) if write.base == Base::Known(None) => {
            Composed::Entry(CachedEntry::Absent)
        }
        Some(CachedEntry::Pending(write)) => recompose(write, WriteOp::Delete { key }, origin, seq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ColumnDef, ColumnType, EventId, FunctionId, PrimaryKey, Value};

    fn schema() -> TableSchema {
        TableSchema::new(
            "t",
            vec![
                ColumnDef::new("id", ColumnType::Int),
                ColumnDef::new("a", ColumnType::Int),
                ColumnDef::new("b", ColumnType::Int),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    fn row(a: i64, b: i64) -> Row {
        Row::new("t").with("id", 1i64).with("a", a).with("b", b)
    }

    fn origin() -> WriteOrigin {
        WriteOrigin::new(EventId::new(1, 0), FunctionId::new("f"))
    }

    fn entry(c: Composed) -> CachedEntry {
        match c {
            Composed::Entry(e) => e,
            other => panic!("expected entry, got {:?}", other),
        }
    }

    #[test]
    fn test_update_over_insert_stays_insert() {
        let schema = schema();
        let inserted = entry(compose_insert(&schema, Some(&CachedEntry::Absent), row(1, 1), &origin(), 1));
        let updated = entry(compose_update(
            Some(&inserted),
            PrimaryKey::from(1),
            Patch::new().set("a", 5i64),
            &origin(),
            2,
        ));
        match &updated {
            CachedEntry::Pending(w) => assert!(matches!(w.op, WriteOp::Insert { .. })),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(updated.visible(), Some(Some(row(5, 1))));
    }

    #[test]
    fn test_update_over_blind_insert_remembers_inserter() {
        let schema = schema();
        let minter = WriteOrigin::new(EventId::new(1, 0), FunctionId::new("mint"));
        let sender = WriteOrigin::new(EventId::new(2, 0), FunctionId::new("transfer"));
        let inserted = entry(compose_insert(&schema, None, row(1, 1), &minter, 1));
        let updated = entry(compose_update(
            Some(&inserted),
            PrimaryKey::from(1),
            Patch::new().set("a", 5i64),
            &sender,
            2,
        ));
        let CachedEntry::Pending(mut write) = updated else {
            panic!("expected pending write");
        };
        assert!(matches!(write.op, WriteOp::Upsert { .. }));
        assert_eq!(write.blind_insert.as_ref(), Some(&minter));
        assert!(write.needs_base());

        assert_eq!(write.settle(Some(row(3, 3))), Some(minter));
        assert_eq!(write.visible(), Some(Some(row(5, 3))));
        assert!(!write.needs_base());
    }

    #[test]
    fn test_update_over_known_insert_keeps_insert_origin() {
        let schema = schema();
        let minter = WriteOrigin::new(EventId::new(1, 0), FunctionId::new("mint"));
        let sender = WriteOrigin::new(EventId::new(2, 0), FunctionId::new("transfer"));
        let inserted = entry(compose_insert(&schema, Some(&CachedEntry::Absent), row(1, 1), &minter, 1));
        let updated = entry(compose_update(
            Some(&inserted),
            PrimaryKey::from(1),
            Patch::new().set("b", 4i64),
            &sender,
            2,
        ));
        match updated {
            CachedEntry::Pending(w) => {
                assert_eq!(w.origin, minter);
                assert!(w.blind_insert.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_insert_over_present_collides() {
        let schema = schema();
        let present = CachedEntry::Present(row(1, 1));
        assert!(matches!(
            compose_insert(&schema, Some(&present), row(2, 2), &origin(), 1),
            Composed::Collision
        ));
    }

    #[test]
    fn test_insert_after_delete_becomes_overwriting_upsert() {
        let schema = schema();
        let present = CachedEntry::Present(row(1, 1));
        let deleted = entry(compose_delete(Some(&present), PrimaryKey::from(1), &origin(), 1));
        assert_eq!(deleted.visible(), Some(None));

        let reinserted = entry(compose_insert(&schema, Some(&deleted), row(7, 8), &origin(), 2));
        match &reinserted {
            CachedEntry::Pending(w) => assert!(matches!(w.op, WriteOp::Upsert { .. })),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reinserted.visible(), Some(Some(row(7, 8))));
    }

    #[test]
    fn test_delete_of_window_only_insert_is_absent() {
        let schema = schema();
        let inserted = entry(compose_insert(&schema, Some(&CachedEntry::Absent), row(1, 1), &origin(), 1));
        let deleted = entry(compose_delete(Some(&inserted), PrimaryKey::from(1), &origin(), 2));
        assert_eq!(deleted, CachedEntry::Absent);
    }

    #[test]
    fn test_upsert_over_update_merges_patches() {
        let schema = schema();
        let updated = entry(compose_update(
            None,
            PrimaryKey::from(1),
            Patch::new().set("a", 2i64),
            &origin(),
            1,
        ));
        assert_eq!(updated.visible(), None);

        let upserted = entry(compose_upsert(
            &schema,
            Some(&updated),
            row(9, 9),
            Patch::new().set("b", 3i64),
            &origin(),
            2,
        ));
        match upserted {
            CachedEntry::Pending(w) => match w.op {
                WriteOp::Upsert { on_conflict, .. } => {
                    assert_eq!(on_conflict.get("a"), Some(&Value::Int(2)));
                    assert_eq!(on_conflict.get("b"), Some(&Value::Int(3)));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_insert_over_unknown_update_needs_base() {
        let schema = schema();
        let updated = entry(compose_update(
            None,
            PrimaryKey::from(1),
            Patch::new().set("a", 2i64),
            &origin(),
            1,
        ));
        assert!(matches!(
            compose_insert(&schema, Some(&updated), row(1, 1), &origin(), 2),
            Composed::NeedsBase
        ));
    }
}
