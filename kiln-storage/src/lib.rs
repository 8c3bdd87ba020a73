//! Kiln Storage - Buffered Store and Durable Stores
//!
//! The [`BufferedStore`] absorbs the reads and writes transform functions
//! issue and persists writes in bulk. It reaches the relational store only
//! through the [`DurableStore`] trait, implemented here for PostgreSQL and
//! for an in-memory reference store used by tests and local runs.

pub mod buffer;
pub mod durable;
pub mod memory;
pub mod postgres;

pub use buffer::{
    Base, BufferedStore, CacheStats, CachedEntry, FlushOutcome, PendingWrite, PressureRelief,
};
pub use durable::{DurableStore, WriteOp};
pub use memory::InMemoryStore;
pub use postgres::{PgConfig, PostgresStore};
