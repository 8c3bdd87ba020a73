//! Error types for kiln operations

use crate::{ColumnType, EventId, FunctionId, PrimaryKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Durable store and buffered store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Durable store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Durable store operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Durable store rejected write to {table}: {reason}")]
    Rejected { table: String, reason: String },

    #[error("Failed to decode column {column} of {table}: {reason}")]
    Decode {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Flush failed after {attempts} attempts: {reason}")]
    FlushFailed { attempts: u32, reason: String },

    #[error("Buffered store is halted: {reason}")]
    Halted { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// External request/response provider errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("Request to {provider} timed out")]
    Timeout { provider: String },

    #[error("Request to {provider} failed with code {code}: {message}")]
    RequestFailed {
        provider: String,
        code: i64,
        message: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Schema and row validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown table: {table}")]
    UnknownTable { table: String },

    #[error("Table already registered: {table}")]
    DuplicateTable { table: String },

    #[error("Invalid schema for {table}: {reason}")]
    InvalidSchema { table: String, reason: String },

    #[error("Unknown column {column} in {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Missing required column {column} in {table}")]
    MissingColumn { table: String, column: String },

    #[error("Type mismatch for {table}.{column}: expected {expected}, got {got}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: ColumnType,
        got: String,
    },

    #[error("Primary key column {column} of {table} cannot be patched")]
    KeyColumnPatched { table: String, column: String },

    #[error("Primary key for {table} has {got} components, expected {expected}")]
    KeyArity {
        table: String,
        expected: usize,
        got: usize,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Errors raised by user transform functions or the executor around them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("Function {function} failed on event {event}: {reason}")]
    Failed {
        function: FunctionId,
        event: EventId,
        reason: String,
    },

    #[error("Pipeline halted: {reason}")]
    Halted { reason: String },
}

/// Master error type for all kiln errors.
#[derive(Debug, Clone, Error)]
pub enum KilnError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),
}

impl KilnError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Connectivity loss and timeouts are transient; everything the remote
    /// side actively rejected, and every local validation failure, is not.
    pub fn is_transient(&self) -> bool {
        match self {
            KilnError::Storage(StorageError::Unavailable { .. })
            | KilnError::Storage(StorageError::Timeout { .. }) => true,
            KilnError::Provider(ProviderError::Unavailable { .. })
            | KilnError::Provider(ProviderError::Timeout { .. }) => true,
            _ => false,
        }
    }
}

/// Result type alias for kiln operations.
pub type KilnResult<T> = Result<T, KilnError>;

// ============================================================================
// DEFERRED ERRORS
// ============================================================================

/// Where a constraint violation was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectedAt {
    /// The cache already held a row for the key when the insert was recorded.
    Cache,
    /// The durable store reported a collision while the flush was applied.
    DurableStore,
}

/// A primary-key collision attributed to the write that caused it.
///
/// Pending errors are never raised by the mutating call itself; they are
/// surfaced when the flush group containing the write is transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingError {
    pub event: EventId,
    pub function: FunctionId,
    pub table: String,
    pub key: PrimaryKey,
    pub detected_at: DetectedAt,
}

impl fmt::Display for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let site = match self.detected_at {
            DetectedAt::Cache => "in cache",
            DetectedAt::DurableStore => "by durable store",
        };
        write!(
            f,
            "duplicate primary key {} in table {} (detected {}); inserted by function {} while processing event {}",
            self.key, self.table, site, self.function, self.event
        )
    }
}

/// A flush that could not be completed within the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushFailure {
    pub attempts: u32,
    /// Writes in the failed group; they remain parked for the next flush.
    pub unflushed_writes: usize,
    pub tables: Vec<String>,
    pub error: StorageError,
}

impl fmt::Display for FlushFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flush of {} writes to [{}] failed after {} attempts: {}",
            self.unflushed_writes,
            self.tables.join(", "),
            self.attempts,
            self.error
        )
    }
}

impl From<FlushFailure> for KilnError {
    fn from(failure: FlushFailure) -> Self {
        KilnError::Storage(StorageError::FlushFailed {
            attempts: failure.attempts,
            reason: failure.to_string(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
