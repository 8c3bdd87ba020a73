//! Kiln Core - Data Model
//!
//! Shared types for the transform stage: typed values, rows and schemas,
//! chain events, external requests, the error taxonomy and configuration.
//! This crate contains no I/O.

pub mod config;
pub mod error;
pub mod event;
pub mod request;
pub mod row;
pub mod schema;
pub mod value;

pub use config::{BufferConfig, KilnConfig, PipelineConfig, RetryConfig, SpeculationConfig};
pub use error::{
    ConfigError, DetectedAt, FlushFailure, KilnError, KilnResult, PendingError, ProviderError,
    StorageError, TransformError, ValidationError,
};
pub use event::{Event, EventId, FieldPath, FunctionId};
pub use request::{ExternalRequest, RequestFingerprint};
pub use row::{Patch, PrimaryKey, Row};
pub use schema::{ColumnDef, SchemaRegistry, TableSchema};
pub use value::{ColumnType, Value};

/// Cache identity of a row: table name plus primary key.
pub type RowKey = (String, PrimaryKey);

/// Origin of a write, kept for error attribution.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WriteOrigin {
    pub event: EventId,
    pub function: FunctionId,
}

impl WriteOrigin {
    pub fn new(event: EventId, function: FunctionId) -> Self {
        Self { event, function }
    }
}
