//! Kiln Pipeline - Ordered Transform Execution
//!
//! Wires the buffered store and the speculation engine around a strictly
//! ordered executor:
//!
//! - [`TransformFn`] and [`HandlerRegistry`]: user logic routed by event name
//! - [`TransformContext`]: the reads, writes and requests a function may issue
//! - [`FlushScheduler`]: background flushing on interval, threshold and batch end
//! - [`ErrorSink`]: the asynchronous error channel for deferred failures
//! - [`Pipeline`]: per-batch predict, prefetch, execute, flush

pub mod errors;
pub mod pipeline;
pub mod scheduler;
pub mod transform;

pub use errors::{ErrorSink, PipelineError};
pub use pipeline::{BatchReport, BatchSource, Pipeline, RunReport, ShutdownReport, VecSource};
pub use scheduler::{FlushMetrics, FlushScheduler, FlushSnapshot};
pub use transform::{Handler, HandlerRegistry, TransformContext, TransformFn};
