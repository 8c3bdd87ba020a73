//! Error channel exposed to the pipeline's owner.
//!
//! Deferred errors arrive after the event that caused them has already been
//! processed, so they are delivered on a channel rather than returned from
//! the call that recorded the write. The sink also keeps counters the
//! pipeline consults before accepting the next batch.

use kiln_core::{FlushFailure, PendingError, TransformError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An error surfaced asynchronously by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A primary-key collision attributed to the write that caused it.
    Constraint(PendingError),
    /// A flush that exhausted its retries.
    Fatal(FlushFailure),
    /// A transform function returned an error.
    Transform(TransformError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Constraint(e) => write!(f, "constraint violation: {}", e),
            PipelineError::Fatal(e) => write!(f, "fatal flush failure: {}", e),
            PipelineError::Transform(e) => write!(f, "{}", e),
        }
    }
}

#[derive(Debug, Default)]
struct SinkState {
    constraints: AtomicU64,
    fatal: AtomicBool,
}

/// Sending side of the error channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<PipelineError>,
    state: Arc<SinkState>,
}

impl ErrorSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                state: Arc::new(SinkState::default()),
            },
            rx,
        )
    }

    pub fn report(&self, error: PipelineError) {
        match &error {
            PipelineError::Constraint(e) => {
                self.state.constraints.fetch_add(1, Ordering::SeqCst);
                tracing::error!(
                    table = %e.table,
                    key = %e.key,
                    event = %e.event,
                    function = %e.function,
                    "Constraint violation"
                );
            }
            PipelineError::Fatal(failure) => {
                self.state.fatal.store(true, Ordering::SeqCst);
                tracing::error!(
                    attempts = failure.attempts,
                    unflushed_writes = failure.unflushed_writes,
                    error = %failure.error,
                    "Flush failed permanently"
                );
            }
            PipelineError::Transform(e) => {
                tracing::error!(error = %e, "Transform function failed");
            }
        }
        // The owner may have dropped the receiver; the counters still apply.
        let _ = self.tx.send(error);
    }

    pub fn report_constraints(&self, errors: impl IntoIterator<Item = PendingError>) {
        for error in errors {
            self.report(PipelineError::Constraint(error));
        }
    }

    pub fn constraint_violations(&self) -> u64 {
        self.state.constraints.load(Ordering::SeqCst)
    }

    pub fn has_fatal(&self) -> bool {
        self.state.fatal.load(Ordering::SeqCst)
    }
}
