//! Background flush scheduler.
//!
//! Flushes the buffered store on a fixed interval, whenever the store asks
//! for it (size threshold or memory budget), and at the end of every batch.
//! A flush that has started always runs to completion; shutdown is only
//! observed between flushes, after any flush already requested.

use kiln_storage::BufferedStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::errors::{ErrorSink, PipelineError};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for flush activity since the scheduler started.
#[derive(Debug, Default)]
pub struct FlushMetrics {
    pub cycles: AtomicU64,
    /// Cycles that found nothing to send.
    pub idle_cycles: AtomicU64,
    pub writes_committed: AtomicU64,
    pub constraint_errors: AtomicU64,
    pub failures: AtomicU64,
}

impl FlushMetrics {
    pub fn snapshot(&self) -> FlushSnapshot {
        FlushSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            idle_cycles: self.idle_cycles.load(Ordering::Relaxed),
            writes_committed: self.writes_committed.load(Ordering::Relaxed),
            constraint_errors: self.constraint_errors.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSnapshot {
    pub cycles: u64,
    pub idle_cycles: u64,
    pub writes_committed: u64,
    pub constraint_errors: u64,
    pub failures: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Handle to the running flush task.
#[derive(Debug)]
pub struct FlushScheduler {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    end_of_batch: Arc<Notify>,
    metrics: Arc<FlushMetrics>,
}

impl FlushScheduler {
    /// Spawn the flush task on the current runtime.
    pub fn spawn(store: Arc<BufferedStore>, errors: ErrorSink, flush_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let end_of_batch = Arc::new(Notify::new());
        let metrics = Arc::new(FlushMetrics::default());
        let task = tokio::spawn(flush_task(
            store,
            errors,
            flush_interval,
            end_of_batch.clone(),
            metrics.clone(),
            shutdown_rx,
        ));
        Self {
            task,
            shutdown_tx,
            end_of_batch,
            metrics,
        }
    }

    /// Request a flush for the batch that just finished executing.
    pub fn signal_end_of_batch(&self) {
        self.end_of_batch.notify_one();
    }

    pub fn metrics(&self) -> FlushSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the task, letting an in-flight flush finish first.
    pub async fn shutdown(self) -> FlushSnapshot {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Flush task ended abnormally");
        }
        self.metrics.snapshot()
    }
}

async fn flush_task(
    store: Arc<BufferedStore>,
    errors: ErrorSink,
    flush_interval: Duration,
    end_of_batch: Arc<Notify>,
    metrics: Arc<FlushMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        flush_interval_ms = flush_interval.as_millis() as u64,
        "Flush scheduler started"
    );

    loop {
        tokio::select! {
            // Flush requests already signalled are served before shutdown.
            biased;

            _ = end_of_batch.notified() => {
                flush_once(&store, &errors, &metrics, "end_of_batch").await;
            }

            _ = store.flush_needed().notified() => {
                flush_once(&store, &errors, &metrics, "threshold").await;
            }

            _ = ticker.tick() => {
                flush_once(&store, &errors, &metrics, "interval").await;
            }

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Flush scheduler shutting down");
                    break;
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        writes_committed = snapshot.writes_committed,
        constraint_errors = snapshot.constraint_errors,
        failures = snapshot.failures,
        "Flush scheduler stopped"
    );
}

/// Run one flush and route its results.
async fn flush_once(store: &BufferedStore, errors: &ErrorSink, metrics: &FlushMetrics, trigger: &str) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);
    match store.flush().await {
        Ok(outcome) if outcome.is_empty() => {
            metrics.idle_cycles.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(trigger, "Flush cycle found nothing to send");
        }
        Ok(outcome) => {
            metrics
                .writes_committed
                .fetch_add(outcome.committed as u64, Ordering::Relaxed);
            metrics
                .constraint_errors
                .fetch_add(outcome.errors.len() as u64, Ordering::Relaxed);
            tracing::info!(
                trigger,
                groups = outcome.groups,
                writes = outcome.writes,
                committed = outcome.committed,
                errors = outcome.errors.len(),
                duration_ms = outcome.duration.as_millis() as u64,
                "Flush cycle completed"
            );
            errors.report_constraints(outcome.errors);
        }
        Err(failure) => {
            metrics.failures.fetch_add(1, Ordering::Relaxed);
            errors.report(PipelineError::Fatal(failure));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{
        BufferConfig, ColumnDef, ColumnType, EventId, FunctionId, RetryConfig, Row,
        SchemaRegistry, TableSchema, WriteOrigin,
    };
    use kiln_storage::InMemoryStore;

    fn store(threshold: usize) -> (Arc<InMemoryStore>, Arc<BufferedStore>) {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                TableSchema::new(
                    "tokens",
                    vec![
                        ColumnDef::new("id", ColumnType::Int),
                        ColumnDef::new("owner", ColumnType::Text),
                    ],
                    vec!["id".into()],
                )
                .unwrap(),
            )
            .unwrap();
        let durable = Arc::new(InMemoryStore::new());
        let config = BufferConfig {
            flush_size_threshold: threshold,
            ..BufferConfig::default()
        };
        let store = Arc::new(BufferedStore::new(
            durable.clone(),
            Arc::new(registry),
            config,
            RetryConfig::default(),
        ));
        (durable, store)
    }

    fn origin(n: u64) -> WriteOrigin {
        WriteOrigin::new(EventId::new(n, 0), FunctionId::new("on_mint"))
    }

    fn token(id: i64) -> Row {
        Row::new("tokens").with("id", id).with("owner", "0xa")
    }

    #[tokio::test]
    async fn test_end_of_batch_signal_flushes() {
        let (durable, store) = store(10_000);
        let (sink, _rx) = ErrorSink::channel();
        let scheduler = FlushScheduler::spawn(store.clone(), sink, Duration::from_secs(3600));

        store.insert("tokens", token(1), &origin(1)).await.unwrap();
        scheduler.signal_end_of_batch();

        let snapshot = scheduler.shutdown().await;
        assert!(snapshot.cycles >= 1);
        assert_eq!(durable.row_count("tokens"), 1);
    }

    #[tokio::test]
    async fn test_size_threshold_flushes() {
        let (durable, store) = store(2);
        let (sink, _rx) = ErrorSink::channel();
        let scheduler = FlushScheduler::spawn(store.clone(), sink, Duration::from_secs(3600));

        store.insert("tokens", token(1), &origin(1)).await.unwrap();
        store.insert("tokens", token(2), &origin(2)).await.unwrap();
        for _ in 0..100 {
            if durable.row_count("tokens") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(durable.row_count("tokens"), 2);
        assert_eq!(scheduler.shutdown().await.writes_committed, 2);
    }

    #[tokio::test]
    async fn test_constraint_errors_reach_channel() {
        let (durable, store) = store(10_000);
        let schema = store.schema("tokens").unwrap();
        durable.seed(&schema, token(5)).unwrap();
        let (sink, mut rx) = ErrorSink::channel();
        let scheduler = FlushScheduler::spawn(store.clone(), sink.clone(), Duration::from_secs(3600));

        store.insert("tokens", token(5), &origin(9)).await.unwrap();
        scheduler.signal_end_of_batch();

        match rx.recv().await {
            Some(PipelineError::Constraint(e)) => assert_eq!(e.event, EventId::new(9, 0)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sink.constraint_violations(), 1);
        scheduler.shutdown().await;
    }
}
