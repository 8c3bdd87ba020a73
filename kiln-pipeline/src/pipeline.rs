//! Batch orchestration.
//!
//! Events run strictly in arrival order on the caller's task. Prediction,
//! prefetching and flushing happen around that single ordered queue and
//! never reorder it.

use async_trait::async_trait;
use kiln_core::{Event, KilnConfig, KilnError, KilnResult, RowKey, SchemaRegistry, TransformError};
use kiln_speculate::{
    AccessProfiler, ExternalProvider, PrefetchHandle, PrefetchReport, Prefetcher, PredictionSet,
    Predictor, ResponseCache, ResponseCacheStats,
};
use kiln_storage::{BufferedStore, CacheStats, DurableStore, FlushOutcome};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::errors::{ErrorSink, PipelineError};
use crate::scheduler::{FlushScheduler, FlushSnapshot};
use crate::transform::{HandlerRegistry, TransformContext};

/// Batches a cached response may go untouched before it is swept.
const RESPONSE_MAX_AGE_BATCHES: u64 = 2;

/// Flush-and-evict rounds attempted before a batch is admitted anyway.
const MAX_BACKPRESSURE_ROUNDS: usize = 5;

const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(10);

/// Supplies ordered, non-overlapping batches of events.
#[async_trait]
pub trait BatchSource: Send {
    /// The next batch, or `None` once the source is exhausted.
    async fn next_batch(&mut self) -> KilnResult<Option<Vec<Event>>>;
}

/// A source over batches already in memory.
#[derive(Debug, Default)]
pub struct VecSource {
    batches: VecDeque<Vec<Event>>,
}

impl VecSource {
    pub fn new(batches: impl IntoIterator<Item = Vec<Event>>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
        }
    }
}

#[async_trait]
impl BatchSource for VecSource {
    async fn next_batch(&mut self) -> KilnResult<Option<Vec<Event>>> {
        Ok(self.batches.pop_front())
    }
}

/// What happened while processing one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub events: usize,
    pub invocations: usize,
    pub predicted_rows: usize,
    pub predicted_requests: usize,
    /// Present when the batch's prefetch finished before execution began.
    pub prefetch: Option<PrefetchReport>,
    /// Whether the batch was held back by memory pressure.
    pub throttled: bool,
    pub duration: Duration,
}

/// Totals for [`Pipeline::run`].
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub batches: usize,
    pub events: usize,
    pub invocations: usize,
    pub throttled_batches: usize,
    pub duration: Duration,
}

impl RunReport {
    fn record(&mut self, batch: &BatchReport) {
        self.batches += 1;
        self.events += batch.events;
        self.invocations += batch.invocations;
        if batch.throttled {
            self.throttled_batches += 1;
        }
    }
}

/// Final state returned by [`Pipeline::shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub flush: FlushSnapshot,
    /// The final drain.
    pub drained: FlushOutcome,
    pub cache: CacheStats,
    pub responses: ResponseCacheStats,
    pub constraint_violations: u64,
}

struct Speculation {
    profiler: Arc<AccessProfiler>,
    predictor: Predictor,
    prefetcher: Prefetcher,
    lead: Duration,
}

/// The transform stage: buffered store, speculation engine and flush
/// scheduler wired around an ordered executor.
pub struct Pipeline {
    config: KilnConfig,
    store: Arc<BufferedStore>,
    handlers: HandlerRegistry,
    responses: Arc<ResponseCache>,
    provider: Option<Arc<dyn ExternalProvider>>,
    speculation: Option<Speculation>,
    scheduler: FlushScheduler,
    errors: ErrorSink,
    /// Prefetch for the batch being executed.
    current: Option<PrefetchHandle>,
    /// Prefetch started early for the batch after it.
    ahead: Option<PrefetchHandle>,
    halted: Option<String>,
    batches: u64,
}

impl Pipeline {
    /// Build a pipeline and start its flush scheduler. Must be called from
    /// within a tokio runtime.
    ///
    /// Returns the receiving end of the error channel alongside the
    /// pipeline. Deferred errors are delivered there even after the batch
    /// that caused them has completed.
    pub fn new(
        config: KilnConfig,
        durable: Arc<dyn DurableStore>,
        schemas: Arc<SchemaRegistry>,
        handlers: HandlerRegistry,
        provider: Option<Arc<dyn ExternalProvider>>,
    ) -> KilnResult<(Self, mpsc::UnboundedReceiver<PipelineError>)> {
        config.validate()?;

        let store = Arc::new(BufferedStore::new(
            durable,
            schemas.clone(),
            config.buffer.clone(),
            config.retry.clone(),
        ));
        let responses = Arc::new(ResponseCache::new(
            config.speculation.response_cache_capacity,
        ));
        let speculation = config.speculation.enabled.then(|| {
            let profiler = Arc::new(AccessProfiler::new(&config.speculation));
            Speculation {
                predictor: Predictor::new(
                    profiler.clone(),
                    schemas.clone(),
                    config.speculation.external_confidence_threshold,
                ),
                prefetcher: Prefetcher::new(
                    store.clone(),
                    responses.clone(),
                    provider.clone(),
                    &config.speculation,
                ),
                lead: config.speculation.prefetch_lead,
                profiler,
            }
        });

        let (errors, rx) = ErrorSink::channel();
        let scheduler =
            FlushScheduler::spawn(store.clone(), errors.clone(), config.buffer.flush_interval);

        tracing::info!(
            durable = store.durable().name(),
            tables = schemas.len(),
            speculation = speculation.is_some(),
            provider = provider.as_ref().map(|p| p.name()).unwrap_or("none"),
            memory_budget_bytes = config.buffer.memory_budget_bytes,
            "Pipeline started"
        );

        Ok((
            Self {
                config,
                store,
                handlers,
                responses,
                provider,
                speculation,
                scheduler,
                errors,
                current: None,
                ahead: None,
                halted: None,
                batches: 0,
            },
            rx,
        ))
    }

    pub fn store(&self) -> &Arc<BufferedStore> {
        &self.store
    }

    pub fn responses(&self) -> &Arc<ResponseCache> {
        &self.responses
    }

    pub fn profiler(&self) -> Option<&Arc<AccessProfiler>> {
        self.speculation.as_ref().map(|s| &s.profiler)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Predict accesses for `events` without prefetching them.
    pub fn predict(&self, events: &[Event]) -> PredictionSet {
        match &self.speculation {
            Some(spec) => spec.predictor.predict(events, &self.handlers),
            None => PredictionSet::new(),
        }
    }

    /// Process one batch: predict, prefetch, execute every event in order,
    /// then request a flush.
    pub async fn process_batch(&mut self, batch: Vec<Event>) -> KilnResult<BatchReport> {
        self.execute(batch, None).await
    }

    /// Drive `source` to exhaustion. The prefetch for each batch is started
    /// before the previous batch executes.
    pub async fn run<S: BatchSource + ?Sized>(&mut self, source: &mut S) -> KilnResult<RunReport> {
        let start = Instant::now();
        let mut report = RunReport::default();
        let mut next = source.next_batch().await?;
        while let Some(batch) = next.take() {
            let upcoming = source.next_batch().await?;
            let batch_report = self.execute(batch, upcoming.as_deref()).await?;
            report.record(&batch_report);
            next = upcoming;
        }
        report.duration = start.elapsed();
        tracing::info!(
            batches = report.batches,
            events = report.events,
            invocations = report.invocations,
            throttled_batches = report.throttled_batches,
            duration_ms = report.duration.as_millis() as u64,
            "Batch source exhausted"
        );
        Ok(report)
    }

    /// Abandon prefetches, stop the scheduler and flush everything still
    /// buffered.
    pub async fn shutdown(mut self) -> KilnResult<ShutdownReport> {
        for handle in [self.current.take(), self.ahead.take()].into_iter().flatten() {
            handle.abort();
        }
        let flush = self.scheduler.shutdown().await;

        let drained = match self.store.drain().await {
            Ok(outcome) => outcome,
            Err(failure) => {
                let error = failure.error.clone();
                self.errors.report(PipelineError::Fatal(failure));
                return Err(KilnError::Storage(error));
            }
        };
        self.errors.report_constraints(drained.errors.iter().cloned());

        let report = ShutdownReport {
            flush,
            drained,
            cache: self.store.stats(),
            responses: self.responses.stats(),
            constraint_violations: self.errors.constraint_violations(),
        };
        tracing::info!(
            batches = self.batches,
            drained_writes = report.drained.committed,
            cache_hit_rate = report.cache.hit_rate(),
            response_hit_rate = report.responses.hit_rate(),
            constraint_violations = report.constraint_violations,
            "Pipeline shut down"
        );
        Ok(report)
    }

    fn check_health(&mut self) -> KilnResult<()> {
        if self.halted.is_none() {
            if self.errors.has_fatal() {
                self.halted = Some("a flush failed permanently".to_string());
            } else if self.config.pipeline.halt_on_constraint_violation
                && self.errors.constraint_violations() > 0
            {
                self.halted = Some(format!(
                    "{} constraint violation(s) reported",
                    self.errors.constraint_violations()
                ));
            }
        }
        match &self.halted {
            Some(reason) => Err(KilnError::Transform(TransformError::Halted {
                reason: reason.clone(),
            })),
            None => Ok(()),
        }
    }

    async fn execute(&mut self, batch: Vec<Event>, upcoming: Option<&[Event]>) -> KilnResult<BatchReport> {
        self.check_health()?;
        let start = Instant::now();

        let predictions = self.predict(&batch);
        let retain = predictions.retain_set();
        self.store.set_retain(retain.clone())?;
        let throttled = self.apply_backpressure(&retain).await?;

        let mut prefetch = None;
        if let Some(spec) = &self.speculation {
            if let Some(stale) = self.current.take() {
                stale.abort();
            }
            let handle = match self.ahead.take() {
                Some(handle) => handle,
                None => spec.prefetcher.spawn(predictions.clone()),
            };
            match handle.wait(spec.lead).await {
                Ok(report) => prefetch = report,
                Err(running) => self.current = Some(running),
            }
            if let Some(upcoming) = upcoming {
                let ahead = spec.predictor.predict(upcoming, &self.handlers);
                self.ahead = Some(spec.prefetcher.spawn(ahead));
            }
        }

        let mut invocations = 0;
        for event in &batch {
            for handler in self.handlers.handlers_for(event) {
                let ctx = TransformContext::new(
                    self.store.clone(),
                    self.responses.clone(),
                    self.provider.clone(),
                    self.speculation.as_ref().map(|s| s.profiler.clone()),
                    event,
                    handler.function.clone(),
                );
                invocations += 1;
                if let Err(e) = handler.transform.call(&ctx, event).await {
                    let failure = TransformError::Failed {
                        function: handler.function.clone(),
                        event: event.id,
                        reason: e.to_string(),
                    };
                    self.halted = Some(failure.to_string());
                    self.errors.report(PipelineError::Transform(failure.clone()));
                    self.scheduler.signal_end_of_batch();
                    return Err(KilnError::Transform(failure));
                }
            }
        }

        self.scheduler.signal_end_of_batch();
        if let Some(finished) = self.current.take() {
            finished.abort();
        }
        self.responses.advance_batch();
        self.responses.sweep(RESPONSE_MAX_AGE_BATCHES);
        self.batches += 1;

        let report = BatchReport {
            events: batch.len(),
            invocations,
            predicted_rows: predictions.rows().len(),
            predicted_requests: predictions.requests().len(),
            prefetch,
            throttled,
            duration: start.elapsed(),
        };
        tracing::debug!(
            batch = self.batches,
            events = report.events,
            invocations = report.invocations,
            predicted_rows = report.predicted_rows,
            predicted_requests = report.predicted_requests,
            prefetched = report.prefetch.is_some(),
            throttled = report.throttled,
            duration_ms = report.duration.as_millis() as u64,
            "Batch processed"
        );
        Ok(report)
    }

    /// Hold the batch back while the store is over its memory budget.
    /// Returns whether any relief was needed.
    async fn apply_backpressure(&self, retain: &HashSet<RowKey>) -> KilnResult<bool> {
        let mut throttled = false;
        for _ in 0..MAX_BACKPRESSURE_ROUNDS {
            match self.store.relieve_pressure(retain).await {
                Ok(None) => return Ok(throttled),
                Ok(Some(relief)) => {
                    throttled = true;
                    self.errors.report_constraints(relief.flushed.errors);
                    if !self.store.over_budget() {
                        return Ok(true);
                    }
                }
                Err(failure) => {
                    let error = failure.error.clone();
                    self.errors.report(PipelineError::Fatal(failure));
                    return Err(KilnError::Storage(error));
                }
            }
            // In-flight flush groups cannot be evicted until they land.
            tokio::time::sleep(BACKPRESSURE_PAUSE).await;
        }
        tracing::warn!(
            memory_bytes = self.store.memory_bytes(),
            budget = self.config.buffer.memory_budget_bytes,
            "Admitting batch while still over memory budget"
        );
        Ok(throttled)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store)
            .field("handlers", &self.handlers)
            .field("speculation", &self.speculation.is_some())
            .field("batches", &self.batches)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}
