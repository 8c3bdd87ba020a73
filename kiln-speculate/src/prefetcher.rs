//! Prefetcher: resolves a batch's predictions ahead of demand.
//!
//! Row predictions become batched durable-store lookups whose results are
//! installed into the buffered store; request predictions become batched
//! provider calls whose responses land in the [`ResponseCache`]. Every
//! failure is logged and dropped: a missed prefetch only means the transform
//! function takes the synchronous path.

use kiln_core::{ExternalRequest, KilnResult, PrimaryKey, Row, SpeculationConfig, StorageError};
use kiln_storage::BufferedStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::predictor::{PredictionSet, PredictionTarget};
use crate::provider::ExternalProvider;
use crate::response_cache::ResponseCache;

/// Outcome of one prefetch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefetchReport {
    /// Row keys looked up in the durable store.
    pub rows_requested: usize,
    /// Lookups installed into the cache, including known-absent keys.
    pub rows_installed: usize,
    /// Requests sent to the provider.
    pub requests_issued: usize,
    pub responses_cached: usize,
    /// Lookup chunks or individual requests that failed or timed out.
    pub failures: usize,
    pub duration: Duration,
}

impl PrefetchReport {
    fn absorb(&mut self, other: PrefetchReport) {
        self.rows_requested += other.rows_requested;
        self.rows_installed += other.rows_installed;
        self.requests_issued += other.requests_issued;
        self.responses_cached += other.responses_cached;
        self.failures += other.failures;
    }
}

/// A running prefetch. Dropping the handle leaves the task running.
#[derive(Debug)]
pub struct PrefetchHandle {
    task: JoinHandle<PrefetchReport>,
}

impl PrefetchHandle {
    /// Abandon the prefetch; results not yet installed are discarded.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for completion. `None` if the task was aborted.
    pub async fn join(self) -> Option<PrefetchReport> {
        self.task.await.ok()
    }

    /// Wait at most `limit`. Hands the handle back if the prefetch is
    /// still running.
    pub async fn wait(mut self, limit: Duration) -> Result<Option<PrefetchReport>, PrefetchHandle> {
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(joined) => Ok(joined.ok()),
            Err(_) => Err(self),
        }
    }
}

#[derive(Clone)]
pub struct Prefetcher {
    store: Arc<BufferedStore>,
    responses: Arc<ResponseCache>,
    provider: Option<Arc<dyn ExternalProvider>>,
    batch_size: usize,
    concurrency: usize,
    timeout: Duration,
}

impl Prefetcher {
    pub fn new(
        store: Arc<BufferedStore>,
        responses: Arc<ResponseCache>,
        provider: Option<Arc<dyn ExternalProvider>>,
        config: &SpeculationConfig,
    ) -> Self {
        Self {
            store,
            responses,
            provider,
            batch_size: config.prefetch_batch_size.max(1),
            concurrency: config.prefetch_concurrency.max(1),
            timeout: config.prefetch_timeout,
        }
    }

    /// Run `predictions` on a background task.
    pub fn spawn(&self, predictions: PredictionSet) -> PrefetchHandle {
        let prefetcher = self.clone();
        PrefetchHandle {
            task: tokio::spawn(async move { prefetcher.run(&predictions).await }),
        }
    }

    /// Resolve `predictions`, returning what was fetched.
    pub async fn run(&self, predictions: &PredictionSet) -> PrefetchReport {
        let start = Instant::now();
        let (rows, requests) = tokio::join!(
            self.prefetch_rows(predictions),
            self.prefetch_requests(predictions)
        );

        let mut report = rows;
        report.absorb(requests);
        report.duration = start.elapsed();
        tracing::debug!(
            rows_requested = report.rows_requested,
            rows_installed = report.rows_installed,
            requests_issued = report.requests_issued,
            responses_cached = report.responses_cached,
            failures = report.failures,
            duration_ms = report.duration.as_millis() as u64,
            "Prefetch complete"
        );
        report
    }

    async fn prefetch_rows(&self, predictions: &PredictionSet) -> PrefetchReport {
        let mut by_table: BTreeMap<String, Vec<PrimaryKey>> = BTreeMap::new();
        for prediction in predictions.rows() {
            if let PredictionTarget::Row { table, key } = &prediction.target {
                if !self.store.is_cached(table, key) {
                    by_table.entry(table.clone()).or_default().push(key.clone());
                }
            }
        }

        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (table, keys) in by_table {
            for chunk in keys.chunks(self.batch_size) {
                let prefetcher = self.clone();
                let limiter = limiter.clone();
                let table = table.clone();
                let chunk = chunk.to_vec();
                tasks.spawn(async move {
                    let Ok(_permit) = limiter.acquire_owned().await else {
                        return PrefetchReport::default();
                    };
                    prefetcher.fetch_chunk(&table, chunk).await
                });
            }
        }
        collect(tasks).await
    }

    async fn fetch_chunk(&self, table: &str, keys: Vec<PrimaryKey>) -> PrefetchReport {
        let mut report = PrefetchReport {
            rows_requested: keys.len(),
            ..PrefetchReport::default()
        };
        let epoch = self.store.read_epoch();
        match self.lookup(table, &keys).await {
            Ok(found) => {
                for key in keys {
                    let row = found.get(&key).cloned();
                    match self.store.populate(table, key, row, epoch) {
                        Ok(true) => report.rows_installed += 1,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::debug!(table, error = %e, "Prefetch install failed");
                            report.failures += 1;
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(table, keys = report.rows_requested, error = %e, "Prefetch lookup failed");
                report.failures += 1;
            }
        }
        report
    }

    async fn lookup(&self, table: &str, keys: &[PrimaryKey]) -> KilnResult<HashMap<PrimaryKey, Row>> {
        let schema = self.store.schema(table)?;
        let rows = tokio::time::timeout(self.timeout, self.store.durable().fetch_many(&schema, keys))
            .await
            .map_err(|_| StorageError::Timeout {
                operation: format!("prefetch {}", table),
            })??;
        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            found.insert(schema.key_of(&row)?, row);
        }
        Ok(found)
    }

    async fn prefetch_requests(&self, predictions: &PredictionSet) -> PrefetchReport {
        let Some(provider) = self.provider.clone() else {
            return PrefetchReport::default();
        };
        let pending: Vec<ExternalRequest> = predictions
            .requests()
            .iter()
            .filter_map(|p| match &p.target {
                PredictionTarget::Request(request) => Some(request.clone()),
                PredictionTarget::Row { .. } => None,
            })
            .filter(|request| !self.responses.contains(&request.fingerprint()))
            .collect();

        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for chunk in pending.chunks(self.batch_size) {
            let provider = provider.clone();
            let responses = self.responses.clone();
            let limiter = limiter.clone();
            let chunk = chunk.to_vec();
            let timeout = self.timeout;
            tasks.spawn(async move {
                let Ok(_permit) = limiter.acquire_owned().await else {
                    return PrefetchReport::default();
                };
                call_chunk(provider.as_ref(), &responses, chunk, timeout).await
            });
        }
        collect(tasks).await
    }
}

async fn call_chunk(
    provider: &dyn ExternalProvider,
    responses: &ResponseCache,
    chunk: Vec<ExternalRequest>,
    timeout: Duration,
) -> PrefetchReport {
    let mut report = PrefetchReport {
        requests_issued: chunk.len(),
        ..PrefetchReport::default()
    };
    match tokio::time::timeout(timeout, provider.call_batch(&chunk)).await {
        Ok(results) => {
            for (request, result) in chunk.iter().zip(results) {
                match result {
                    Ok(value) => {
                        responses.insert(request.fingerprint(), value, true);
                        report.responses_cached += 1;
                    }
                    Err(e) => {
                        tracing::trace!(method = %request.method, error = %e, "Prefetch request failed");
                        report.failures += 1;
                    }
                }
            }
        }
        Err(_) => {
            tracing::debug!(
                provider = provider.name(),
                requests = chunk.len(),
                "Prefetch batch timed out"
            );
            report.failures += chunk.len();
        }
    }
    report
}

async fn collect(mut tasks: JoinSet<PrefetchReport>) -> PrefetchReport {
    let mut report = PrefetchReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(chunk) => report.absorb(chunk),
            Err(e) => {
                tracing::debug!(error = %e, "Prefetch task did not complete");
                report.failures += 1;
            }
        }
    }
    report
}

impl std::fmt::Debug for Prefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefetcher")
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .field("provider", &self.provider.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}
