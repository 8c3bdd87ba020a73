//! Configuration types
//!
//! The transform stage consumes configuration; it never reads files or the
//! environment on its own. Callers build a [`KilnConfig`] (usually via
//! [`KilnConfig::from_toml_str`]) and must [`validate`](KilnConfig::validate)
//! it before starting a pipeline. Durations are written in milliseconds.

use crate::{ConfigError, KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Buffered store sizing and flush triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Estimated cache footprint that forces an out-of-cycle flush and eviction.
    pub memory_budget_bytes: usize,
    /// Fraction of the budget eviction shrinks the cache to.
    pub eviction_target_ratio: f64,
    /// Number of pending writes that triggers a flush.
    pub flush_size_threshold: usize,
    /// Interval between background flushes.
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 256 * 1024 * 1024,
            eviction_target_ratio: 0.75,
            flush_size_threshold: 10_000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Retry policy for transient flush failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Profiler, predictor and prefetcher tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculationConfig {
    pub enabled: bool,
    /// Minimum confidence before an external request is issued speculatively.
    pub external_confidence_threshold: f64,
    /// Minimum confidence before a template is used for row predictions.
    pub row_confidence_floor: f64,
    /// Observations a template needs before it is eligible at all.
    pub min_observations: u64,
    /// Samples kept per key column when estimating confidence.
    pub observation_window: usize,
    /// Keys per batched durable-store lookup.
    pub prefetch_batch_size: usize,
    /// Concurrent prefetch requests in flight.
    pub prefetch_concurrency: usize,
    #[serde(with = "duration_ms")]
    pub prefetch_timeout: Duration,
    /// How long a batch waits for its own prefetch before executing.
    /// Zero starts the batch immediately; unfinished prefetches keep
    /// running alongside it.
    #[serde(with = "duration_ms")]
    pub prefetch_lead: Duration,
    /// Maximum cached external responses.
    pub response_cache_capacity: usize,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            external_confidence_threshold: 0.8,
            row_confidence_floor: 0.0,
            min_observations: 3,
            observation_window: 32,
            prefetch_batch_size: 256,
            prefetch_concurrency: 8,
            prefetch_timeout: Duration::from_secs(10),
            prefetch_lead: Duration::ZERO,
            response_cache_capacity: 100_000,
        }
    }
}

/// Orchestration policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stop accepting batches once a constraint violation is reported.
    pub halt_on_constraint_violation: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            halt_on_constraint_violation: true,
        }
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub buffer: BufferConfig,
    pub retry: RetryConfig,
    pub speculation: SpeculationConfig,
    pub pipeline: PipelineConfig,
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> KilnError {
    KilnError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn check_ratio(field: &str, value: f64) -> KilnResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, value, "must be between 0.0 and 1.0"));
    }
    Ok(())
}

impl KilnConfig {
    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml_str(source: &str) -> KilnResult<Self> {
        toml::from_str(source).map_err(|e| {
            KilnError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.buffer.memory_budget_bytes = bytes;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.buffer.flush_interval = interval;
        self
    }

    pub fn with_flush_size_threshold(mut self, threshold: usize) -> Self {
        self.buffer.flush_size_threshold = threshold;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_speculation(mut self, enabled: bool) -> Self {
        self.speculation.enabled = enabled;
        self
    }

    pub fn with_external_threshold(mut self, threshold: f64) -> Self {
        self.speculation.external_confidence_threshold = threshold;
        self
    }

    pub fn with_min_observations(mut self, n: u64) -> Self {
        self.speculation.min_observations = n;
        self
    }

    pub fn with_prefetch_lead(mut self, lead: Duration) -> Self {
        self.speculation.prefetch_lead = lead;
        self
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(KilnError::Config) if invalid.
    pub fn validate(&self) -> KilnResult<()> {
        if self.buffer.memory_budget_bytes == 0 {
            return Err(invalid(
                "buffer.memory_budget_bytes",
                self.buffer.memory_budget_bytes,
                "memory budget must be greater than 0",
            ));
        }
        if self.buffer.eviction_target_ratio <= 0.0 || self.buffer.eviction_target_ratio > 1.0 {
            return Err(invalid(
                "buffer.eviction_target_ratio",
                self.buffer.eviction_target_ratio,
                "must be in (0.0, 1.0]",
            ));
        }
        if self.buffer.flush_size_threshold == 0 {
            return Err(invalid(
                "buffer.flush_size_threshold",
                self.buffer.flush_size_threshold,
                "flush size threshold must be greater than 0",
            ));
        }
        if self.buffer.flush_interval.is_zero() {
            return Err(invalid(
                "buffer.flush_interval",
                format!("{:?}", self.buffer.flush_interval),
                "flush interval must be positive",
            ));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "backoff multiplier must be at least 1.0",
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(invalid(
                "retry.initial_backoff",
                format!("{:?}", self.retry.initial_backoff),
                "initial backoff must not exceed max backoff",
            ));
        }

        check_ratio(
            "speculation.external_confidence_threshold",
            self.speculation.external_confidence_threshold,
        )?;
        check_ratio(
            "speculation.row_confidence_floor",
            self.speculation.row_confidence_floor,
        )?;
        if self.speculation.observation_window == 0 {
            return Err(invalid(
                "speculation.observation_window",
                self.speculation.observation_window,
                "observation window must be greater than 0",
            ));
        }
        if self.speculation.prefetch_batch_size == 0 {
            return Err(invalid(
                "speculation.prefetch_batch_size",
                self.speculation.prefetch_batch_size,
                "prefetch batch size must be greater than 0",
            ));
        }
        if self.speculation.prefetch_concurrency == 0 {
            return Err(invalid(
                "speculation.prefetch_concurrency",
                self.speculation.prefetch_concurrency,
                "prefetch concurrency must be greater than 0",
            ));
        }
        if self.speculation.prefetch_timeout.is_zero() {
            return Err(invalid(
                "speculation.prefetch_timeout",
                format!("{:?}", self.speculation.prefetch_timeout),
                "prefetch timeout must be positive",
            ));
        }
        if self.speculation.response_cache_capacity == 0 {
            return Err(invalid(
                "speculation.response_cache_capacity",
                self.speculation.response_cache_capacity,
                "response cache capacity must be greater than 0",
            ));
        }

        Ok(())
    }
}
