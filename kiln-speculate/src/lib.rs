//! Kiln Speculate - Speculative Access Engine
//!
//! Learns which rows and external requests each transform function needs
//! ([`AccessProfiler`]), turns those templates into concrete predictions for
//! an upcoming batch ([`Predictor`]), and resolves the predictions ahead of
//! demand ([`Prefetcher`]) into the buffered store and the
//! [`ResponseCache`].

pub mod predictor;
pub mod prefetcher;
pub mod profiler;
pub mod provider;
pub mod response_cache;

pub use predictor::{EventRouter, Prediction, PredictionSet, PredictionTarget, Predictor};
pub use prefetcher::{PrefetchHandle, PrefetchReport, Prefetcher};
pub use profiler::{AccessProfiler, AccessTarget, AccessTemplate, Source};
pub use provider::{ExternalProvider, JsonRpcProvider};
pub use response_cache::{ResponseCache, ResponseCacheStats};
