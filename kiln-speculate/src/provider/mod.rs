//! External request/response providers.
//!
//! Transform functions reach the chain node (or any other request/response
//! service) only through [`ExternalProvider`]; the prefetcher uses the same
//! seam to issue predicted requests in batches.

pub mod jsonrpc;

pub use jsonrpc::JsonRpcProvider;

use async_trait::async_trait;
use kiln_core::{ExternalRequest, KilnError, KilnResult, ProviderError};

/// A request/response service.
#[async_trait]
pub trait ExternalProvider: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &str;

    /// Issue one request.
    async fn call(&self, request: &ExternalRequest) -> KilnResult<serde_json::Value>;

    /// Issue several requests; results are returned in input order and each
    /// succeeds or fails independently.
    ///
    /// The default issues the requests one by one.
    async fn call_batch(&self, requests: &[ExternalRequest]) -> Vec<KilnResult<serde_json::Value>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.call(request).await);
        }
        results
    }
}

pub(crate) fn request_failed(provider: &str, code: i64, message: impl Into<String>) -> KilnError {
    ProviderError::RequestFailed {
        provider: provider.to_string(),
        code,
        message: message.into(),
    }
    .into()
}

pub(crate) fn invalid_response(provider: &str, reason: impl Into<String>) -> KilnError {
    ProviderError::InvalidResponse {
        provider: provider.to_string(),
        reason: reason.into(),
    }
    .into()
}

pub(crate) fn unavailable(provider: &str, reason: impl Into<String>) -> KilnError {
    ProviderError::Unavailable {
        provider: provider.to_string(),
        reason: reason.into(),
    }
    .into()
}
