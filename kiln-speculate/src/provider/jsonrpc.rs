//! JSON-RPC 2.0 provider for chain node calls.

use super::{invalid_response, request_failed, unavailable, ExternalProvider};
use async_trait::async_trait;
use kiln_core::{ExternalRequest, KilnError, KilnResult, ProviderError, Value};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const PROVIDER: &str = "jsonrpc";

#[derive(Debug, Clone, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// JSON-RPC client submitting requests as batches over HTTP.
pub struct JsonRpcProvider {
    client: Client,
    url: String,
    next_id: AtomicU64,
    limiter: Arc<Semaphore>,
}

impl JsonRpcProvider {
    /// Create a provider for `url` with a 30 second request timeout and at
    /// most 16 concurrent HTTP requests.
    pub fn new(url: impl Into<String>) -> KilnResult<Self> {
        Self::with_options(url, Duration::from_secs(30), 16)
    }

    pub fn with_options(
        url: impl Into<String>,
        timeout: Duration,
        max_concurrent: usize,
    ) -> KilnResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| unavailable(PROVIDER, format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    fn encode<'a>(&self, requests: &'a [ExternalRequest]) -> Vec<RpcRequest<'a>> {
        requests
            .iter()
            .map(|r| RpcRequest {
                jsonrpc: "2.0",
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                method: &r.method,
                params: r.params.iter().map(Value::to_json).collect(),
            })
            .collect()
    }

    async fn post(&self, body: &[RpcRequest<'_>]) -> KilnResult<Vec<RpcResponse>> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| unavailable(PROVIDER, format!("Rate limiter error: {}", e)))?;

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT => unavailable(PROVIDER, format!("{}: {}", status, text)),
                _ => request_failed(PROVIDER, i64::from(status.as_u16()), text),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| invalid_response(PROVIDER, format!("Failed to parse response: {}", e)))?;
        parse_batch(body)
    }
}

fn transport_error(err: reqwest::Error) -> KilnError {
    if err.is_timeout() {
        ProviderError::Timeout {
            provider: PROVIDER.to_string(),
        }
        .into()
    } else {
        unavailable(PROVIDER, format!("HTTP request failed: {}", err))
    }
}

/// Nodes answer a batch with an array, but some answer a single-element
/// batch (or a batch-level error) with a bare object.
fn parse_batch(body: serde_json::Value) -> KilnResult<Vec<RpcResponse>> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| invalid_response(PROVIDER, format!("Malformed response item: {}", e)))
        })
        .collect()
}

/// Match responses to request ids, in request order.
fn match_responses(ids: &[u64], responses: Vec<RpcResponse>) -> Vec<KilnResult<serde_json::Value>> {
    let mut by_id: HashMap<u64, RpcResponse> = HashMap::with_capacity(responses.len());
    let mut batch_error = None;
    for response in responses {
        match response.id {
            Some(id) => {
                by_id.insert(id, response);
            }
            None => batch_error = response.error,
        }
    }

    ids.iter()
        .map(|id| match by_id.remove(id) {
            Some(RpcResponse {
                error: Some(error), ..
            }) => Err(request_failed(PROVIDER, error.code, error.message)),
            Some(RpcResponse {
                result: Some(result),
                ..
            }) => Ok(result),
            Some(_) => Ok(serde_json::Value::Null),
            None => Err(match &batch_error {
                Some(error) => request_failed(PROVIDER, error.code, error.message.clone()),
                None => invalid_response(PROVIDER, format!("No response for request id {}", id)),
            }),
        })
        .collect()
}

#[async_trait]
impl ExternalProvider for JsonRpcProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn call(&self, request: &ExternalRequest) -> KilnResult<serde_json::Value> {
        let mut results = self.call_batch(std::slice::from_ref(request)).await;
        results
            .pop()
            .unwrap_or_else(|| Err(invalid_response(PROVIDER, "Empty batch response")))
    }

    async fn call_batch(&self, requests: &[ExternalRequest]) -> Vec<KilnResult<serde_json::Value>> {
        if requests.is_empty() {
            return Vec::new();
        }
        let body = self.encode(requests);
        let ids: Vec<u64> = body.iter().map(|r| r.id).collect();
        match self.post(&body).await {
            Ok(responses) => match_responses(&ids, responses),
            Err(e) => {
                tracing::debug!(requests = requests.len(), error = %e, "JSON-RPC batch failed");
                ids.iter().map(|_| Err(e.clone())).collect()
            }
        }
    }
}

impl std::fmt::Debug for JsonRpcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcProvider")
            .field("url", &self.url)
            .finish()
    }
}
