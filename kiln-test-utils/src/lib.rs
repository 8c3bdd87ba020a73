//! Kiln Test Utilities
//!
//! Shared test infrastructure for the kiln workspace:
//! - Proptest generators for values, keys and events
//! - An instrumented mock external provider
//! - Fixtures for an ERC-20 style `balances` table and transfer events
//! - Custom assertions for deferred errors

pub use kiln_core::{
    BufferConfig, ColumnDef, ColumnType, Event, EventId, ExternalRequest, FunctionId, KilnConfig,
    KilnError, KilnResult, PendingError, PrimaryKey, ProviderError, RetryConfig, Row,
    SchemaRegistry, TableSchema, Value, WriteOrigin,
};
pub use kiln_storage::{BufferedStore, InMemoryStore};

use async_trait::async_trait;
use kiln_speculate::ExternalProvider;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK PROVIDER
// ============================================================================

/// Mock external provider.
///
/// Answers every request with `{"method": .., "params": [..]}`, records the
/// requests it saw, and can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MockProvider {
    calls: AtomicUsize,
    batches: AtomicUsize,
    failing: AtomicBool,
    seen: Mutex<Vec<ExternalRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let provider = Self::default();
        provider.set_failing(true);
        provider
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Individual requests answered or failed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `call_batch` invocations.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<ExternalRequest> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// The response this provider gives for `request`.
    pub fn response_for(request: &ExternalRequest) -> serde_json::Value {
        serde_json::json!({
            "method": request.method,
            "params": request.params.iter().map(Value::to_json).collect::<Vec<_>>(),
        })
    }
}

#[async_trait]
impl ExternalProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn call(&self, request: &ExternalRequest) -> KilnResult<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable {
                provider: "mock".to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(Self::response_for(request))
    }

    async fn call_batch(&self, requests: &[ExternalRequest]) -> Vec<KilnResult<serde_json::Value>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.call(request).await);
        }
        results
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    /// Lower-case hex address.
    pub fn arb_address() -> impl Strategy<Value = String> {
        "0x[0-9a-f]{40}"
    }

    pub fn arb_event_id() -> impl Strategy<Value = EventId> {
        (0u64..10_000_000, 0u32..512).prop_map(|(block, index)| EventId::new(block, index))
    }

    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[0-9]{1,78}".prop_map(Value::Numeric),
            "[a-zA-Z0-9 ]{0,32}".prop_map(Value::Text),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        ]
    }

    /// A transfer between two distinct addresses.
    pub fn arb_transfer() -> impl Strategy<Value = Event> {
        (arb_event_id(), arb_address(), arb_address(), 1u64..1_000_000)
            .prop_filter("distinct parties", |(_, from, to, _)| from != to)
            .prop_map(|(id, from, to, value)| fixtures::transfer(id, &from, &to, value))
    }

    /// A batch of transfers in strictly increasing event order.
    pub fn arb_transfer_batch(max: usize) -> impl Strategy<Value = Vec<Event>> {
        prop::collection::vec((arb_address(), arb_address(), 1u64..1_000_000), 1..max).prop_map(
            |parties| {
                parties
                    .into_iter()
                    .enumerate()
                    .map(|(i, (from, to, value))| {
                        fixtures::transfer(EventId::new(1 + i as u64, 0), &from, &to, value)
                    })
                    .collect()
            },
        )
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    pub const TOKEN: &str = "0x00000000000000000000000000000000000000aa";

    /// `balances(holder text primary key, amount numeric, updated_at int null)`.
    pub fn balances_schema() -> TableSchema {
        TableSchema::new(
            "balances",
            vec![
                ColumnDef::new("holder", ColumnType::Text),
                ColumnDef::new("amount", ColumnType::Numeric),
                ColumnDef::new("updated_at", ColumnType::Int).nullable(),
            ],
            vec!["holder".to_string()],
        )
        .expect("balances schema is valid")
    }

    /// `transfers(block int, log_index int, from text, to text, value numeric)`
    /// keyed by (block, log_index).
    pub fn transfers_schema() -> TableSchema {
        TableSchema::new(
            "transfers",
            vec![
                ColumnDef::new("block", ColumnType::Int),
                ColumnDef::new("log_index", ColumnType::Int),
                ColumnDef::new("from", ColumnType::Text),
                ColumnDef::new("to", ColumnType::Text),
                ColumnDef::new("value", ColumnType::Numeric),
            ],
            vec!["block".to_string(), "log_index".to_string()],
        )
        .expect("transfers schema is valid")
    }

    pub fn registry() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(balances_schema())
            .expect("fresh registry");
        registry
            .register(transfers_schema())
            .expect("fresh registry");
        Arc::new(registry)
    }

    pub fn balance(holder: &str, amount: i64) -> Row {
        Row::new("balances")
            .with("holder", holder)
            .with("amount", Value::Numeric(amount.to_string()))
            .with("updated_at", Value::Null)
    }

    pub fn transfer(id: EventId, from: &str, to: &str, value: u64) -> Event {
        Event::new(
            id,
            "Transfer",
            TOKEN,
            serde_json::json!({"args": {"from": from, "to": to, "value": value}}),
        )
    }

    pub fn origin(event: EventId, function: &str) -> WriteOrigin {
        WriteOrigin::new(event, FunctionId::new(function))
    }

    /// A buffered store over a fresh in-memory durable store holding the
    /// given balances.
    pub fn buffered_store(
        config: BufferConfig,
        retry: RetryConfig,
        seed: &[(&str, i64)],
    ) -> (Arc<InMemoryStore>, Arc<BufferedStore>) {
        let registry = registry();
        let durable = Arc::new(InMemoryStore::new());
        let schema = registry.get("balances").expect("registered above");
        for (holder, amount) in seed {
            durable
                .seed(&schema, balance(holder, *amount))
                .expect("seed row is valid");
        }
        let store = Arc::new(BufferedStore::new(durable.clone(), registry, config, retry));
        (durable, store)
    }

    /// Retry policy that gives up quickly.
    pub fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(2),
            backoff_multiplier: 1.0,
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// Assert that `error` blames `function` while handling `event`.
    pub fn assert_attributed(error: &PendingError, event: EventId, function: &str) {
        assert_eq!(error.event, event, "wrong event in {}", error);
        assert_eq!(error.function.as_str(), function, "wrong function in {}", error);
    }

    pub fn assert_transient<T: std::fmt::Debug>(result: &KilnResult<T>) {
        match result {
            Err(e) => assert!(e.is_transient(), "expected transient error, got {}", e),
            Ok(v) => panic!("expected error, got {:?}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_mock_provider_counts_and_fails() {
        let provider = MockProvider::new();
        let request = ExternalRequest::new("eth_chainId", vec![]);
        let value = provider.call(&request).await.unwrap();
        assert_eq!(value["method"], "eth_chainId");

        provider.set_failing(true);
        let results = provider.call_batch(&[request.clone(), request]).await;
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.batches(), 1);
    }

    #[test]
    fn test_fixtures_validate() {
        let registry = fixtures::registry();
        let schema = registry.get("balances").unwrap();
        assert!(schema.validate_row(fixtures::balance("0xa", 5)).is_ok());
    }

    proptest! {
        #[test]
        fn prop_transfers_resolve_parties(event in generators::arb_transfer()) {
            let from = event.field(&kiln_core::FieldPath::new("args.from"));
            let to = event.field(&kiln_core::FieldPath::new("args.to"));
            prop_assert!(from.is_some());
            prop_assert_ne!(from, to);
        }
    }
}
