//! Transform functions and the context they run in.

use async_trait::async_trait;
use kiln_core::{
    ConfigError, Event, ExternalRequest, FunctionId, KilnError, KilnResult, Patch, PrimaryKey,
    ProviderError, Row, WriteOrigin,
};
use kiln_speculate::{AccessProfiler, AccessTarget, EventRouter, ExternalProvider, ResponseCache};
use kiln_storage::BufferedStore;
use std::collections::HashMap;
use std::sync::Arc;

/// User transform logic, invoked once per matching event in arrival order.
#[async_trait]
pub trait TransformFn: Send + Sync {
    async fn call(&self, ctx: &TransformContext, event: &Event) -> KilnResult<()>;
}

/// A registered transform function.
#[derive(Clone)]
pub struct Handler {
    pub function: FunctionId,
    pub transform: Arc<dyn TransformFn>,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("function", &self.function)
            .finish()
    }
}

/// Routes event names to transform functions, in registration order.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transform` as `function` for events named `event_name`.
    pub fn register(
        &mut self,
        event_name: impl Into<String>,
        function: impl Into<FunctionId>,
        transform: Arc<dyn TransformFn>,
    ) -> KilnResult<()> {
        let event_name = event_name.into();
        let function = function.into();
        let handlers = self.handlers.entry(event_name.clone()).or_default();
        if handlers.iter().any(|h| h.function == function) {
            return Err(KilnError::Config(ConfigError::InvalidValue {
                field: format!("handlers.{}", event_name),
                value: function.to_string(),
                reason: "function already registered for this event".to_string(),
            }));
        }
        handlers.push(Handler {
            function,
            transform,
        });
        Ok(())
    }

    pub fn handlers_for(&self, event: &Event) -> &[Handler] {
        self.handlers
            .get(&event.name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl EventRouter for HandlerRegistry {
    fn functions_for(&self, event: &Event) -> Vec<FunctionId> {
        self.handlers_for(event)
            .iter()
            .map(|h| h.function.clone())
            .collect()
    }
}

/// Everything a transform function may touch while handling one event.
///
/// Reads and writes go through the buffered store, external requests
/// through the response cache. Each successful access is reported to the
/// profiler so later batches can be prefetched.
pub struct TransformContext {
    store: Arc<BufferedStore>,
    responses: Arc<ResponseCache>,
    provider: Option<Arc<dyn ExternalProvider>>,
    profiler: Option<Arc<AccessProfiler>>,
    event: Event,
    origin: WriteOrigin,
    invocation: u64,
}

impl TransformContext {
    pub(crate) fn new(
        store: Arc<BufferedStore>,
        responses: Arc<ResponseCache>,
        provider: Option<Arc<dyn ExternalProvider>>,
        profiler: Option<Arc<AccessProfiler>>,
        event: &Event,
        function: FunctionId,
    ) -> Self {
        let invocation = profiler
            .as_ref()
            .map(|p| p.begin_invocation(&function))
            .unwrap_or(0);
        Self {
            store,
            responses,
            provider,
            profiler,
            origin: WriteOrigin::new(event.id, function),
            event: event.clone(),
            invocation,
        }
    }

    pub fn function(&self) -> &FunctionId {
        &self.origin.function
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    fn record(&self, target: AccessTarget, values: &[kiln_core::Value]) {
        if let Some(profiler) = &self.profiler {
            profiler.observe(&self.origin.function, self.invocation, target, values, &self.event);
        }
    }

    fn record_row(&self, table: &str, key: &PrimaryKey) {
        self.record(AccessTarget::Table(table.to_string()), key.components());
    }

    pub async fn find(&self, table: &str, key: impl Into<PrimaryKey>) -> KilnResult<Option<Row>> {
        let key = key.into();
        let row = self.store.find(table, key.clone()).await?;
        self.record_row(table, &key);
        Ok(row)
    }

    pub async fn insert(&self, table: &str, row: Row) -> KilnResult<()> {
        let key = self.store.schema(table)?.key_of(&row).ok();
        self.store.insert(table, row, &self.origin).await?;
        if let Some(key) = key {
            self.record_row(table, &key);
        }
        Ok(())
    }

    pub fn update(&self, table: &str, key: impl Into<PrimaryKey>, patch: Patch) -> KilnResult<()> {
        let key = key.into();
        self.store.update(table, key.clone(), patch, &self.origin)?;
        self.record_row(table, &key);
        Ok(())
    }

    pub fn upsert(&self, table: &str, row: Row, on_conflict: Patch) -> KilnResult<()> {
        let key = self.store.schema(table)?.key_of(&row).ok();
        self.store.upsert(table, row, on_conflict, &self.origin)?;
        if let Some(key) = key {
            self.record_row(table, &key);
        }
        Ok(())
    }

    pub fn delete(&self, table: &str, key: impl Into<PrimaryKey>) -> KilnResult<()> {
        let key = key.into();
        self.store.delete(table, key.clone(), &self.origin)?;
        self.record_row(table, &key);
        Ok(())
    }

    /// Issue an external request, served from the response cache when it
    /// was prefetched or made earlier.
    pub async fn request(&self, request: &ExternalRequest) -> KilnResult<serde_json::Value> {
        let provider = self.provider.as_deref().ok_or_else(|| {
            KilnError::Provider(ProviderError::Unavailable {
                provider: "none".to_string(),
                reason: "no external provider configured".to_string(),
            })
        })?;
        let value = self.responses.get_or_fetch(request, provider).await?;
        self.record(AccessTarget::Request(request.method.clone()), &request.params);
        Ok(value)
    }
}

impl std::fmt::Debug for TransformContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformContext")
            .field("event", &self.event.id)
            .field("function", &self.origin.function)
            .field("profiling", &self.profiler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{EventId, SpeculationConfig};

    struct Noop;

    #[async_trait]
    impl TransformFn for Noop {
        async fn call(&self, _ctx: &TransformContext, _event: &Event) -> KilnResult<()> {
            Ok(())
        }
    }

    fn event(name: &str) -> Event {
        Event::new(EventId::new(1, 0), name, "0xtoken", serde_json::json!({}))
    }

    #[test]
    fn test_registry_routes_in_registration_order() {
        let mut registry = HandlerRegistry::new();
        registry.register("Transfer", "debit", Arc::new(Noop)).unwrap();
        registry.register("Transfer", "credit", Arc::new(Noop)).unwrap();
        registry.register("Approval", "allowance", Arc::new(Noop)).unwrap();

        assert_eq!(
            registry.functions_for(&event("Transfer")),
            vec![FunctionId::new("debit"), FunctionId::new("credit")]
        );
        assert!(registry.functions_for(&event("Mint")).is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("Transfer", "debit", Arc::new(Noop)).unwrap();
        let err = registry.register("Transfer", "debit", Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, KilnError::Config(_)));
    }

    #[test]
    fn test_context_counts_invocations() {
        let profiler = Arc::new(AccessProfiler::new(&SpeculationConfig::default()));
        let store = Arc::new(BufferedStore::new(
            Arc::new(kiln_storage::InMemoryStore::new()),
            Arc::new(kiln_core::SchemaRegistry::new()),
            kiln_core::BufferConfig::default(),
            kiln_core::RetryConfig::default(),
        ));
        let responses = Arc::new(ResponseCache::new(4));
        for _ in 0..3 {
            TransformContext::new(
                store.clone(),
                responses.clone(),
                None,
                Some(profiler.clone()),
                &event("Transfer"),
                FunctionId::new("debit"),
            );
        }
        assert_eq!(profiler.invocations(&FunctionId::new("debit")), 3);
    }

    #[tokio::test]
    async fn test_request_without_provider_fails() {
        let store = Arc::new(BufferedStore::new(
            Arc::new(kiln_storage::InMemoryStore::new()),
            Arc::new(kiln_core::SchemaRegistry::new()),
            kiln_core::BufferConfig::default(),
            kiln_core::RetryConfig::default(),
        ));
        let ctx = TransformContext::new(
            store,
            Arc::new(ResponseCache::new(4)),
            None,
            None,
            &event("Transfer"),
            FunctionId::new("debit"),
        );
        let err = ctx
            .request(&ExternalRequest::new("eth_chainId", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Provider(_)));
    }
}
