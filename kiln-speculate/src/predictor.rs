//! Predictor: instantiates learned access templates against an upcoming
//! batch.

use kiln_core::{
    Event, EventId, ExternalRequest, FunctionId, PrimaryKey, RequestFingerprint, RowKey,
    SchemaRegistry,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::profiler::{AccessProfiler, AccessTarget};

/// Maps an event to the functions that will run for it, in execution order.
pub trait EventRouter: Send + Sync {
    fn functions_for(&self, event: &Event) -> Vec<FunctionId>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictionTarget {
    Row { table: String, key: PrimaryKey },
    Request(ExternalRequest),
}

/// An anticipated access, valid for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub target: PredictionTarget,
    pub confidence: f64,
    /// First event in the batch expected to need it.
    pub event: EventId,
    pub function: FunctionId,
}

/// De-duplicated predictions for one batch.
#[derive(Debug, Clone, Default)]
pub struct PredictionSet {
    rows: Vec<Prediction>,
    requests: Vec<Prediction>,
    row_index: HashMap<RowKey, usize>,
    request_index: HashMap<RequestFingerprint, usize>,
}

impl PredictionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prediction. A repeat of an already predicted row or request
    /// only raises the confidence of the existing one.
    pub fn push(&mut self, prediction: Prediction) {
        let (list, slot) = match &prediction.target {
            PredictionTarget::Row { table, key } => {
                let row_key = (table.clone(), key.clone());
                match self.row_index.get(&row_key) {
                    Some(&i) => (&mut self.rows, Some(i)),
                    None => {
                        self.row_index.insert(row_key, self.rows.len());
                        (&mut self.rows, None)
                    }
                }
            }
            PredictionTarget::Request(request) => {
                let fingerprint = request.fingerprint();
                match self.request_index.get(&fingerprint) {
                    Some(&i) => (&mut self.requests, Some(i)),
                    None => {
                        self.request_index.insert(fingerprint, self.requests.len());
                        (&mut self.requests, None)
                    }
                }
            }
        };
        match slot {
            Some(i) => {
                if prediction.confidence > list[i].confidence {
                    list[i].confidence = prediction.confidence;
                }
            }
            None => list.push(prediction),
        }
    }

    pub fn rows(&self) -> &[Prediction] {
        &self.rows
    }

    pub fn requests(&self) -> &[Prediction] {
        &self.requests
    }

    pub fn contains_row(&self, table: &str, key: &PrimaryKey) -> bool {
        self.row_index.contains_key(&(table.to_string(), key.clone()))
    }

    pub fn contains_request(&self, request: &ExternalRequest) -> bool {
        self.request_index.contains_key(&request.fingerprint())
    }

    /// Cache keys eviction should keep for the coming batch.
    pub fn retain_set(&self) -> HashSet<RowKey> {
        self.row_index.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len() + self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.requests.is_empty()
    }
}

pub struct Predictor {
    profiler: Arc<AccessProfiler>,
    schemas: Arc<SchemaRegistry>,
    external_threshold: f64,
}

impl Predictor {
    pub fn new(
        profiler: Arc<AccessProfiler>,
        schemas: Arc<SchemaRegistry>,
        external_threshold: f64,
    ) -> Self {
        Self {
            profiler,
            schemas,
            external_threshold,
        }
    }

    /// Predict the accesses of an upcoming batch.
    ///
    /// Row predictions come from every eligible template; request
    /// predictions only from templates at or above the external threshold.
    /// Keys that do not validate against their table schema are dropped.
    pub fn predict(&self, events: &[Event], router: &dyn EventRouter) -> PredictionSet {
        let mut set = PredictionSet::new();
        let mut templates = HashMap::new();
        let mut gated = 0usize;

        for event in events {
            for function in router.functions_for(event) {
                let eligible = templates
                    .entry(function.clone())
                    .or_insert_with(|| self.profiler.eligible(&function));
                for template in eligible.iter() {
                    let Some(values) = template.instantiate(event) else {
                        continue;
                    };
                    let target = match &template.target {
                        AccessTarget::Table(table) => {
                            let key = self
                                .schemas
                                .get(table)
                                .and_then(|schema| schema.validate_key(PrimaryKey::new(values)));
                            match key {
                                Ok(key) => PredictionTarget::Row {
                                    table: table.clone(),
                                    key,
                                },
                                Err(_) => continue,
                            }
                        }
                        AccessTarget::Request(method) => {
                            if template.confidence < self.external_threshold {
                                gated += 1;
                                continue;
                            }
                            PredictionTarget::Request(ExternalRequest::new(method.clone(), values))
                        }
                    };
                    set.push(Prediction {
                        target,
                        confidence: template.confidence,
                        event: event.id,
                        function: function.clone(),
                    });
                }
            }
        }

        tracing::debug!(
            events = events.len(),
            rows = set.rows().len(),
            requests = set.requests().len(),
            gated_requests = gated,
            "Predicted batch accesses"
        );
        set
    }
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("external_threshold", &self.external_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ColumnDef, ColumnType, SpeculationConfig, TableSchema, Value};
    use serde_json::json;

    struct AllTransfers;

    impl EventRouter for AllTransfers {
        fn functions_for(&self, event: &Event) -> Vec<FunctionId> {
            if event.name == "Transfer" {
                vec![FunctionId::new("on_transfer")]
            } else {
                Vec::new()
            }
        }
    }

    fn schemas() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                TableSchema::new(
                    "balances",
                    vec![
                        ColumnDef::new("holder", ColumnType::Text),
                        ColumnDef::new("amount", ColumnType::Numeric),
                    ],
                    vec!["holder".into()],
                )
                .unwrap(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn transfer(n: u64, from: &str) -> Event {
        Event::new(
            EventId::new(n, 0),
            "Transfer",
            "0xtoken",
            json!({"args": {"from": from, "to": "0xsink", "value": 1}}),
        )
    }

    /// Train `on_transfer` reading `balances[args.from]` on every event and
    /// requesting `eth_getBalance(args.from)` on `hit_every`-th events.
    fn trained(events: u64, hit_every: u64) -> Arc<AccessProfiler> {
        let profiler = Arc::new(AccessProfiler::new(&SpeculationConfig {
            min_observations: 2,
            ..SpeculationConfig::default()
        }));
        let function = FunctionId::new("on_transfer");
        for n in 0..events {
            let from = format!("0xf{}", n);
            let event = transfer(n, &from);
            let inv = profiler.begin_invocation(&function);
            profiler.observe(
                &function,
                inv,
                AccessTarget::Table("balances".into()),
                &[Value::from(from.as_str())],
                &event,
            );
            if n % hit_every == 0 {
                profiler.observe(
                    &function,
                    inv,
                    AccessTarget::Request("eth_getBalance".into()),
                    &[Value::from(from.as_str())],
                    &event,
                );
            }
        }
        profiler
    }

    #[test]
    fn test_confident_request_predicted_for_every_event() {
        let predictor = Predictor::new(trained(10, 1), schemas(), 0.8);
        let batch: Vec<Event> = (100..103).map(|n| transfer(n, &format!("0xn{}", n))).collect();
        let set = predictor.predict(&batch, &AllTransfers);

        assert_eq!(set.rows().len(), 3);
        assert_eq!(set.requests().len(), 3);
        for event in &batch {
            let from = event.field(&kiln_core::FieldPath::new("args.from")).unwrap();
            assert!(set.contains_request(&ExternalRequest::new("eth_getBalance", vec![from])));
        }
    }

    #[test]
    fn test_low_confidence_request_gated_rows_still_predicted() {
        // The request is made on half the invocations.
        let predictor = Predictor::new(trained(10, 2), schemas(), 0.8);
        let batch = vec![transfer(100, "0xnew")];
        let set = predictor.predict(&batch, &AllTransfers);

        assert!(set.requests().is_empty());
        assert!(set.contains_row("balances", &PrimaryKey::from("0xnew")));
    }

    #[test]
    fn test_duplicates_collapse() {
        let predictor = Predictor::new(trained(10, 1), schemas(), 0.8);
        let batch = vec![transfer(100, "0xsame"), transfer(101, "0xsame")];
        let set = predictor.predict(&batch, &AllTransfers);

        assert_eq!(set.rows().len(), 1);
        assert_eq!(set.requests().len(), 1);
        assert_eq!(set.rows()[0].event, EventId::new(100, 0));
        assert_eq!(set.retain_set().len(), 1);
    }

    #[test]
    fn test_unrouted_events_predict_nothing() {
        let predictor = Predictor::new(trained(10, 1), schemas(), 0.8);
        let approval = Event::new(EventId::new(5, 0), "Approval", "0xtoken", json!({"args": {}}));
        assert!(predictor.predict(&[approval], &AllTransfers).is_empty());
    }

    #[test]
    fn test_untrained_profiler_predicts_nothing() {
        let profiler = Arc::new(AccessProfiler::new(&SpeculationConfig::default()));
        let predictor = Predictor::new(profiler, schemas(), 0.8);
        assert!(predictor.predict(&[transfer(1, "0xa")], &AllTransfers).is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_one_row_prediction_per_distinct_sender(
            senders in proptest::collection::vec("0x[0-9a-f]{1,4}", 1..40)
        ) {
            let predictor = Predictor::new(trained(10, 1), schemas(), 0.8);
            let batch: Vec<Event> = senders
                .iter()
                .enumerate()
                .map(|(i, from)| transfer(1000 + i as u64, from))
                .collect();
            let set = predictor.predict(&batch, &AllTransfers);

            let distinct: std::collections::HashSet<&String> = senders.iter().collect();
            proptest::prop_assert_eq!(set.rows().len(), distinct.len());
            proptest::prop_assert_eq!(set.requests().len(), distinct.len());
            for from in distinct {
                proptest::prop_assert!(set.contains_row("balances", &PrimaryKey::from(from.as_str())));
            }
        }
    }
}
