//! Access profiler.
//!
//! Learns, per transform function, which rows and external requests the
//! function touches and how each key component relates to the triggering
//! event. A learned template says, for every key column (or request
//! parameter), either "this is `event.<path>`" or "this is always the
//! constant `v`".
//!
//! Each column keeps a window of the candidate sources seen in recent
//! observations; the source present in most of them wins. Template
//! confidence is the winner's share of the window (minimum over columns)
//! scaled by the fraction of the function's invocations that touched the
//! template at all. Records are never deleted.

use kiln_core::{Event, FieldPath, FunctionId, SpeculationConfig, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;

/// Templates learned per (function, target) before observations are folded
/// into the closest existing one.
const MAX_TEMPLATES_PER_TARGET: usize = 8;

/// What an access reads: a table row or an external request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AccessTarget {
    Table(String),
    Request(String),
}

impl fmt::Display for AccessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessTarget::Table(t) => write!(f, "table {}", t),
            AccessTarget::Request(m) => write!(f, "request {}", m),
        }
    }
}

/// Where a key component comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Source {
    Field(FieldPath),
    Constant(Value),
}

impl Source {
    fn resolve(&self, event: &Event) -> Option<Value> {
        match self {
            Source::Field(path) => event.field(path).filter(|v| !v.is_null()),
            Source::Constant(value) => Some(value.clone()),
        }
    }

    fn matches(&self, event: &Event, value: &Value) -> bool {
        self.resolve(event)
            .map(|resolved| loosely_equal(&resolved, value))
            .unwrap_or(false)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Field(path) => write!(f, "{}", path),
            Source::Constant(value) => write!(f, "{}", value),
        }
    }
}

/// Event fields are decoded from JSON, so an event integer may stand for a
/// numeric key column.
fn loosely_equal(event_value: &Value, key_value: &Value) -> bool {
    if event_value == key_value {
        return true;
    }
    match key_value.column_type() {
        Some(ty) => event_value.clone().coerce(ty) == *key_value,
        None => false,
    }
}

fn candidates(event: &Event, leaves: &[(FieldPath, Value)], value: &Value) -> Vec<Source> {
    let mut out: Vec<Source> = leaves
        .iter()
        .filter(|(_, leaf)| loosely_equal(leaf, value))
        .map(|(path, _)| Source::Field(path.clone()))
        .collect();
    // Envelope fields outside the leaf listing.
    let name = Value::Text(event.name.clone());
    if name == *value {
        out.push(Source::Field(FieldPath::new("name")));
    }
    out.push(Source::Constant(value.clone()));
    out
}

#[derive(Debug)]
struct ColumnProfile {
    window: VecDeque<Vec<Source>>,
    winner: Source,
    winner_count: usize,
}

impl ColumnProfile {
    fn new(initial: Vec<Source>, window: usize) -> Self {
        let mut profile = Self {
            window: VecDeque::with_capacity(window),
            winner: Source::Constant(Value::Null),
            winner_count: 0,
        };
        profile.winner = initial
            .iter()
            .min()
            .cloned()
            .unwrap_or(Source::Constant(Value::Null));
        profile.push(initial, window);
        profile
    }

    fn push(&mut self, sample: Vec<Source>, window: usize) {
        self.window.push_back(sample);
        while self.window.len() > window {
            self.window.pop_front();
        }
        self.elect();
    }

    /// Pick the source present in most samples. Ties keep the current
    /// winner, then prefer event fields over constants, then the lowest
    /// field path or value.
    fn elect(&mut self) {
        let mut counts: BTreeMap<&Source, usize> = BTreeMap::new();
        for sample in &self.window {
            for source in sample {
                *counts.entry(source).or_insert(0) += 1;
            }
        }
        let current = counts.get(&self.winner).copied().unwrap_or(0);
        let mut best = (&self.winner, current);
        for (source, count) in counts {
            let better = count > best.1
                || (count == best.1
                    && best.0 != &self.winner
                    && matches!(source, Source::Field(_))
                    && matches!(best.0, Source::Constant(_)));
            if better {
                best = (source, count);
            }
        }
        let (winner, count) = (best.0.clone(), best.1);
        self.winner = winner;
        self.winner_count = count;
    }

    fn consistency(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.winner_count as f64 / self.window.len() as f64
        }
    }
}

#[derive(Debug)]
struct AccessRecord {
    columns: Vec<ColumnProfile>,
    observations: u64,
    touched_invocations: u64,
    last_invocation: u64,
}

impl AccessRecord {
    fn arity(&self) -> usize {
        self.columns.len()
    }

    fn fit(&self, event: &Event, values: &[Value]) -> usize {
        self.columns
            .iter()
            .zip(values)
            .filter(|(column, value)| column.winner.matches(event, value))
            .count()
    }

    fn record(&mut self, samples: Vec<Vec<Source>>, invocation: u64, window: usize) {
        for (column, sample) in self.columns.iter_mut().zip(samples) {
            column.push(sample, window);
        }
        self.observations += 1;
        if self.last_invocation != invocation {
            self.last_invocation = invocation;
            self.touched_invocations += 1;
        }
    }

    fn confidence(&self, invocations: u64) -> f64 {
        let consistency = self
            .columns
            .iter()
            .map(ColumnProfile::consistency)
            .fold(1.0_f64, f64::min);
        let rate = if invocations == 0 {
            1.0
        } else {
            (self.touched_invocations as f64 / invocations as f64).min(1.0)
        };
        consistency * rate
    }
}

#[derive(Debug, Default)]
struct FunctionProfile {
    invocations: u64,
    records: HashMap<AccessTarget, Vec<AccessRecord>>,
}

/// A learned template, detached from the profiler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessTemplate {
    pub function: FunctionId,
    pub target: AccessTarget,
    pub sources: Vec<Source>,
    pub observations: u64,
    pub confidence: f64,
}

impl AccessTemplate {
    /// Substitute event fields. `None` if a referenced field is missing or
    /// null in this event.
    pub fn instantiate(&self, event: &Event) -> Option<Vec<Value>> {
        self.sources.iter().map(|s| s.resolve(event)).collect()
    }
}

impl fmt::Display for AccessTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}[", self.function, self.target)?;
        for (i, source) in self.sources.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", source)?;
        }
        write!(f, "] ({:.2}, n={})", self.confidence, self.observations)
    }
}

/// Process-wide access profiler. Created at pipeline start.
#[derive(Debug)]
pub struct AccessProfiler {
    functions: RwLock<HashMap<FunctionId, FunctionProfile>>,
    window: usize,
    min_observations: u64,
    confidence_floor: f64,
}

impl AccessProfiler {
    pub fn new(config: &SpeculationConfig) -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
            window: config.observation_window.max(1),
            min_observations: config.min_observations,
            confidence_floor: config.row_confidence_floor,
        }
    }

    /// Count an invocation of `function` and return its sequence number,
    /// to be passed to every observation made during that invocation.
    pub fn begin_invocation(&self, function: &FunctionId) -> u64 {
        match self.functions.write() {
            Ok(mut functions) => {
                let profile = functions.entry(function.clone()).or_default();
                profile.invocations += 1;
                profile.invocations
            }
            Err(_) => 0,
        }
    }

    /// Record that `function`, while handling `event`, accessed `target`
    /// with the given key components (or request parameters).
    ///
    /// Profiling is best effort; a poisoned lock drops the observation.
    pub fn observe(
        &self,
        function: &FunctionId,
        invocation: u64,
        target: AccessTarget,
        values: &[Value],
        event: &Event,
    ) {
        if values.is_empty() {
            return;
        }
        let leaves = event.leaves();
        let samples: Vec<Vec<Source>> = values
            .iter()
            .map(|v| candidates(event, &leaves, v))
            .collect();

        let Ok(mut functions) = self.functions.write() else {
            return;
        };
        let profile = functions.entry(function.clone()).or_default();
        let records = profile.records.entry(target.clone()).or_default();

        let arity = values.len();
        let mut best: Option<(usize, usize, u64)> = None;
        for (i, record) in records.iter().enumerate() {
            if record.arity() != arity {
                continue;
            }
            let fit = record.fit(event, values);
            let better = match best {
                None => true,
                Some((_, best_fit, best_obs)) => {
                    fit > best_fit || (fit == best_fit && record.observations > best_obs)
                }
            };
            if better {
                best = Some((i, fit, record.observations));
            }
        }

        match best {
            Some((i, fit, _)) if fit == arity || records.len() >= MAX_TEMPLATES_PER_TARGET => {
                records[i].record(samples, invocation, self.window);
            }
            _ if records.len() < MAX_TEMPLATES_PER_TARGET => {
                tracing::debug!(
                    function = %function,
                    access = %target,
                    templates = records.len() + 1,
                    "Learning new access template"
                );
                records.push(AccessRecord {
                    columns: samples
                        .into_iter()
                        .map(|sample| ColumnProfile::new(sample, self.window))
                        .collect(),
                    observations: 1,
                    touched_invocations: 1,
                    last_invocation: invocation,
                });
            }
            _ => {
                tracing::trace!(
                    function = %function,
                    access = %target,
                    arity,
                    "No template slot for access; dropping observation"
                );
            }
        }
    }

    fn templates_where(&self, keep: impl Fn(&FunctionId) -> bool, eligible_only: bool) -> Vec<AccessTemplate> {
        let Ok(functions) = self.functions.read() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (function, profile) in functions.iter().filter(|entry| keep(entry.0)) {
            for (target, records) in &profile.records {
                for record in records {
                    let confidence = record.confidence(profile.invocations);
                    if eligible_only
                        && (record.observations < self.min_observations
                            || confidence < self.confidence_floor)
                    {
                        continue;
                    }
                    out.push(AccessTemplate {
                        function: function.clone(),
                        target: target.clone(),
                        sources: record.columns.iter().map(|c| c.winner.clone()).collect(),
                        observations: record.observations,
                        confidence,
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            (&a.function, &a.target)
                .cmp(&(&b.function, &b.target))
                .then(b.confidence.total_cmp(&a.confidence))
        });
        out
    }

    /// Templates of `function` eligible for prediction.
    pub fn eligible(&self, function: &FunctionId) -> Vec<AccessTemplate> {
        self.templates_where(|f| f == function, true)
    }

    /// Every learned template, eligible or not.
    pub fn snapshot(&self) -> Vec<AccessTemplate> {
        self.templates_where(|_| true, false)
    }

    pub fn invocations(&self, function: &FunctionId) -> u64 {
        self.functions
            .read()
            .ok()
            .and_then(|f| f.get(function).map(|p| p.invocations))
            .unwrap_or(0)
    }
}
