//! Source events and field paths.
//!
//! Events arrive from the upstream crawler in strictly increasing
//! [`EventId`] order. The transform stage never interprets the payload
//! itself; it only resolves dotted field paths (`args.from`,
//! `address`, `block_number`) so access templates can refer to them.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an event in the chain: block number plus log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub block_number: u64,
    pub log_index: u32,
}

impl EventId {
    pub fn new(block_number: u64, log_index: u32) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// Identity of a user transform function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(String);

impl FunctionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

/// Dotted path to a scalar inside an event, e.g. `args.from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event.{}", self.0)
    }
}

/// One decoded chain event (a contract log).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Event signature name, e.g. `Transfer`.
    pub name: String,
    /// Emitting contract address.
    pub address: String,
    /// Decoded event body; `args` conventionally holds the parameters.
    pub payload: serde_json::Value,
}

const BLOCK_NUMBER: &str = "block_number";
const LOG_INDEX: &str = "log_index";
const ADDRESS: &str = "address";
const NAME: &str = "name";

impl Event {
    pub fn new(
        id: EventId,
        name: impl Into<String>,
        address: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            payload,
        }
    }

    /// Resolve a field path to a scalar value.
    ///
    /// Top-level `block_number`, `log_index`, `address` and `name` refer to
    /// the envelope; everything else walks the payload. Numeric segments
    /// index into arrays.
    pub fn field(&self, path: &FieldPath) -> Option<Value> {
        match path.as_str() {
            BLOCK_NUMBER => return i64::try_from(self.id.block_number).ok().map(Value::Int),
            LOG_INDEX => return Some(Value::Int(i64::from(self.id.log_index))),
            ADDRESS => return Some(Value::Text(self.address.clone())),
            NAME => return Some(Value::Text(self.name.clone())),
            _ => {}
        }

        let mut node = &self.payload;
        for segment in path.segments() {
            node = match node {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Value::from_json(node)
    }

    /// Every scalar field of the event with its path.
    ///
    /// `Null` leaves are skipped: they can never identify a row.
    pub fn leaves(&self) -> Vec<(FieldPath, Value)> {
        let mut out = Vec::new();
        if let Ok(block) = i64::try_from(self.id.block_number) {
            out.push((FieldPath::new(BLOCK_NUMBER), Value::Int(block)));
        }
        out.push((
            FieldPath::new(LOG_INDEX),
            Value::Int(i64::from(self.id.log_index)),
        ));
        out.push((FieldPath::new(ADDRESS), Value::Text(self.address.clone())));
        collect_leaves(&self.payload, &mut String::new(), &mut out);
        out
    }

    /// Paths whose value equals `value`.
    pub fn paths_matching(&self, value: &Value) -> Vec<FieldPath> {
        self.leaves()
            .into_iter()
            .filter(|(_, v)| v == value)
            .map(|(p, _)| p)
            .collect()
    }
}

fn collect_leaves(node: &serde_json::Value, prefix: &mut String, out: &mut Vec<(FieldPath, Value)>) {
    match node {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let len = prefix.len();
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(key);
                collect_leaves(child, prefix, out);
                prefix.truncate(len);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let len = prefix.len();
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(&i.to_string());
                collect_leaves(child, prefix, out);
                prefix.truncate(len);
            }
        }
        scalar => {
            if prefix.is_empty() {
                return;
            }
            if let Some(value) = Value::from_json(scalar) {
                if !value.is_null() {
                    out.push((FieldPath::new(prefix.clone()), value));
                }
            }
        }
    }
}
