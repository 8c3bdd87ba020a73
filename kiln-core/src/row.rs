//! Rows, primary keys and column patches.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Primary-key value: one component per primary-key column, in schema order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    pub fn new(components: Vec<Value>) -> Self {
        Self(components)
    }

    pub fn components(&self) -> &[Value] {
        &self.0
    }

    pub fn into_components(self) -> Vec<Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn estimated_size(&self) -> usize {
        self.0.iter().map(Value::estimated_size).sum()
    }
}

impl From<Value> for PrimaryKey {
    fn from(v: Value) -> Self {
        Self(vec![v])
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(v: Vec<Value>) -> Self {
        Self(v)
    }
}

impl From<&str> for PrimaryKey {
    fn from(v: &str) -> Self {
        Self(vec![Value::from(v)])
    }
}

impl From<i64> for PrimaryKey {
    fn from(v: i64) -> Self {
        Self(vec![Value::Int(v)])
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", v)?;
        }
        f.write_str(")")
    }
}

/// Column assignments applied to an existing row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch(BTreeMap<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style assignment.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Merge `later` into this patch; assignments in `later` win.
    pub fn merge(&mut self, later: &Patch) {
        for (column, value) in later.iter() {
            self.0.insert(column.clone(), value.clone());
        }
    }

    pub fn estimated_size(&self) -> usize {
        self.0
            .iter()
            .map(|(k, v)| k.len() + v.estimated_size())
            .sum()
    }
}

impl FromIterator<(String, Value)> for Patch {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A row of a registered table: column name to typed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    table: String,
    values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style column assignment.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Apply a patch in place.
    pub fn apply(&mut self, patch: &Patch) {
        for (column, value) in patch.iter() {
            self.values.insert(column.clone(), value.clone());
        }
    }

    /// Return a copy with the patch applied.
    pub fn patched(&self, patch: &Patch) -> Row {
        let mut row = self.clone();
        row.apply(patch);
        row
    }

    pub fn estimated_size(&self) -> usize {
        const ROW_OVERHEAD: usize = 48;
        ROW_OVERHEAD
            + self.table.len()
            + self
                .values
                .iter()
                .map(|(k, v)| k.len() + v.estimated_size())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_merge_later_wins() {
        let mut first = Patch::new().set("a", 1i64).set("b", 2i64);
        let later = Patch::new().set("b", 3i64).set("c", 4i64);
        first.merge(&later);

        assert_eq!(first.get("a"), Some(&Value::Int(1)));
        assert_eq!(first.get("b"), Some(&Value::Int(3)));
        assert_eq!(first.get("c"), Some(&Value::Int(4)));
    }

    #[test]
    fn test_row_patched_leaves_original() {
        let row = Row::new("t").with("id", 1i64).with("v", "x");
        let patched = row.patched(&Patch::new().set("v", "y"));
        assert_eq!(row.get("v"), Some(&Value::from("x")));
        assert_eq!(patched.get("v"), Some(&Value::from("y")));
    }

    #[test]
    fn test_primary_key_display() {
        let key = PrimaryKey::new(vec![Value::from("0xabc"), Value::Int(7)]);
        assert_eq!(key.to_string(), "('0xabc', 7)");
    }
}
