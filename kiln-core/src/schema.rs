//! Table schemas and the process-wide schema registry.
//!
//! Schemas are registered once at pipeline start and are immutable
//! afterwards. Every row, key and patch entering the buffered store is
//! validated (and canonicalised) here, so the cache never holds a value of
//! the wrong type.

use crate::{
    ColumnType, KilnResult, Patch, PrimaryKey, Row, ValidationError, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    /// A non-nullable column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Ordered column definitions plus the primary-key column subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    ) -> KilnResult<Self> {
        let name = name.into();
        let invalid = |reason: String| ValidationError::InvalidSchema {
            table: name.clone(),
            reason,
        };

        if columns.is_empty() {
            return Err(invalid("table has no columns".to_string()).into());
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!("duplicate column {}", column.name)).into());
            }
        }
        if primary_key.is_empty() {
            return Err(invalid("primary key is empty".to_string()).into());
        }
        for key_column in &primary_key {
            match columns.iter().find(|c| &c.name == key_column) {
                None => {
                    return Err(invalid(format!("primary key column {} is not defined", key_column)).into())
                }
                Some(c) if c.nullable => {
                    return Err(invalid(format!("primary key column {} is nullable", key_column)).into())
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            name,
            columns,
            primary_key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// Columns that are not part of the primary key, in schema order.
    pub fn value_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| !self.is_key_column(&c.name))
    }

    fn check_value(&self, column: &ColumnDef, value: Value) -> KilnResult<Value> {
        if value.is_null() {
            if column.nullable {
                return Ok(Value::Null);
            }
            return Err(ValidationError::TypeMismatch {
                table: self.name.clone(),
                column: column.name.clone(),
                expected: column.column_type,
                got: "null".to_string(),
            }
            .into());
        }
        if !value.fits(column.column_type) {
            return Err(ValidationError::TypeMismatch {
                table: self.name.clone(),
                column: column.name.clone(),
                expected: column.column_type,
                got: value
                    .column_type()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "null".to_string()),
            }
            .into());
        }
        Ok(value.coerce(column.column_type))
    }

    /// Validate a full row against this schema.
    ///
    /// Missing nullable columns are filled with `Null` so that every stored
    /// row carries the complete column set.
    pub fn validate_row(&self, row: Row) -> KilnResult<Row> {
        if row.table() != self.name {
            return Err(ValidationError::UnknownTable {
                table: row.table().to_string(),
            }
            .into());
        }
        for column in row.columns() {
            if self.column(column).is_none() {
                return Err(ValidationError::UnknownColumn {
                    table: self.name.clone(),
                    column: column.clone(),
                }
                .into());
            }
        }

        let mut validated = Row::new(self.name.clone());
        for column in &self.columns {
            let value = match row.get(&column.name) {
                Some(v) => self.check_value(column, v.clone())?,
                None if column.nullable => Value::Null,
                None => {
                    return Err(ValidationError::MissingColumn {
                        table: self.name.clone(),
                        column: column.name.clone(),
                    }
                    .into())
                }
            };
            validated.set(column.name.clone(), value);
        }
        Ok(validated)
    }

    /// Validate and canonicalise a primary key.
    pub fn validate_key(&self, key: PrimaryKey) -> KilnResult<PrimaryKey> {
        if key.len() != self.primary_key.len() {
            return Err(ValidationError::KeyArity {
                table: self.name.clone(),
                expected: self.primary_key.len(),
                got: key.len(),
            }
            .into());
        }
        let mut components = Vec::with_capacity(key.len());
        for (name, value) in self.primary_key.iter().zip(key.into_components()) {
            // Key columns are validated non-nullable at construction.
            let column = self.column(name).ok_or_else(|| ValidationError::UnknownColumn {
                table: self.name.clone(),
                column: name.clone(),
            })?;
            components.push(self.check_value(column, value)?);
        }
        Ok(PrimaryKey::new(components))
    }

    /// Validate a patch: known, non-key columns with matching types.
    pub fn validate_patch(&self, patch: Patch) -> KilnResult<Patch> {
        let mut validated = Patch::new();
        for (name, value) in patch.iter() {
            let column = self.column(name).ok_or_else(|| ValidationError::UnknownColumn {
                table: self.name.clone(),
                column: name.clone(),
            })?;
            if self.is_key_column(name) {
                return Err(ValidationError::KeyColumnPatched {
                    table: self.name.clone(),
                    column: name.clone(),
                }
                .into());
            }
            validated.insert(name.clone(), self.check_value(column, value.clone())?);
        }
        Ok(validated)
    }

    /// Extract the primary key of a (validated) row.
    pub fn key_of(&self, row: &Row) -> KilnResult<PrimaryKey> {
        let mut components = Vec::with_capacity(self.primary_key.len());
        for name in &self.primary_key {
            let value = row.get(name).ok_or_else(|| ValidationError::MissingColumn {
                table: self.name.clone(),
                column: name.clone(),
            })?;
            components.push(value.clone());
        }
        Ok(PrimaryKey::new(components))
    }

    /// A patch assigning every non-key column of `row`.
    ///
    /// Used when a key is deleted and re-inserted inside one unflushed
    /// window: the net effect is an upsert that overwrites the whole row.
    pub fn overwrite_patch(&self, row: &Row) -> Patch {
        self.value_columns()
            .map(|c| {
                (
                    c.name.clone(),
                    row.get(&c.name).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }
}

/// Registry of table schemas, built at pipeline start and then shared
/// read-only behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: HashMap<String, Arc<TableSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table. Each table may be registered once.
    pub fn register(&mut self, schema: TableSchema) -> KilnResult<Arc<TableSchema>> {
        if self.tables.contains_key(schema.name()) {
            return Err(ValidationError::DuplicateTable {
                table: schema.name().to_string(),
            }
            .into());
        }
        let schema = Arc::new(schema);
        self.tables
            .insert(schema.name().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get(&self, table: &str) -> KilnResult<Arc<TableSchema>> {
        self.tables.get(table).cloned().ok_or_else(|| {
            ValidationError::UnknownTable {
                table: table.to_string(),
            }
            .into()
        })
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
