//! PostgreSQL durable store.
//!
//! Values travel as text in both directions: parameters are bound as
//! `Option<String>` and cast server-side (`$1::text::bigint`), and columns
//! are selected as text and parsed against the table schema. Insert groups
//! are streamed with `COPY ... FROM STDIN (FORMAT csv)` into a per-session
//! temp staging table and moved with `INSERT ... ON CONFLICT DO NOTHING
//! RETURNING`, so colliding keys are discovered without aborting the group.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use futures_util::SinkExt;
use kiln_core::{
    ColumnType, KilnError, KilnResult, Patch, PrimaryKey, Row, StorageError, TableSchema, Value,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use crate::durable::{DurableStore, WriteOp};

/// Keys per batched lookup statement.
const LOOKUP_CHUNK: usize = 500;

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Connection pool configuration for [`PostgresStore`].
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection acquisition timeout
    pub timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "kiln".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PgConfig {
    /// Read `KILN_DB_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("KILN_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("KILN_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("KILN_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("KILN_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("KILN_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("KILN_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: std::env::var("KILN_DB_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> KilnResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_cfg = deadpool_postgres::PoolConfig::new(self.max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        cfg.pool = Some(pool_cfg);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls).map_err(|e| {
            StorageError::Unavailable {
                reason: format!("Failed to create pool: {}", e),
            }
            .into()
        })
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

/// Server-side SQL errors are permanent; everything else is connectivity.
fn pg_error(err: tokio_postgres::Error, table: &str) -> KilnError {
    match err.as_db_error() {
        Some(db) => StorageError::Rejected {
            table: table.to_string(),
            reason: format!("{} ({})", db.message(), db.code().code()),
        }
        .into(),
        None => StorageError::Unavailable {
            reason: err.to_string(),
        }
        .into(),
    }
}

fn pool_error(err: PoolError, table: &str) -> KilnError {
    match err {
        PoolError::Timeout(_) => StorageError::Timeout {
            operation: "acquire connection".to_string(),
        }
        .into(),
        PoolError::Backend(e) => pg_error(e, table),
        other => StorageError::Unavailable {
            reason: other.to_string(),
        }
        .into(),
    }
}

// ============================================================================
// TEXT ENCODING
// ============================================================================

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Bool => "boolean",
        ColumnType::Int => "bigint",
        ColumnType::Numeric => "numeric",
        ColumnType::Text => "text",
        ColumnType::Bytes => "bytea",
        ColumnType::Timestamp => "timestamptz",
    }
}

/// Text form PostgreSQL accepts for each type; `None` for NULL.
fn encode(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Numeric(n) => Some(n.clone()),
        Value::Text(s) => Some(s.clone()),
        Value::Bytes(b) => Some(format!("\\x{}", hex::encode(b))),
        Value::Timestamp(t) => Some(t.to_rfc3339()),
    }
}

fn decode(
    table: &str,
    column: &str,
    ty: ColumnType,
    text: Option<String>,
) -> KilnResult<Value> {
    let Some(text) = text else {
        return Ok(Value::Null);
    };
    let bad = |reason: String| -> KilnError {
        StorageError::Decode {
            table: table.to_string(),
            column: column.to_string(),
            reason,
        }
        .into()
    };
    let value = match ty {
        ColumnType::Bool => match text.as_str() {
            "true" | "t" => Value::Bool(true),
            "false" | "f" => Value::Bool(false),
            other => return Err(bad(format!("not a boolean: {}", other))),
        },
        ColumnType::Int => Value::Int(text.parse::<i64>().map_err(|e| bad(format!("{}", e)))?),
        ColumnType::Numeric => Value::Numeric(text),
        ColumnType::Text => Value::Text(text),
        ColumnType::Bytes => {
            let digits = text.strip_prefix("\\x").unwrap_or(&text);
            Value::Bytes(hex::decode(digits).map_err(|e| bad(format!("{}", e)))?)
        }
        ColumnType::Timestamp => Value::Timestamp(
            DateTime::parse_from_rfc3339(&text)
                .map_err(|e| bad(format!("{}", e)))?
                .with_timezone(&Utc),
        ),
    };
    Ok(value)
}

/// Select expression returning the column as text.
fn select_expr(name: &str, ty: ColumnType) -> String {
    let ident = quote_ident(name);
    match ty {
        // ISO 8601 regardless of the session's DateStyle.
        ColumnType::Timestamp => format!("to_json({})#>>'{{}}'", ident),
        _ => format!("{}::text", ident),
    }
}

fn csv_field(value: &Value) -> String {
    match encode(value) {
        None => String::new(),
        Some(text) => format!("\"{}\"", text.replace('"', "\"\"")),
    }
}

/// Accumulates text parameters and renders their placeholders.
#[derive(Debug, Default)]
struct Params {
    values: Vec<Option<String>>,
}

impl Params {
    fn push(&mut self, value: &Value, ty: ColumnType) -> String {
        self.values.push(encode(value));
        format!("${}::text::{}", self.values.len(), sql_type(ty))
    }

    fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
    }
}

fn column_type(schema: &TableSchema, column: &str) -> KilnResult<ColumnType> {
    schema
        .column(column)
        .map(|c| c.column_type)
        .ok_or_else(|| {
            kiln_core::ValidationError::UnknownColumn {
                table: schema.name().to_string(),
                column: column.to_string(),
            }
            .into()
        })
}

fn key_predicate(schema: &TableSchema, key: &PrimaryKey, params: &mut Params) -> KilnResult<String> {
    let mut parts = Vec::with_capacity(key.len());
    for (column, value) in schema.primary_key().iter().zip(key.components()) {
        let placeholder = params.push(value, column_type(schema, column)?);
        parts.push(format!("{} = {}", quote_ident(column), placeholder));
    }
    Ok(parts.join(" AND "))
}

fn select_list(schema: &TableSchema) -> String {
    schema
        .columns()
        .iter()
        .map(|c| select_expr(&c.name, c.column_type))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn staging_table(schema: &TableSchema) -> String {
    quote_ident(&format!("kiln_stage_{}", schema.name()))
}

fn decode_row(schema: &TableSchema, row: &tokio_postgres::Row) -> KilnResult<Row> {
    let mut out = Row::new(schema.name());
    for (idx, column) in schema.columns().iter().enumerate() {
        let text: Option<String> = row
            .try_get(idx)
            .map_err(|e| pg_error(e, schema.name()))?;
        out.set(
            column.name.clone(),
            decode(schema.name(), &column.name, column.column_type, text)?,
        );
    }
    Ok(out)
}

/// Canonical text of a decimal, so `007`, `7` and `7.0` compare equal.
fn canonical_numeric(text: &str) -> String {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int, frac) = digits.split_once('.').unwrap_or((digits, ""));
    let int = int.trim_start_matches('0');
    let frac = frac.trim_end_matches('0');
    let body = match (int.is_empty(), frac.is_empty()) {
        (true, true) => return "0".to_string(),
        (false, true) => int.to_string(),
        (true, false) => format!("0.{}", frac),
        (false, false) => format!("{}.{}", int, frac),
    };
    if negative {
        format!("-{}", body)
    } else {
        body
    }
}

/// Key with numeric components in canonical form, for comparing keys
/// echoed by the server against the ones sent.
fn canonical_key(key: &PrimaryKey) -> PrimaryKey {
    PrimaryKey::new(
        key.components()
            .iter()
            .map(|value| match value {
                Value::Numeric(text) => Value::Numeric(canonical_numeric(text)),
                other => other.clone(),
            })
            .collect(),
    )
}

fn decode_key(schema: &TableSchema, row: &tokio_postgres::Row) -> KilnResult<PrimaryKey> {
    let mut components = Vec::with_capacity(schema.primary_key().len());
    for (idx, column) in schema.primary_key().iter().enumerate() {
        let text: Option<String> = row
            .try_get(idx)
            .map_err(|e| pg_error(e, schema.name()))?;
        components.push(decode(schema.name(), column, column_type(schema, column)?, text)?);
    }
    Ok(PrimaryKey::new(components))
}

fn set_clause(schema: &TableSchema, patch: &Patch, params: &mut Params) -> KilnResult<String> {
    let mut parts = Vec::with_capacity(patch.len());
    for (column, value) in patch.iter() {
        let placeholder = params.push(value, column_type(schema, column)?);
        parts.push(format!("{} = {}", quote_ident(column), placeholder));
    }
    Ok(parts.join(", "))
}

fn insert_values(schema: &TableSchema, row: &Row, params: &mut Params) -> String {
    schema
        .columns()
        .iter()
        .map(|c| params.push(row.get(&c.name).unwrap_or(&Value::Null), c.column_type))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render one write as a parameterised statement; `None` when it has no effect.
fn write_statement(schema: &TableSchema, op: &WriteOp) -> KilnResult<Option<(String, Params)>> {
    let table = quote_ident(schema.name());
    let mut params = Params::default();
    let sql = match op {
        WriteOp::Insert { row } => {
            let values = insert_values(schema, row, &mut params);
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
                table,
                column_list(schema),
                values
            )
        }
        WriteOp::Update { key, patch } => {
            if patch.is_empty() {
                return Ok(None);
            }
            let set = set_clause(schema, patch, &mut params)?;
            let predicate = key_predicate(schema, key, &mut params)?;
            format!("UPDATE {} SET {} WHERE {}", table, set, predicate)
        }
        WriteOp::Upsert { row, on_conflict } => {
            let values = insert_values(schema, row, &mut params);
            let conflict_cols = schema
                .primary_key()
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let action = if on_conflict.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", set_clause(schema, on_conflict, &mut params)?)
            };
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
                table,
                column_list(schema),
                values,
                conflict_cols,
                action
            )
        }
        WriteOp::Delete { key } => {
            let predicate = key_predicate(schema, key, &mut params)?;
            format!("DELETE FROM {} WHERE {}", table, predicate)
        }
    };
    Ok(Some((sql, params)))
}

fn copy_payload(schema: &TableSchema, rows: &[Row]) -> String {
    let mut buf = String::new();
    for row in rows {
        let line = schema
            .columns()
            .iter()
            .map(|c| csv_field(row.get(&c.name).unwrap_or(&Value::Null)))
            .collect::<Vec<_>>()
            .join(",");
        buf.push_str(&line);
        buf.push('\n');
    }
    buf
}

// ============================================================================
// STORE
// ============================================================================

/// [`DurableStore`] backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &PgConfig) -> KilnResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self, table: &str) -> KilnResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| pool_error(e, table))
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn fetch(&self, schema: &TableSchema, key: &PrimaryKey) -> KilnResult<Option<Row>> {
        let conn = self.get_conn(schema.name()).await?;
        let mut params = Params::default();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            select_list(schema),
            quote_ident(schema.name()),
            key_predicate(schema, key, &mut params)?
        );
        let row = conn
            .query_opt(sql.as_str(), &params.refs())
            .await
            .map_err(|e| pg_error(e, schema.name()))?;
        row.map(|r| decode_row(schema, &r)).transpose()
    }

    async fn fetch_many(&self, schema: &TableSchema, keys: &[PrimaryKey]) -> KilnResult<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn(schema.name()).await?;
        let mut out = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(LOOKUP_CHUNK) {
            let mut params = Params::default();
            let mut predicates = Vec::with_capacity(chunk.len());
            for key in chunk {
                predicates.push(format!("({})", key_predicate(schema, key, &mut params)?));
            }
            let sql = format!(
                "SELECT {} FROM {} WHERE {}",
                select_list(schema),
                quote_ident(schema.name()),
                predicates.join(" OR ")
            );
            let rows = conn
                .query(sql.as_str(), &params.refs())
                .await
                .map_err(|e| pg_error(e, schema.name()))?;
            for row in &rows {
                out.push(decode_row(schema, row)?);
            }
        }
        tracing::trace!(table = schema.name(), keys = keys.len(), found = out.len(), "Batched lookup");
        Ok(out)
    }

    async fn bulk_insert(&self, schema: &TableSchema, rows: &[Row]) -> KilnResult<Vec<PrimaryKey>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let table = schema.name();
        let mut conn = self.get_conn(table).await?;
        let tx = conn.transaction().await.map_err(|e| pg_error(e, table))?;

        let staging = staging_table(schema);
        let columns = column_list(schema);
        tx.batch_execute(&format!(
            "CREATE TEMP TABLE IF NOT EXISTS {} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DELETE ROWS",
            staging,
            quote_ident(table)
        ))
        .await
        .map_err(|e| pg_error(e, table))?;

        let copy = format!("COPY {} ({}) FROM STDIN (FORMAT csv)", staging, columns);
        let sink = tx.copy_in(copy.as_str()).await.map_err(|e| pg_error(e, table))?;
        futures_util::pin_mut!(sink);
        sink.send(Bytes::from(copy_payload(schema, rows)))
            .await
            .map_err(|e| pg_error(e, table))?;
        sink.finish().await.map_err(|e| pg_error(e, table))?;

        let returning = schema
            .primary_key()
            .iter()
            .map(|c| column_type(schema, c).map(|ty| select_expr(c, ty)))
            .collect::<KilnResult<Vec<_>>>()?
            .join(", ");
        let move_rows = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} ON CONFLICT DO NOTHING RETURNING {}",
            quote_ident(table),
            columns,
            columns,
            staging,
            returning
        );
        let inserted = tx
            .query(move_rows.as_str(), &[])
            .await
            .map_err(|e| pg_error(e, table))?;
        tx.commit().await.map_err(|e| pg_error(e, table))?;

        let inserted: HashSet<PrimaryKey> = inserted
            .iter()
            .map(|r| decode_key(schema, r).map(|key| canonical_key(&key)))
            .collect::<KilnResult<_>>()?;
        let mut collisions = Vec::new();
        for row in rows {
            let key = schema.key_of(row)?;
            if !inserted.contains(&canonical_key(&key)) {
                collisions.push(key);
            }
        }
        tracing::debug!(
            table,
            rows = rows.len(),
            collisions = collisions.len(),
            "Bulk insert committed"
        );
        Ok(collisions)
    }

    async fn apply(&self, schema: &TableSchema, ops: &[WriteOp]) -> KilnResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let table = schema.name();
        let mut conn = self.get_conn(table).await?;
        let tx = conn.transaction().await.map_err(|e| pg_error(e, table))?;
        for op in ops {
            if let Some((sql, params)) = write_statement(schema, op)? {
                let stmt = tx
                    .prepare_cached(&sql)
                    .await
                    .map_err(|e| pg_error(e, table))?;
                tx.execute(&stmt, &params.refs())
                    .await
                    .map_err(|e| pg_error(e, table))?;
            }
        }
        tx.commit().await.map_err(|e| pg_error(e, table))?;
        tracing::debug!(table, statements = ops.len(), "Statement batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::ColumnDef;

    fn schema() -> TableSchema {
        TableSchema::new(
            "balances",
            vec![
                ColumnDef::new("holder", ColumnType::Text),
                ColumnDef::new("token", ColumnType::Bytes),
                ColumnDef::new("amount", ColumnType::Numeric),
                ColumnDef::new("updated_at", ColumnType::Timestamp).nullable(),
            ],
            vec!["holder".into(), "token".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_text_encoding_round_trips_through_decode() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let cases = [
            (Value::Bool(true), ColumnType::Bool),
            (Value::Int(-42), ColumnType::Int),
            (Value::Numeric("115792089237316195423570985008687907853".into()), ColumnType::Numeric),
            (Value::Bytes(vec![0xde, 0xad]), ColumnType::Bytes),
            (Value::Timestamp(ts), ColumnType::Timestamp),
        ];
        for (value, ty) in cases {
            let decoded = decode("t", "c", ty, encode(&value)).unwrap();
            assert_eq!(decoded, value);
        }
        assert_eq!(decode("t", "c", ColumnType::Int, None).unwrap(), Value::Null);
    }

    #[test]
    fn test_numeric_keys_compare_by_value() {
        assert_eq!(canonical_numeric("007"), "7");
        assert_eq!(canonical_numeric("+7.500"), "7.5");
        assert_eq!(canonical_numeric("-0.0"), "0");
        assert_eq!(canonical_numeric("-00.25"), "-0.25");
        assert_eq!(canonical_numeric("0"), "0");

        let sent = PrimaryKey::new(vec![Value::Text("0xa".into()), Value::Numeric("007".into())]);
        let echoed = PrimaryKey::new(vec![Value::Text("0xa".into()), Value::Numeric("7".into())]);
        assert_eq!(canonical_key(&sent), canonical_key(&echoed));
        assert_ne!(
            canonical_key(&sent),
            canonical_key(&PrimaryKey::new(vec![Value::Text("0xa".into()), Value::Numeric("70".into())]))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode("t", "c", ColumnType::Int, Some("abc".into())).unwrap_err();
        assert!(matches!(err, KilnError::Storage(StorageError::Decode { .. })));
    }

    #[test]
    fn test_csv_quotes_everything_but_null() {
        let row = Row::new("balances")
            .with("holder", "a\"b")
            .with("token", vec![0x01u8])
            .with("amount", Value::Numeric("10".into()))
            .with("updated_at", Value::Null);
        assert_eq!(copy_payload(&schema(), &[row]), "\"a\"\"b\",\"\\x01\",\"10\",\n");
    }

    #[test]
    fn test_upsert_statement_targets_primary_key() {
        let schema = schema();
        let row = Row::new("balances")
            .with("holder", "alice")
            .with("token", vec![0x01u8])
            .with("amount", Value::Numeric("5".into()))
            .with("updated_at", Value::Null);
        let op = WriteOp::Upsert {
            row,
            on_conflict: Patch::new().set("amount", Value::Numeric("6".into())),
        };
        let (sql, params) = write_statement(&schema, &op).unwrap().unwrap();
        assert!(sql.contains("ON CONFLICT (\"holder\", \"token\") DO UPDATE SET \"amount\" = $5::text::numeric"));
        assert_eq!(params.values.len(), 5);
        assert_eq!(params.values[3], None);
    }

    #[test]
    fn test_empty_update_is_skipped() {
        let op = WriteOp::Update {
            key: PrimaryKey::new(vec![Value::from("alice"), Value::Bytes(vec![1])]),
            patch: Patch::new(),
        };
        assert!(write_statement(&schema(), &op).unwrap().is_none());
    }

    #[test]
    fn test_timestamps_are_selected_as_json_text() {
        assert_eq!(
            select_expr("updated_at", ColumnType::Timestamp),
            "to_json(\"updated_at\")#>>'{}'"
        );
        assert_eq!(select_expr("amount", ColumnType::Numeric), "\"amount\"::text");
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PgConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.max_size, 16);
    }
}
