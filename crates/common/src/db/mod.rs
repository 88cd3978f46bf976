//! Database layer for Tandem
//!
//! Provides:
//! - Bounded connection pool management (sqlx)
//! - The `RelationalStore` seam used by the table pipeline
//! - Dynamic row decoding for model-synthesized queries
//!
//! Synthesized queries have unknown column lists, so rows are decoded
//! positionally into `TableRow` values instead of typed structs. Connections
//! are checked out per execution and returned on every path; `fetch_all`
//! holds the checkout only for the duration of one query.

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!(
            min = config.min_connections,
            max = config.max_connections,
            "Connecting to database..."
        );

        let statement_timeout_ms = config.statement_timeout_ms;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    // Runaway synthesized queries are cut off server-side.
                    let stmt = format!("SET statement_timeout = {}", statement_timeout_ms);
                    sqlx::query(&stmt).execute(conn).await?;
                    Ok(())
                })
            })
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect: {}", e),
            })?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Access the underlying pool
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;
        Ok(())
    }
}

/// A single cell of a dynamically decoded row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "N/A"),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Int(i) => write!(f, "{}", i),
            CellValue::Float(x) => write!(f, "{}", x),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl CellValue {
    /// Numeric view used by result formatting (aggregate detection).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(i) => Some(*i as f64),
            CellValue::Float(x) => Some(*x),
            _ => None,
        }
    }
}

/// One decoded result row: ordered (column name, value) pairs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub columns: Vec<(String, CellValue)>,
}

impl TableRow {
    pub fn new(columns: Vec<(String, CellValue)>) -> Self {
        Self { columns }
    }

    /// Case-insensitive column lookup
    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .find(|(col, _)| col.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Decode a Postgres row into a `TableRow` without compile-time knowledge
/// of its columns.
pub fn decode_row(row: &PgRow) -> Result<TableRow> {
    let mut columns = Vec::with_capacity(row.columns().len());

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name();

        let value = match type_name {
            "INT2" => row
                .try_get::<Option<i16>, _>(i)?
                .map(|v| CellValue::Int(v as i64))
                .unwrap_or(CellValue::Null),
            "INT4" => row
                .try_get::<Option<i32>, _>(i)?
                .map(|v| CellValue::Int(v as i64))
                .unwrap_or(CellValue::Null),
            "INT8" => row
                .try_get::<Option<i64>, _>(i)?
                .map(CellValue::Int)
                .unwrap_or(CellValue::Null),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)?
                .map(|v| CellValue::Float(v as f64))
                .unwrap_or(CellValue::Null),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(i)?
                .map(CellValue::Float)
                .unwrap_or(CellValue::Null),
            // ROUND()/AVG() come back as NUMERIC; parsed through its
            // canonical string form.
            "NUMERIC" => match row.try_get::<Option<sqlx::types::Decimal>, _>(i)? {
                Some(v) => {
                    let text = v.to_string();
                    match text.parse::<f64>() {
                        Ok(parsed) => CellValue::Float(parsed),
                        Err(_) => CellValue::Text(text),
                    }
                }
                None => CellValue::Null,
            },
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)?
                .map(CellValue::Bool)
                .unwrap_or(CellValue::Null),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(i)?
                .map(CellValue::Text)
                .unwrap_or(CellValue::Null),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(i)?
                .map(|v| CellValue::Text(v.to_string()))
                .unwrap_or(CellValue::Null),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(i)?
                .map(|v| CellValue::Text(v.to_string()))
                .unwrap_or(CellValue::Null),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(i)?
                .map(|v| CellValue::Text(v.to_string()))
                .unwrap_or(CellValue::Null),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)?
                .map(|v| CellValue::Text(v.to_rfc3339()))
                .unwrap_or(CellValue::Null),
            _ => row
                .try_get::<Option<String>, _>(i)
                .ok()
                .flatten()
                .map(CellValue::Text)
                .unwrap_or(CellValue::Null),
        };

        columns.push((name, value));
    }

    Ok(TableRow::new(columns))
}

/// Classify a sqlx failure into the error taxonomy the table pipeline
/// recovers from.
fn classify_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            // SQLSTATE class 42 covers syntax errors and unknown
            // columns/tables, the usual failure modes of generated SQL.
            match db.code() {
                Some(code) if code.starts_with("42") => AppError::SqlSyntax { message },
                Some(code) if code.as_ref() == "57014" => AppError::DatabaseConnection {
                    message: format!("statement timed out: {}", message),
                },
                _ => AppError::SqlExecution { message },
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            AppError::DatabaseConnection {
                message: err.to_string(),
            }
        }
        _ => AppError::SqlExecution {
            message: err.to_string(),
        },
    }
}

/// Read-only execution of synthesized queries against the relational store
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Execute a query and decode all rows.
    async fn execute(&self, sql: &str) -> Result<Vec<TableRow>>;
}

/// Postgres-backed store using the shared bounded pool
pub struct PgRelationalStore {
    pool: DbPool,
}

impl PgRelationalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationalStore for PgRelationalStore {
    async fn execute(&self, sql: &str) -> Result<Vec<TableRow>> {
        let rows = sqlx::query(sql)
            .fetch_all(self.pool.inner())
            .await
            .map_err(classify_sqlx_error)?;

        rows.iter().map(decode_row).collect()
    }
}

/// A scripted reply for the mock store
#[derive(Debug, Clone)]
pub enum MockDbReply {
    Rows(Vec<TableRow>),
    Fail(fn() -> AppError),
}

/// Mock store for tests.
///
/// Scripted replies are consumed in order; once the script runs out the
/// fallback reply (if any) answers every further call. Executed SQL is
/// recorded for assertions.
pub struct MockRelationalStore {
    script: parking_lot::Mutex<std::collections::VecDeque<MockDbReply>>,
    fallback: Option<MockDbReply>,
    executed: parking_lot::Mutex<Vec<String>>,
}

impl MockRelationalStore {
    pub fn with_rows(rows: Vec<TableRow>) -> Self {
        Self {
            script: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            fallback: Some(MockDbReply::Rows(rows)),
            executed: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn failing(make_error: fn() -> AppError) -> Self {
        Self {
            script: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            fallback: Some(MockDbReply::Fail(make_error)),
            executed: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn scripted(replies: Vec<MockDbReply>) -> Self {
        Self {
            script: parking_lot::Mutex::new(replies.into()),
            fallback: None,
            executed: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl RelationalStore for MockRelationalStore {
    async fn execute(&self, sql: &str) -> Result<Vec<TableRow>> {
        self.executed.lock().push(sql.to_string());

        let next = self.script.lock().pop_front();
        let reply = match next {
            Some(reply) => reply,
            None => match &self.fallback {
                Some(reply) => reply.clone(),
                None => MockDbReply::Fail(|| AppError::SqlExecution {
                    message: "mock store script exhausted".to_string(),
                }),
            },
        };

        match reply {
            MockDbReply::Rows(rows) => Ok(rows),
            MockDbReply::Fail(make_error) => Err(make_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_display() {
        assert_eq!(CellValue::Int(42).to_string(), "42");
        assert_eq!(CellValue::Float(45.0).to_string(), "45");
        assert_eq!(CellValue::Float(2.5).to_string(), "2.5");
        assert_eq!(CellValue::Text("Uruguay".into()).to_string(), "Uruguay");
        assert_eq!(CellValue::Null.to_string(), "N/A");
    }

    #[test]
    fn test_row_lookup_case_insensitive() {
        let row = TableRow::new(vec![
            ("Winner".to_string(), CellValue::Text("Italy".into())),
            ("Year".to_string(), CellValue::Int(1938)),
        ]);
        assert_eq!(row.get("winner"), Some(&CellValue::Text("Italy".into())));
        assert_eq!(row.get("YEAR"), Some(&CellValue::Int(1938)));
        assert_eq!(row.get("round"), None);
    }

    #[test]
    fn test_row_equality_for_dedup() {
        let a = TableRow::new(vec![("Winner".to_string(), CellValue::Text("Italy".into()))]);
        let b = TableRow::new(vec![("Winner".to_string(), CellValue::Text("Italy".into()))]);
        let c = TableRow::new(vec![("Winner".to_string(), CellValue::Text("Brazil".into()))]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_mock_store() {
        let store = MockRelationalStore::with_rows(vec![TableRow::new(vec![(
            "count".to_string(),
            CellValue::Int(17),
        )])]);
        let rows = store.execute("SELECT count(*) FROM t").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("count"), Some(&CellValue::Int(17)));
        assert_eq!(store.executed(), vec!["SELECT count(*) FROM t"]);
    }

    #[tokio::test]
    async fn test_mock_store_script_order() {
        let store = MockRelationalStore::scripted(vec![
            MockDbReply::Rows(vec![]),
            MockDbReply::Rows(vec![TableRow::new(vec![(
                "Winner".to_string(),
                CellValue::Text("Uruguay".into()),
            )])]),
        ]);

        assert!(store.execute("SELECT 1").await.unwrap().is_empty());
        let rows = store.execute("SELECT 2").await.unwrap();
        assert_eq!(rows[0].get("Winner"), Some(&CellValue::Text("Uruguay".into())));
        // Script exhausted with no fallback.
        assert!(store.execute("SELECT 3").await.is_err());
    }
}
