//! Schema descriptors for extracted document tables
//!
//! Provides:
//! - `SchemaDescriptor` / `TableSchema` types mirroring the registry the
//!   ingestion subsystem maintains
//! - The `SchemaStore` read seam plus Postgres and in-memory backends
//! - `CachedSchemaProvider`, the TTL-mirrored read path the engine injects
//!
//! Descriptors are immutable once written; the cache drops entries on TTL
//! expiry and re-fetches rather than refreshing in place.

use crate::cache::{keys, TtlCache};
use crate::db::DbPool;
use crate::errors::Result;
use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One column of an extracted table, with its declared casing preserved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
}

/// One extracted table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Physical table name in the relational store, quoted verbatim in SQL
    pub table_name: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub indexed_columns: Vec<String>,
}

/// Per-document schema descriptor covering one or more structured tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub document_id: uuid::Uuid,
    pub tables: Vec<TableSchema>,
    pub created_at: DateTime<Utc>,
}

impl SchemaDescriptor {
    /// The table synthesized queries target by default. Descriptors are
    /// only constructed with at least one table.
    pub fn primary_table(&self) -> Option<&TableSchema> {
        self.tables.first()
    }

    /// Case-insensitive membership over the union of all tables' columns.
    pub fn has_column(&self, name: &str) -> bool {
        self.tables.iter().any(|t| {
            t.columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(name))
        })
    }

    /// Declared column names across all tables, declared casing preserved.
    pub fn all_column_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for table in &self.tables {
            for column in &table.columns {
                if !names
                    .iter()
                    .any(|n: &&str| n.eq_ignore_ascii_case(&column.name))
                {
                    names.push(column.name.as_str());
                }
            }
        }
        names
    }

    /// Render the descriptor as the prompt block shared by the router and
    /// the SQL synthesis step.
    pub fn prompt_block(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("Table \"{}\":\n", table.table_name));
            for column in &table.columns {
                out.push_str(&format!("  - {} ({})\n", column.name, column.data_type));
            }
            if !table.indexed_columns.is_empty() {
                out.push_str(&format!(
                    "  indexed: {}\n",
                    table.indexed_columns.join(", ")
                ));
            }
        }
        out
    }
}

/// Read access to the ingestion-owned schema registry
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Returns `None` when the document exists but has no structured table.
    async fn get_schema(&self, document_id: uuid::Uuid) -> Result<Option<SchemaDescriptor>>;
}

/// Postgres-backed registry reader.
///
/// The ingestion subsystem writes one `table_registry` row per extracted
/// table: (document_id uuid, table_name text, columns jsonb,
/// indexed_columns text[], created_at timestamptz).
pub struct PgSchemaStore {
    pool: DbPool,
}

impl PgSchemaStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaStore for PgSchemaStore {
    async fn get_schema(&self, document_id: uuid::Uuid) -> Result<Option<SchemaDescriptor>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name, columns, indexed_columns, created_at
            FROM table_registry
            WHERE document_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(document_id)
        .fetch_all(self.pool.inner())
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut tables = Vec::with_capacity(rows.len());
        let mut created_at: DateTime<Utc> = Utc::now();

        for row in &rows {
            let table_name: String = row.try_get("table_name")?;
            let columns_json: serde_json::Value = row.try_get("columns")?;
            let columns: Vec<ColumnDescriptor> = serde_json::from_value(columns_json)?;
            let indexed_columns: Option<Vec<String>> = row.try_get("indexed_columns")?;
            created_at = row.try_get("created_at")?;

            tables.push(TableSchema {
                table_name,
                columns,
                indexed_columns: indexed_columns.unwrap_or_default(),
            });
        }

        Ok(Some(SchemaDescriptor {
            document_id,
            tables,
            created_at,
        }))
    }
}

/// In-memory store for tests and local development
#[derive(Default)]
pub struct InMemorySchemaStore {
    schemas: HashMap<uuid::Uuid, SchemaDescriptor>,
}

impl InMemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, descriptor: SchemaDescriptor) -> Self {
        self.schemas.insert(descriptor.document_id, descriptor);
        self
    }
}

#[async_trait]
impl SchemaStore for InMemorySchemaStore {
    async fn get_schema(&self, document_id: uuid::Uuid) -> Result<Option<SchemaDescriptor>> {
        Ok(self.schemas.get(&document_id).cloned())
    }
}

/// TTL-mirrored read path over a `SchemaStore`.
///
/// Absence is cached too: a document without tables should not hit durable
/// storage on every question.
pub struct CachedSchemaProvider {
    store: Arc<dyn SchemaStore>,
    cache: TtlCache<Option<SchemaDescriptor>>,
}

impl CachedSchemaProvider {
    pub fn new(store: Arc<dyn SchemaStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl),
        }
    }

    pub async fn get(&self, document_id: uuid::Uuid) -> Result<Option<SchemaDescriptor>> {
        let key = keys::schema(document_id);

        if let Some(cached) = self.cache.get(&key) {
            metrics::record_cache(true, "schema");
            return Ok(cached);
        }
        metrics::record_cache(false, "schema");

        let fetched = self.store.get_schema(document_id).await?;
        self.cache.insert(&key, fetched.clone());
        Ok(fetched)
    }
}
