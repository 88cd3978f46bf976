//! Tandem Common Library
//!
//! Shared code for the Tandem services including:
//! - Error types and handling
//! - Configuration management
//! - In-memory caches (TTL and bounded FIFO)
//! - Database pool and dynamic row decoding
//! - Schema descriptors and registry access
//! - Language-model and embedding clients
//! - Metrics and observability

pub mod cache;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod schema;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{CellValue, DbPool, RelationalStore, TableRow};
pub use embeddings::Embedder;
pub use errors::{AppError, ErrorCode, Result};
pub use llm::CompletionClient;
pub use schema::{SchemaDescriptor, SchemaStore};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
