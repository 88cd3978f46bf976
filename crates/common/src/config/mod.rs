//! Configuration management for Tandem services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values
//!
//! The pipeline-facing knobs (cache TTLs, pool bounds, retrieval breadth,
//! per-call timeouts) all live here so the engine never reads ambient state.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Language-model service configuration
    pub llm: LlmConfig,

    /// Embedding service configuration
    pub embedding: EmbeddingConfig,

    /// Narrative retrieval configuration
    pub retrieval: RetrievalConfig,

    /// In-memory cache configuration
    pub cache: CacheConfig,

    /// Pipeline execution configuration
    pub pipeline: PipelineConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL for the relational store holding extracted table rows
    pub url: String,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of pooled connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Per-statement timeout applied to synthesized queries, in milliseconds
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Chat-completion endpoint (OpenAI-compatible)
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// API key; an empty key switches the client to canned replies for
    /// local development
    #[serde(default)]
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Output token ceiling per completion
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Passages retrieved for short sub-questions
    #[serde(default = "default_min_top_k")]
    pub min_top_k: usize,

    /// Passages retrieved for long sub-questions
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// Sub-questions with fewer words than this count as short
    #[serde(default = "default_short_question_words")]
    pub short_question_words: usize,

    /// Sub-questions with more words than this count as long
    #[serde(default = "default_long_question_words")]
    pub long_question_words: usize,

    /// Minimum similarity score; below this across all passages the
    /// narrative pipeline reports no relevant context
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Schema descriptor TTL in seconds
    #[serde(default = "default_schema_ttl")]
    pub schema_ttl_secs: u64,

    /// Bounded size of the classification cache
    #[serde(default = "default_classification_max_entries")]
    pub classification_max_entries: usize,

    /// Classification decision TTL in seconds
    #[serde(default = "default_classification_ttl")]
    pub classification_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Timeout applied to each external call (model, vector search, SQL),
    /// in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8010 }
fn default_request_timeout() -> u64 { 60 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 5 }
fn default_min_connections() -> u32 { 1 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_statement_timeout() -> u64 { 30_000 }
fn default_llm_endpoint() -> String { "https://api.openai.com/v1".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 30 }
fn default_max_output_tokens() -> u32 { 1024 }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 768 }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_min_top_k() -> usize { 3 }
fn default_max_top_k() -> usize { 5 }
fn default_short_question_words() -> usize { 10 }
fn default_long_question_words() -> usize { 20 }
fn default_min_score() -> f32 { 0.25 }
fn default_schema_ttl() -> u64 { 300 }
fn default_classification_max_entries() -> usize { 100 }
fn default_classification_ttl() -> u64 { 300 }
fn default_call_timeout() -> u64 { 30_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "tandem".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8010)?
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__DATABASE__MAX_CONNECTIONS=5
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get per-call timeout as Duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.call_timeout_ms)
    }

    /// Get schema cache TTL as Duration
    pub fn schema_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.schema_ttl_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                request_timeout_secs: default_request_timeout(),
                shutdown_timeout_secs: default_shutdown_timeout(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/tandem".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                statement_timeout_ms: default_statement_timeout(),
            },
            llm: LlmConfig {
                endpoint: default_llm_endpoint(),
                api_key: String::new(),
                model: default_llm_model(),
                timeout_secs: default_llm_timeout(),
                max_output_tokens: default_max_output_tokens(),
            },
            embedding: EmbeddingConfig {
                provider: default_embedding_provider(),
                api_key: None,
                api_base: None,
                model: default_embedding_model(),
                dimension: default_embedding_dimension(),
                timeout_secs: default_embedding_timeout(),
                max_retries: default_embedding_retries(),
            },
            retrieval: RetrievalConfig {
                min_top_k: default_min_top_k(),
                max_top_k: default_max_top_k(),
                short_question_words: default_short_question_words(),
                long_question_words: default_long_question_words(),
                min_score: default_min_score(),
            },
            cache: CacheConfig {
                schema_ttl_secs: default_schema_ttl(),
                classification_max_entries: default_classification_max_entries(),
                classification_ttl_secs: default_classification_ttl(),
            },
            pipeline: PipelineConfig {
                call_timeout_ms: default_call_timeout(),
            },
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logging: default_json_logging(),
                metrics_port: default_metrics_port(),
                service_name: default_service_name(),
            },
        }
    }
}
