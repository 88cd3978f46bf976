//! Tandem API Server
//!
//! HTTP entry point for question answering over hybrid documents.
//! Wires the answer engine to the relational store, the vector index,
//! and the completion model, and exposes the answer routes.

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem_common::{
    config::AppConfig,
    db::{DbPool, PgRelationalStore},
    embeddings::create_embedder,
    llm::create_completion_client,
    metrics,
    schema::PgSchemaStore,
};
use tandem_engine::retrieval::PgVectorIndex;
use tandem_engine::AnswerEngine;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DbPool,
    pub engine: Arc<AnswerEngine>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Tandem API server v{}", tandem_common::VERSION);

    // Initialize metrics
    metrics::register_metrics();
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.observability.metrics_port))
        .install()?;

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;

    // Wire the answer engine to its dependencies
    let llm = create_completion_client(&config.llm)?;
    let embedder = create_embedder(&config.embedding)?;
    let store = Arc::new(PgRelationalStore::new(db.clone()));
    let schema_store = Arc::new(PgSchemaStore::new(db.clone()));
    let index = Arc::new(PgVectorIndex::new(db.clone(), embedder));
    let engine = Arc::new(AnswerEngine::new(llm, store, index, schema_store, &config));

    let config = Arc::new(config);
    let state = AppState {
        config: config.clone(),
        db,
        engine,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        // Answer endpoints
        .route("/answer", post(handlers::answer::answer))
        .route("/classify", post(handlers::answer::classify))
        .route("/compare", post(handlers::answer::compare));

    // Compose the app
    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
