//! docpilot gateway
//!
//! The streaming front door for the documentation assistant.
//! Handles:
//! - Websocket chat (queries, highlights, cancellation)
//! - Rate limiting
//! - Health and readiness probes
//! - Observability (logging, metrics)

mod handlers;
mod middleware;
mod protocol;
mod state;
mod stream;

use axum::{routing::get, Router};
use docpilot_common::{
    cache::{CacheStore, RedisCache},
    config::AppConfig,
    db::DbPool,
    metrics,
};
use docpilot_conversation::{create_generation_client, ConversationEngine, SessionStore};
use docpilot_retrieval::{
    create_embedder, create_index, CachedEmbedder, CachedRetriever, Retriever, VectorRetriever,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::middleware::rate_limit;
use crate::state::{AppState, RetrieverTools};
use crate::stream::QueryServices;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;
    let config = Arc::new(config);

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }

    info!("Starting docpilot gateway v{}", docpilot_common::VERSION);

    // Initialize metrics
    metrics::register_metrics();
    if config.observability.metrics_port > 0 {
        let exporter = PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.observability.metrics_port));
        if let Err(error) = exporter.install() {
            warn!(%error, "Prometheus exporter failed to start, metrics stay process-local");
        }
    }

    // Create app state
    let state = build_state(config.clone()).await?;

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wire the retrieval and conversation stack behind the shared state.
/// Redis and Postgres are optional; without them the gateway runs on
/// in-process fallbacks.
async fn build_state(config: Arc<AppConfig>) -> Result<AppState, Box<dyn std::error::Error>> {
    let cache: Option<Arc<dyn CacheStore>> = if config.redis.enabled {
        match RedisCache::connect(&config.redis.url).await {
            Ok(cache) => {
                info!("Redis cache connected");
                Some(Arc::new(cache))
            }
            Err(error) => {
                warn!(%error, "Redis unavailable, running without the cache layer");
                None
            }
        }
    } else {
        None
    };

    let mut embedder = create_embedder(&config.embedding)?;
    if let Some(cache) = &cache {
        embedder = Arc::new(CachedEmbedder::new(
            embedder,
            cache.clone(),
            Duration::from_secs(config.redis.embedding_ttl_secs),
        ));
    }

    let db = if config.index.backend == "pgvector" {
        info!("Connecting to database...");
        Some(DbPool::new(&config.database).await?)
    } else {
        None
    };

    let index = create_index(&config, db.clone()).await?;

    let mut retriever: Arc<dyn Retriever> = Arc::new(VectorRetriever::new(embedder, index));
    if let Some(cache) = &cache {
        retriever = Arc::new(CachedRetriever::new(
            retriever,
            cache.clone(),
            Duration::from_secs(config.redis.response_ttl_secs),
        ));
    }

    let client = create_generation_client(&config.generation)?;
    let tools = RetrieverTools::new(retriever.clone(), config.retrieval.clone());
    let engine = Arc::new(
        ConversationEngine::new(client, config.generation.clone()).with_tools(Arc::new(tools)),
    );

    let sessions = Arc::new(SessionStore::new(&config.session));
    let _sweeper = SessionStore::spawn_sweeper(sessions.clone());

    let services = Arc::new(QueryServices {
        config: config.clone(),
        sessions,
        retriever,
        engine,
    });

    let identity_limiter = rate_limit::identity_limiter(&config.rate_limit);

    Ok(AppState {
        config,
        services,
        identity_limiter,
        db,
        cache,
    })
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
    let api_routes = Router::new().route("/chat", get(handlers::chat::ws_handler));

    // Compose the app; probes stay outside the versioned surface
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
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
