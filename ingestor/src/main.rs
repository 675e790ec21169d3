use axum::{routing::get, Router};
use ingestor::config::Config;
use ingestor::ingest::IngestionService;
use ingestor::store::{self, postgres, MemoryStore, PgStore, TransactionalStore};
use ingestor::{metrics, rest};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    let node_id = format!("ingestor-{}", uuid::Uuid::new_v4());
    info!("Starting partition node {}", node_id);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_display());
    info!(
        "Retry policy: {} attempts, {}ms base interval",
        config.retry_max_attempts, config.retry_base_interval_ms
    );

    // Initialize metrics
    metrics::init_metrics();

    let store: Arc<dyn TransactionalStore> = match &config.database_url {
        Some(url) => match postgres::make_pool(url).await {
            Ok(pool) => Arc::new(PgStore::new(pool, config.lock_timeout())),
            Err(e) => {
                error!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        },
        None => Arc::new(MemoryStore::new(config.lock_timeout())),
    };

    if let Err(e) = store::ensure_collections(store.as_ref()).await {
        error!("Failed to create collections: {}", e);
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    let service = Arc::new(IngestionService::new(store, config.retry_policy(), cancel.clone()));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(service, config.queue_length_include_in_progress));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let shutdown = cancel.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    let server_exited = tokio::select! {
        _ = &mut server_handle => {
            error!("HTTP server terminated");
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
    };

    // In-flight transactions observe the token and roll back
    cancel.cancel();
    if !server_exited {
        if let Err(e) = server_handle.await {
            error!("HTTP server task failed: {}", e);
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
