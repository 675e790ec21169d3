use axum::{routing::get, Router};
use gateway::client::HttpPartitionClient;
use gateway::config::Config;
use gateway::directory::StaticDirectory;
use gateway::extender::Extender;
use gateway::fanout::PartitionFanout;
use gateway::forward::EventForwarder;
use gateway::publisher::HttpReportPublisher;
use gateway::registry::EntityRegistry;
use gateway::{metrics, rest};
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

    info!("Starting insight gateway");
    info!("HTTP server: {}", config.http_addr);
    info!("Partitions: {}", config.partition_endpoints.join(", "));

    // Initialize metrics
    metrics::init_metrics();

    let directory = match StaticDirectory::new(config.partition_endpoints.clone()) {
        Ok(directory) => Arc::new(directory),
        Err(e) => {
            error!("Invalid partition directory: {}", e);
            std::process::exit(1);
        }
    };
    for partition in directory.partitions() {
        info!(
            "Partition [{}, {}] -> {}",
            partition.low_key, partition.high_key, partition.endpoint
        );
    }

    let client = match HttpPartitionClient::new(config.partition_timeout()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let registry = Arc::new(EntityRegistry::new());
    let fanout = Arc::new(PartitionFanout::new(directory.clone(), client.clone(), cancel.clone()));
    let forwarder = Arc::new(EventForwarder::new(registry, directory, client, cancel.clone()));

    // Spawn report extender when a publish target is configured
    let extender_handle = match &config.report_publish_url {
        Some(url) => match HttpReportPublisher::new(url.clone(), config.partition_timeout()) {
            Ok(publisher) => {
                info!("Report publishing enabled");
                let extender = Extender::new(Arc::clone(&fanout), Arc::new(publisher), config.report_interval());
                Some(tokio::spawn(extender.run(cancel.clone())))
            }
            Err(e) => {
                error!("Failed to build report publisher: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("REPORT_PUBLISH_URL not set, report publishing disabled");
            None
        }
    };

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(fanout, forwarder));

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

    cancel.cancel();
    if !server_exited {
        if let Err(e) = server_handle.await {
            error!("HTTP server task failed: {}", e);
        }
    }
    if let Some(handle) = extender_handle {
        if let Err(e) = handle.await {
            error!("Report extender task failed: {}", e);
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
