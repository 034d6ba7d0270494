#![forbid(unsafe_code)]

mod auth;
mod cache;
mod client;
mod db;
mod metrics;
mod presence;
mod registry;
mod rooms;
mod signaling;

use anyhow::Result;
use cache::Cache;
use db::Store;
use metrics::ServerMetrics;
use registry::Registry;
use signaling::RelayServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomwire=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Roomwire - Starting relay server");

    let store = Arc::new(Store::connect().await?);
    let cache = Cache::connect().await?;
    let registry = Arc::new(Registry::new());
    let metrics = ServerMetrics::new();

    let server = RelayServer::new(store, cache, registry, metrics);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Relay server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
