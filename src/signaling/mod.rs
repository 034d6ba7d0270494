#![forbid(unsafe_code)]

// Signaling module - WebSocket relay server

pub mod call;
pub mod chat;
pub mod connection;
pub mod protocol;

use crate::auth::{jwt, ticket, AuthError};
use crate::cache::Cache;
use crate::db::Store;
use crate::metrics::ServerMetrics;
use crate::registry::Registry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Relay server state
#[derive(Clone)]
pub struct RelayServer {
    store: Arc<Store>,
    cache: Cache,
    registry: Arc<Registry>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    jwt_secret: Option<String>,
}

impl RelayServer {
    pub fn new(store: Arc<Store>, cache: Cache, registry: Arc<Registry>, metrics: ServerMetrics) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        let jwt_secret = std::env::var("JWT_SECRET").ok();
        if jwt_secret.is_some() {
            info!("JWT ticket minting enabled");
        } else {
            info!("JWT_SECRET not set — ticket minting route disabled");
        }

        Self {
            store,
            cache,
            registry,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            jwt_secret,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Creates the Axum router for the relay server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/auth/ws-ticket", get(ticket_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the relay server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting relay server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<RelayServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": server.registry.connection_count(),
        "rooms": server.registry.rooms_active(),
        "users": server.registry.users_active(),
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(State(server): State<RelayServer>, headers: HeaderMap) -> Response {
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {}", expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.registry.rooms_active();
    let users = server.registry.users_active();
    let body = server.metrics.render_prometheus(rooms, users);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Mint a one-shot WebSocket ticket for a Bearer-authenticated user.
async fn ticket_handler(
    State(server): State<RelayServer>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AuthError> {
    let secret = server.jwt_secret.as_deref().ok_or(AuthError::NotConfigured)?;
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;
    let claims = jwt::validate_token(token, secret)?;

    let ticket = ticket::issue(&server.cache, &claims.sub, &claims.name)
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "ticket": ticket,
        "expiresInSec": ticket::TICKET_TTL_SECS,
    })))
}

/// WebSocket upgrade handler. The ticket rides the query string; it is
/// consumed after the upgrade so the failure can carry a close code.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(server): State<RelayServer>,
) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let ticket = params.get("ticket").cloned();

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server, ticket, permit))
}
