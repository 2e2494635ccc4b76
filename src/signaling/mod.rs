#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod handler;
pub mod protocol;

pub use handler::{register_broadcast_hooks, MessageHandler};

use crate::auth::jwt;
use crate::metrics::{RegistrySnapshot, ServerMetrics};
use crate::session::SessionManager;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    handler: MessageHandler,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    jwt_secret: Option<Arc<str>>,
    metrics_token: Option<Arc<str>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
    name: Option<String>,
}

impl SignalingServer {
    pub fn new(
        handler: MessageHandler,
        metrics: ServerMetrics,
        max_connections: usize,
        jwt_secret: Option<String>,
        metrics_token: Option<String>,
    ) -> Self {
        info!("Max connections: {}", max_connections);
        if jwt_secret.is_some() {
            info!("JWT authentication enabled");
        } else {
            info!("JWT_SECRET not set, every client connects as a guest");
        }

        Self {
            handler,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            jwt_secret: jwt_secret.map(Arc::from),
            metrics_token: metrics_token.map(Arc::from),
        }
    }

    fn sessions(&self) -> &Arc<SessionManager> {
        self.handler.sessions()
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let sessions = server.sessions();
    Json(serde_json::json!({
        "status": "ok",
        "sessions": sessions.members().len(),
        "admins": sessions.admins().len(),
        "hasHost": sessions.has_host(),
    }))
}

/// Metrics handler - Prometheus text exposition format.
/// Protected by the optional METRICS_TOKEN (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.metrics_token.as_deref() {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let sessions = server.sessions();
    let body = server.metrics.render_prometheus(RegistrySnapshot {
        sessions: sessions.count(),
        members: sessions.members().len(),
        has_host: sessions.has_host(),
    });
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let token = params.token.as_deref().or_else(|| bearer_token(&headers));
    let (identity, profile) = match jwt::resolve_profile(token, params.name.as_deref(), server.jwt_secret.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!("Rejecting WebSocket upgrade from {}: {}", remote, e);
            return e.into_response();
        }
    };

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                identity,
                profile,
                Some(remote.to_string()),
                server.handler,
                server.metrics,
                permit,
            )
        })
}
