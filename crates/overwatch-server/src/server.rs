use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use overwatch_core::ids::SessionId;

use crate::connection::{self, ConnectionConfig};
use crate::handlers::{self, HandlerState};
use crate::maintenance;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub ping_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9292,
            max_send_queue: 256,
            ping_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub connection: ConnectionConfig,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{session_id}", get(ws_handler))
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, serve, and start the maintenance loop. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, handler_state: Arc<HandlerState>) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let gateway = Arc::clone(&handler_state.gateway);

    let app_state = AppState {
        handler_state,
        connection: ConnectionConfig {
            max_send_queue: config.max_send_queue,
            ping_interval: config.ping_interval,
        },
    };
    let router = build_router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "overwatch server started");

    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });
    let maintenance = maintenance::spawn(gateway, config.sweep_interval, shutdown.clone());

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        maintenance,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for background tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.maintenance.await;
        // Open WebSockets keep graceful shutdown waiting; cut them off after a grace period.
        let mut server = self.server;
        if tokio::time::timeout(Duration::from_secs(5), &mut server).await.is_err() {
            server.abort();
        }
        tracing::info!("overwatch server stopped");
    }
}

/// WebSocket upgrade handler. Query-string pairs become connection metadata.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session_id = SessionId::from_raw(session_id.trim());
    if session_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "session id is required").into_response();
    }
    let metadata: serde_json::Map<String, Value> = query.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    let metadata = Value::Object(metadata);
    let gateway = Arc::clone(&state.handler_state.gateway);
    let config = state.connection.clone();

    ws.on_upgrade(move |socket| connection::handle_ws_connection(socket, session_id, metadata, gateway, config))
        .into_response()
}

/// JSON-RPC over HTTP.
async fn rpc_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(_) => return Json(RpcResponse::parse_error()),
    };
    let params = request.params.unwrap_or_else(|| serde_json::json!({}));
    Json(handlers::dispatch(&state.handler_state, &request.method, &params, request.id).await)
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (healthy, body) = handlers::health_snapshot(&state.handler_state);
    let http_status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (http_status, Json(body))
}
