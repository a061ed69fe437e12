//! HTTP and WebSocket endpoints.
//!
//! - `GET /api/camera?id=<name>` camera frame ingestion (WebSocket)
//! - `GET /api/view` live viewer subscription (WebSocket)
//! - `GET /api/stats` pipeline statistics
//! - `GET /health` liveness

use crate::buffer::FrameBuffer;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::hub::{ChannelViewer, HubHandle, Viewer};
use crate::ingest::handle_camera;
use crate::storage::SqliteStore;
use crate::worker_pool::WorkerPoolStats;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Errors raised by the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Keepalive and queueing settings for WebSocket connections.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub viewer_queue_size: usize,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            read_timeout: config.read_timeout(),
            viewer_queue_size: config.viewer_queue_size,
        }
    }
}

/// Shared state for request handlers.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub hub: HubHandle,
    pub buffer: Arc<FrameBuffer>,
    pub worker_stats: Arc<RwLock<WorkerPoolStats>>,
    pub storage: Option<Arc<SqliteStore>>,
    pub settings: ConnectionSettings,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

#[derive(Debug, Deserialize)]
struct CameraParams {
    id: Option<String>,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/camera", get(camera_upgrade))
        .route("/api/view", get(viewer_upgrade))
        .route("/api/stats", get(api_stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the HTTP listener.
pub async fn bind(address: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.to_string(),
            source,
        })
}

/// Serve until the state's shutdown token fires.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<(), ServerError> {
    let shutdown = state.shutdown.clone();

    if let Ok(address) = listener.local_addr() {
        info!(address = %address, "HTTP server listening");
    }

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(ServerError::Serve)
}

async fn camera_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<CameraParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let camera_id = params
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("unknown_{}", peer.ip()));

    ws.on_upgrade(move |socket| {
        handle_camera(
            socket,
            camera_id,
            state.dispatcher.clone(),
            state.settings,
            state.shutdown.clone(),
        )
    })
}

async fn viewer_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(socket, state))
}

/// Forward hub messages to one viewer until either side gives up.
async fn handle_viewer(socket: WebSocket, state: Arc<AppState>) {
    let settings = state.settings;
    let (viewer, mut outbound) = ChannelViewer::new(settings.viewer_queue_size);
    let viewer_id = viewer.id();

    if state.hub.register(Box::new(viewer)).await.is_err() {
        debug!("Hub closed, rejecting viewer");
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut ping = tokio::time::interval(settings.ping_interval);
    let idle = tokio::time::sleep(settings.read_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = &mut idle => {
                warn!(viewer_id = %viewer_id, "Viewer read timeout");
                break;
            }
            message = outbound.recv() => {
                // `None` means the hub dropped this viewer
                let Some(message) = message else { break };
                if ws_tx.send(Message::Text(message.to_string())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + settings.read_timeout);
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = state.hub.unregister(viewer_id).await;
    let _ = ws_tx.close().await;
}

async fn api_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let storage = match &state.storage {
        Some(store) => match store.stats().await {
            Ok(stats) => serde_json::to_value(stats).unwrap_or(serde_json::Value::Null),
            Err(e) => {
                warn!(error = %e, "Failed to read storage statistics");
                serde_json::Value::Null
            }
        },
        None => serde_json::Value::Null,
    };

    Json(serde_json::json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "processing_interval": state.dispatcher.processing_interval(),
        "frames_per_camera": state.dispatcher.frame_stats(),
        "dispatcher": state.dispatcher.stats(),
        "workers": state.worker_stats.read().clone(),
        "buffer": state.buffer.stats(),
        "hub": state.hub.stats(),
        "storage": storage,
    }))
}

async fn health() -> &'static str {
    "OK"
}
