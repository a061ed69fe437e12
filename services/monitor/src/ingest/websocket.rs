//! WebSocket camera connections.

use super::dispatch;
use crate::dispatcher::Dispatcher;
use crate::server::ConnectionSettings;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serve one camera connection until it closes or goes silent.
///
/// Every binary message is a complete frame. Text messages are camera
/// diagnostics and only logged.
pub async fn handle_camera(
    socket: WebSocket,
    camera_id: String,
    dispatcher: Arc<Dispatcher>,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) {
    info!(camera_id = %camera_id, "Camera connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut ping = tokio::time::interval(settings.ping_interval);
    let idle = tokio::time::sleep(settings.read_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut idle => {
                warn!(camera_id = %camera_id, "Camera read timeout");
                break;
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                idle.as_mut().reset(Instant::now() + settings.read_timeout);

                match msg {
                    Some(Ok(Message::Binary(frame))) => {
                        dispatch(&dispatcher, frame, &camera_id).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(camera_id = %camera_id, message = %text, "Camera message");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(camera_id = %camera_id, error = %e, "Camera connection error");
                        break;
                    }
                }
            }
        }
    }

    let _ = ws_tx.close().await;
    info!(camera_id = %camera_id, "Camera disconnected");
}
