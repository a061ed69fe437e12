//! Camera transports feeding complete frames to the dispatcher.
//!
//! - UDP: JPEG frames split across datagrams, reassembled per source address
//! - WebSocket: one binary message per complete frame

pub mod udp;
pub mod websocket;

pub use udp::UdpIngest;
pub use websocket::handle_camera;

use crate::dispatcher::Dispatcher;
use std::sync::Arc;
use tracing::error;

/// Hand a frame to the dispatcher off the async runtime.
///
/// Motion gating decodes the frame, so it runs on the blocking pool. The
/// caller awaits it, which keeps frames of one connection in order.
pub(crate) async fn dispatch(dispatcher: &Arc<Dispatcher>, frame: Vec<u8>, camera_id: &str) {
    let dispatcher = dispatcher.clone();
    let camera = camera_id.to_string();

    if let Err(e) = tokio::task::spawn_blocking(move || dispatcher.handle_frame(frame, &camera)).await {
        error!(camera_id = %camera_id, error = %e, "Frame dispatch task failed");
    }
}
