//! Broadcast hub for live viewers.
//!
//! The viewer set is owned by a single loop. Everything else talks to it
//! through a cloneable [`HubHandle`] that sends on three channels: register,
//! unregister and broadcast. Delivery to each viewer is a non-blocking
//! enqueue; a viewer that cannot take a message is removed and closed.

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of a registered viewer.
pub type ViewerId = Uuid;

/// Errors returned by a viewer write.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewerError {
    #[error("Viewer queue full")]
    Full,

    #[error("Viewer connection closed")]
    Closed,
}

/// Errors returned by the hub handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub is busy, message dropped")]
    Busy,

    #[error("Hub has shut down")]
    Closed,
}

/// A connected client subscribed to broadcast frames.
pub trait Viewer: Send + Sync + 'static {
    fn id(&self) -> ViewerId;

    /// Enqueue a message without waiting.
    fn send(&self, message: Arc<str>) -> Result<(), ViewerError>;

    /// Close the underlying connection.
    fn close(&self);
}

/// Viewer backed by a bounded channel drained by a connection writer task.
pub struct ChannelViewer {
    id: ViewerId,
    tx: Mutex<Option<mpsc::Sender<Arc<str>>>>,
}

impl ChannelViewer {
    /// Create a viewer and the receiver its connection task reads from.
    ///
    /// The receiver yields `None` once the hub closes the viewer.
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(queue_size);
        let viewer = Self {
            id: Uuid::new_v4(),
            tx: Mutex::new(Some(tx)),
        };
        (viewer, rx)
    }
}

impl Viewer for ChannelViewer {
    fn id(&self) -> ViewerId {
        self.id
    }

    fn send(&self, message: Arc<str>) -> Result<(), ViewerError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(ViewerError::Closed)?;
        tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ViewerError::Full,
            mpsc::error::TrySendError::Closed(_) => ViewerError::Closed,
        })
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// JSON envelope pushed to viewers for every forwarded frame.
#[derive(Debug, Serialize)]
struct FrameMessage<'a> {
    camera: &'a str,
    image: String,
}

/// Encode a raw frame as `{"camera": ..., "image": base64}`.
pub fn encode_frame_message(camera_id: &str, frame: &[u8]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&FrameMessage {
        camera: camera_id,
        image: STANDARD.encode(frame),
    })
}

/// Hub statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub viewers: usize,
    /// Broadcasts handled by the hub loop, including those with no viewers
    pub messages_broadcast: u64,
    pub viewers_removed: u64,
}

#[derive(Default)]
struct HubShared {
    client_count: AtomicUsize,
    messages_broadcast: AtomicU64,
    viewers_removed: AtomicU64,
}

/// Cloneable entry point to the hub loop.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Box<dyn Viewer>>,
    unregister_tx: mpsc::Sender<ViewerId>,
    broadcast_tx: mpsc::Sender<Arc<str>>,
    shared: Arc<HubShared>,
}

impl HubHandle {
    /// Add a viewer to the broadcast set.
    pub async fn register(&self, viewer: Box<dyn Viewer>) -> Result<(), HubError> {
        self.register_tx.send(viewer).await.map_err(|_| HubError::Closed)
    }

    /// Remove and close a viewer. Unknown ids are ignored.
    pub async fn unregister(&self, id: ViewerId) -> Result<(), HubError> {
        self.unregister_tx.send(id).await.map_err(|_| HubError::Closed)
    }

    /// Queue a message for every registered viewer without waiting.
    pub fn broadcast(&self, message: impl Into<Arc<str>>) -> Result<(), HubError> {
        self.broadcast_tx
            .try_send(message.into())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HubError::Busy,
                mpsc::error::TrySendError::Closed(_) => HubError::Closed,
            })
    }

    /// Number of registered viewers as last published by the hub loop.
    pub fn client_count(&self) -> usize {
        self.shared.client_count.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            viewers: self.client_count(),
            messages_broadcast: self.shared.messages_broadcast.load(Ordering::Relaxed),
            viewers_removed: self.shared.viewers_removed.load(Ordering::Relaxed),
        }
    }
}

/// The single-owner hub loop.
pub struct BroadcastHub {
    register_rx: mpsc::Receiver<Box<dyn Viewer>>,
    unregister_rx: mpsc::Receiver<ViewerId>,
    broadcast_rx: mpsc::Receiver<Arc<str>>,
    viewers: HashMap<ViewerId, Box<dyn Viewer>>,
    shared: Arc<HubShared>,
}

impl BroadcastHub {
    /// Create the hub loop and its handle. `capacity` bounds each inbound channel.
    pub fn new(capacity: usize) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let shared = Arc::new(HubShared::default());

        let hub = Self {
            register_rx,
            unregister_rx,
            broadcast_rx,
            viewers: HashMap::new(),
            shared: shared.clone(),
        };

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            shared,
        };

        (hub, handle)
    }

    /// Run until `shutdown` fires or every handle is dropped, then close
    /// all remaining viewers.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Broadcast hub started");

        // every handle owns all three senders, so one closed channel means
        // no handle is left
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                viewer = self.register_rx.recv() => match viewer {
                    Some(viewer) => self.add(viewer),
                    None => break,
                },
                id = self.unregister_rx.recv() => match id {
                    Some(id) => self.remove(&id),
                    None => break,
                },
                message = self.broadcast_rx.recv() => match message {
                    Some(message) => self.deliver(message),
                    None => break,
                },
            }
        }

        for (_, viewer) in self.viewers.drain() {
            viewer.close();
        }
        self.publish_count();

        info!("Broadcast hub stopped");
    }

    fn add(&mut self, viewer: Box<dyn Viewer>) {
        let id = viewer.id();
        self.viewers.insert(id, viewer);
        self.publish_count();
        info!(viewer_id = %id, total = self.viewers.len(), "Viewer connected");
    }

    fn remove(&mut self, id: &ViewerId) {
        if let Some(viewer) = self.viewers.remove(id) {
            viewer.close();
            self.publish_count();
            info!(viewer_id = %id, total = self.viewers.len(), "Viewer disconnected");
        }
    }

    fn deliver(&mut self, message: Arc<str>) {
        self.shared.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        if self.viewers.is_empty() {
            return;
        }

        let mut failed = Vec::new();
        for (id, viewer) in &self.viewers {
            if let Err(e) = viewer.send(message.clone()) {
                warn!(viewer_id = %id, error = %e, "Error sending message, dropping viewer");
                failed.push(*id);
            }
        }

        for id in &failed {
            if let Some(viewer) = self.viewers.remove(id) {
                viewer.close();
            }
        }

        if !failed.is_empty() {
            self.shared
                .viewers_removed
                .fetch_add(failed.len() as u64, Ordering::Relaxed);
            metrics::counter!("watchpost.hub.viewers_removed").increment(failed.len() as u64);
            self.publish_count();
        }

        debug!(viewers = self.viewers.len(), "Message broadcast");
    }

    fn publish_count(&self) {
        self.shared
            .client_count
            .store(self.viewers.len(), Ordering::Release);
    }
}
