//! Watchpost Monitor
//!
//! Camera frame pipeline for a small surveillance deployment. Cameras push
//! JPEG frames over UDP or WebSocket; every frame is forwarded to live
//! viewers, cheaply gated for motion, and motion-positive frames go through
//! object detection. Frames with detections are annotated, buffered per
//! camera and flushed periodically to disk and SQLite.
//!
//! ## Architecture
//!
//! ```text
//!  UDP chunks ──▶ FrameAssembler ─┐
//!                                 ├──▶ Dispatcher ──▶ BroadcastHub ──▶ viewers
//!  WebSocket frames ──────────────┘        │
//!                                   motion gate
//!                                          │
//!                                          ▼
//!                                     TaskQueue (bounded, drop when full)
//!                                          │
//!                                          ▼
//!                                     WorkerPool (one Detector per worker)
//!                                          │
//!                                          ▼
//!                                     FrameBuffer ──[flush ticker]──▶ image dir + Storage
//! ```

pub mod assembler;
pub mod buffer;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod hub;
pub mod ingest;
pub mod queue;
pub mod registry;
pub mod server;
pub mod storage;
pub mod worker_pool;

pub use assembler::{AssemblyError, CameraDirectory, FrameAssembler};
pub use buffer::{frame_filename, BufferStats, FlushReport, FrameBuffer};
pub use config::{ConfigValidationError, MonitorConfig};
pub use detector::{worker_detectors, Detection, Detector, DetectorError, FrameDiffDetector, OnnxModel};
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use hub::{BroadcastHub, ChannelViewer, HubError, HubHandle, Viewer};
pub use ingest::UdpIngest;
pub use queue::{ProcessingTask, QueueError, TaskQueue};
pub use registry::CameraRegistry;
pub use server::{AppState, ConnectionSettings, ServerError};
pub use storage::{NewImage, SqliteStore, Storage, StorageError};
pub use worker_pool::{WorkerPool, WorkerPoolStats};
