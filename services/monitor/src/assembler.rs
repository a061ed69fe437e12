//! Frame reassembly from transport chunks.
//!
//! UDP cameras split each JPEG across many datagrams. The assembler keeps one
//! accumulation buffer per camera and emits a frame when a chunk ends with
//! the JPEG end-of-image marker.

use crate::config::CameraEntry;
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tracing::{trace, warn};

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Errors raised while accumulating a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("Frame for {camera_id} exceeded {limit} bytes, accumulator reset")]
    Overflow { camera_id: String, limit: usize },
}

/// Per-camera JPEG reassembly.
///
/// Owned by a single receive loop, so no locking is needed.
pub struct FrameAssembler {
    max_frame_bytes: usize,
    buffers: HashMap<String, BytesMut>,
}

impl FrameAssembler {
    /// Create an assembler that never holds more than `max_frame_bytes`
    /// for one camera.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            buffers: HashMap::new(),
        }
    }

    /// Feed one chunk for `camera_id`.
    ///
    /// Returns `Ok(Some(frame))` when the chunk completes a frame, `Ok(None)`
    /// while a frame is still in progress. A chunk that would grow the
    /// accumulator past the limit discards everything buffered for the camera,
    /// and chunks are then ignored until the next start-of-image marker.
    pub fn feed(&mut self, camera_id: &str, chunk: &[u8]) -> Result<Option<Vec<u8>>, AssemblyError> {
        let max_frame_bytes = self.max_frame_bytes;
        let buffer = self
            .buffers
            .entry(camera_id.to_string())
            .or_insert_with(BytesMut::new);

        // a new SOI wins over whatever was left from a frame that lost its EOI
        if chunk.starts_with(&JPEG_SOI) {
            if !buffer.is_empty() {
                trace!(camera_id = %camera_id, discarded = buffer.len(), "Incomplete frame discarded");
            }
            buffer.clear();
        } else if buffer.is_empty() {
            // tail of a frame that overflowed or started before we listened
            trace!(camera_id = %camera_id, bytes = chunk.len(), "Chunk outside a frame ignored");
            return Ok(None);
        }

        if buffer.len() + chunk.len() > max_frame_bytes {
            buffer.clear();
            metrics::counter!("watchpost.assembler.overflow").increment(1);
            return Err(AssemblyError::Overflow {
                camera_id: camera_id.to_string(),
                limit: max_frame_bytes,
            });
        }

        buffer.extend_from_slice(chunk);

        if chunk.ends_with(&JPEG_EOI) {
            let frame = buffer.to_vec();
            buffer.clear();
            return Ok(Some(frame));
        }

        Ok(None)
    }

    /// Drop any partial frame held for `camera_id`.
    pub fn reset(&mut self, camera_id: &str) {
        self.buffers.remove(camera_id);
    }

    /// Bytes currently buffered for `camera_id`.
    pub fn pending_bytes(&self, camera_id: &str) -> usize {
        self.buffers.get(camera_id).map_or(0, |b| b.len())
    }
}

/// Static source address to camera name table.
#[derive(Debug, Clone, Default)]
pub struct CameraDirectory {
    names: HashMap<IpAddr, String>,
}

impl CameraDirectory {
    /// Build the directory from configured entries.
    ///
    /// Entries whose address is not a valid IP are skipped with a warning.
    pub fn new(entries: &[CameraEntry]) -> Self {
        let mut names = HashMap::new();
        for entry in entries {
            match entry.address.parse::<IpAddr>() {
                Ok(ip) => {
                    names.insert(ip, entry.name.clone());
                }
                Err(e) => {
                    warn!(address = %entry.address, error = %e, "Ignoring camera with invalid address");
                }
            }
        }
        Self { names }
    }

    /// Resolve the camera identity of a datagram source. The port is ignored.
    pub fn resolve(&self, addr: &SocketAddr) -> String {
        self.resolve_ip(&addr.ip())
    }

    /// Resolve the camera identity of a source IP.
    pub fn resolve_ip(&self, ip: &IpAddr) -> String {
        self.names
            .get(ip)
            .cloned()
            .unwrap_or_else(|| format!("unknown_{}", ip))
    }

    /// Number of configured cameras.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if no camera is configured.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
