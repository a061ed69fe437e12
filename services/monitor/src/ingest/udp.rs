//! UDP camera listener.

use super::dispatch;
use crate::assembler::{CameraDirectory, FrameAssembler};
use crate::config::UdpConfig;
use crate::dispatcher::Dispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receive loop for cameras streaming JPEG over UDP.
pub struct UdpIngest {
    socket: UdpSocket,
    directory: CameraDirectory,
    assembler: FrameAssembler,
    datagram_size: usize,
    dispatcher: Arc<Dispatcher>,
}

impl UdpIngest {
    /// Bind the listener socket.
    pub async fn bind(
        config: &UdpConfig,
        directory: CameraDirectory,
        dispatcher: Arc<Dispatcher>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(&config.bind_address).await?;

        info!(
            address = %socket.local_addr()?,
            cameras = directory.len(),
            "UDP listener bound"
        );

        Ok(Self {
            socket,
            directory,
            assembler: FrameAssembler::new(config.max_frame_bytes),
            datagram_size: config.datagram_size,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; self.datagram_size];

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let (len, addr) = match received {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    continue;
                }
            };

            let camera_id = self.directory.resolve(&addr);
            match self.assembler.feed(&camera_id, &buf[..len]) {
                Ok(Some(frame)) => {
                    debug!(camera_id = %camera_id, bytes = frame.len(), "Frame assembled");
                    dispatch(&self.dispatcher, frame, &camera_id).await;
                }
                Ok(None) => {}
                Err(e) => warn!(source = %addr, error = %e, "Dropping oversized frame"),
            }
        }

        info!("UDP listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraEntry, ProcessingConfig};
    use crate::detector::testing::FakeDetector;
    use crate::hub::BroadcastHub;
    use crate::queue::TaskQueue;
    use std::time::Duration;

    #[tokio::test]
    async fn test_three_datagrams_become_one_dispatched_frame() {
        let (_hub, handle) = BroadcastHub::new(16);
        let (queue, receiver) = TaskQueue::new(10);
        let dispatcher = Arc::new(Dispatcher::new(
            &ProcessingConfig {
                num_workers: 1,
                queue_size: 10,
                process_every_nth: 1,
            },
            Arc::new(FakeDetector::new().always_motion()),
            handle,
            Arc::new(queue),
        ));

        let config = UdpConfig {
            enabled: true,
            bind_address: "127.0.0.1:0".to_string(),
            datagram_size: 2048,
            max_frame_bytes: 1 << 20,
        };
        let directory = CameraDirectory::new(&[CameraEntry {
            address: "127.0.0.1".to_string(),
            name: "brama".to_string(),
        }]);

        let ingest = UdpIngest::bind(&config, directory, dispatcher.clone())
            .await
            .unwrap();
        let target = ingest.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(ingest.run(shutdown.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xFF, 0xD8, 0x01], target).await.unwrap();
        client.send_to(&[0x02, 0x03], target).await.unwrap();
        client.send_to(&[0x04, 0xFF, 0xD9], target).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.stats().frames_queued == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let task_out = receiver.try_recv().unwrap();
        assert_eq!(task_out.camera_id, "brama");
        assert_eq!(task_out.frame, vec![0xFF, 0xD8, 0x01, 0x02, 0x03, 0x04, 0xFF, 0xD9]);
        assert_eq!(dispatcher.stats().frames_received, 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
