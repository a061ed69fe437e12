//! Bounded task queue between the dispatcher and the worker pool.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use thiserror::Error;

/// A motion-positive frame waiting for object detection.
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    pub camera_id: String,
    pub frame: Vec<u8>,
}

/// Errors returned when submitting a task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task queue full, frame dropped")]
    Full,

    #[error("Task queue closed")]
    Closed,
}

/// Producer side of the task queue.
///
/// Submitting never blocks. Closing drops the only sender, so workers see
/// the channel disconnect once they have drained what is left.
pub struct TaskQueue {
    sender: RwLock<Option<Sender<ProcessingTask>>>,
    capacity: usize,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` tasks, and its consumer end.
    pub fn new(capacity: usize) -> (Self, Receiver<ProcessingTask>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let queue = Self {
            sender: RwLock::new(Some(sender)),
            capacity,
        };
        (queue, receiver)
    }

    /// Enqueue a task without waiting.
    pub fn try_submit(&self, task: ProcessingTask) -> Result<(), QueueError> {
        let sender = self.sender.read();
        let sender = sender.as_ref().ok_or(QueueError::Closed)?;
        sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Closed,
        })
    }

    /// Stop accepting tasks.
    pub fn close(&self) {
        self.sender.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Tasks currently waiting.
    pub fn len(&self) -> usize {
        self.sender.read().as_ref().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(camera_id: &str) -> ProcessingTask {
        ProcessingTask {
            camera_id: camera_id.to_string(),
            frame: vec![0xFF, 0xD8, 0xFF, 0xD9],
        }
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let (queue, _receiver) = TaskQueue::new(1);

        assert_eq!(queue.try_submit(task("brama")), Ok(()));
        assert_eq!(queue.try_submit(task("brama")), Err(QueueError::Full));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_close_lets_receiver_drain() {
        let (queue, receiver) = TaskQueue::new(4);
        queue.try_submit(task("brama")).unwrap();
        queue.try_submit(task("drzwi")).unwrap();

        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.try_submit(task("brama")), Err(QueueError::Closed));

        let drained: Vec<_> = receiver.iter().map(|t| t.camera_id).collect();
        assert_eq!(drained, vec!["brama", "drzwi"]);
    }

    #[test]
    fn test_each_task_delivered_once() {
        let (queue, receiver) = TaskQueue::new(100);
        for i in 0..50 {
            queue.try_submit(task(&format!("cam{}", i))).unwrap();
        }
        queue.close();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::spawn(move || receiver.iter().count())
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
    }
}
