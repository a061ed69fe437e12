//! Per-camera state registry.
//!
//! This is the only place new camera identities are admitted. Every piece of
//! per-camera state (motion baselines, frame counters) is created here lazily
//! on the first frame for that camera and lives for the rest of the process.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Concurrent map from camera id to shared per-camera state.
///
/// Lookups take the read lock; creation upgrades to the write lock and
/// re-checks, so concurrent first frames for one camera still yield exactly
/// one state.
pub struct CameraRegistry<T> {
    states: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> CameraRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Get the state for `camera_id`, creating it with `init` if absent.
    pub fn get_or_create_with<F>(&self, camera_id: &str, init: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(state) = self.states.read().get(camera_id) {
            return state.clone();
        }

        let mut states = self.states.write();
        states
            .entry(camera_id.to_string())
            .or_insert_with(|| Arc::new(init()))
            .clone()
    }

    /// Get the state for `camera_id` if the camera has been seen.
    pub fn get(&self, camera_id: &str) -> Option<Arc<T>> {
        self.states.read().get(camera_id).cloned()
    }

    /// Visit every registered camera.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &T),
    {
        for (camera_id, state) in self.states.read().iter() {
            visit(camera_id, state);
        }
    }

    /// Number of cameras seen so far.
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Check if no camera has been seen.
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Forget every camera.
    pub fn clear(&self) {
        self.states.write().clear();
    }
}

impl<T: Default> CameraRegistry<T> {
    /// Get the state for `camera_id`, creating a default one if absent.
    pub fn get_or_create(&self, camera_id: &str) -> Arc<T> {
        self.get_or_create_with(camera_id, T::default)
    }
}

impl<T> Default for CameraRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_get_or_create_returns_same_state() {
        let registry: CameraRegistry<AtomicU64> = CameraRegistry::new();

        let first = registry.get_or_create("brama");
        first.fetch_add(1, Ordering::Relaxed);

        let second = registry.get_or_create("brama");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cameras_are_isolated() {
        let registry: CameraRegistry<AtomicU64> = CameraRegistry::new();

        registry.get_or_create("brama").fetch_add(5, Ordering::Relaxed);
        registry.get_or_create("drzwi").fetch_add(1, Ordering::Relaxed);

        assert_eq!(registry.get("brama").unwrap().load(Ordering::Relaxed), 5);
        assert_eq!(registry.get("drzwi").unwrap().load(Ordering::Relaxed), 1);
        assert!(registry.get("garaz").is_none());
    }

    #[test]
    fn test_concurrent_first_frames_create_one_state() {
        let registry: Arc<CameraRegistry<AtomicU64>> = Arc::new(CameraRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.get_or_create("brama").fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("brama").unwrap().load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_clear() {
        let registry: CameraRegistry<AtomicU64> = CameraRegistry::new();
        registry.get_or_create("brama");
        registry.clear();
        assert!(registry.is_empty());
    }
}
