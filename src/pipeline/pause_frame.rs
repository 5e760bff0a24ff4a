//! Pause frames: consumer-held tokens that stop the player advancing.

use crate::player::{FrameBarrier, FrameGate};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

struct Held {
    frames: Mutex<BTreeMap<u64, String>>,
    released: Condvar,
    next_id: AtomicU64,
}

impl FrameBarrier for Held {
    fn is_released(&self) -> bool {
        self.frames.lock().is_empty()
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();
        while !frames.is_empty() {
            if self.released.wait_until(&mut frames, deadline).timed_out() {
                return frames.is_empty();
            }
        }
        true
    }
}

/// Outstanding pause frames of one pipeline.
///
/// The gate handed to the player is released once every frame taken during
/// the current emission has been released.
#[derive(Clone)]
pub struct PauseFrameRegistry {
    held: Arc<Held>,
}

impl PauseFrameRegistry {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Held {
                frames: Mutex::new(BTreeMap::new()),
                released: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Hold up the next advance until the returned frame is released or
    /// dropped.
    pub fn pause_frame(&self, name: impl Into<String>) -> PauseFrame {
        let id = self.held.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        trace!(frame = id, %name, "Pause frame taken");
        self.held.frames.lock().insert(id, name);
        PauseFrame {
            held: Arc::clone(&self.held),
            id,
        }
    }

    /// Names of frames still held, oldest first.
    pub fn held(&self) -> Vec<String> {
        self.held.frames.lock().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_released()
    }

    /// Gate for the player: open if nothing is held.
    pub fn gate(&self) -> FrameGate {
        if self.is_empty() {
            FrameGate::open()
        } else {
            FrameGate::new(Arc::clone(&self.held) as Arc<dyn FrameBarrier>)
        }
    }
}

impl Default for PauseFrameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PauseFrameRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PauseFrameRegistry")
            .field("held", &self.held())
            .finish()
    }
}

/// A held pause frame. Released explicitly or on drop.
#[must_use = "dropping a pause frame releases it immediately"]
pub struct PauseFrame {
    held: Arc<Held>,
    id: u64,
}

impl PauseFrame {
    pub fn release(self) {}
}

impl fmt::Debug for PauseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PauseFrame").field("id", &self.id).finish()
    }
}

impl Drop for PauseFrame {
    fn drop(&mut self) {
        let mut frames = self.held.frames.lock();
        if let Some(name) = frames.remove(&self.id) {
            trace!(frame = self.id, %name, "Pause frame released");
        }
        if frames.is_empty() {
            self.held.released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_gate_tracks_frames() {
        let registry = PauseFrameRegistry::new();
        assert!(registry.gate().is_released());

        let a = registry.pause_frame("a");
        let b = registry.pause_frame("b");
        let gate = registry.gate();
        assert!(!gate.is_released());
        assert_eq!(registry.held(), vec!["a".to_string(), "b".to_string()]);

        a.release();
        assert!(!gate.is_released());
        drop(b);
        assert!(gate.is_released());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wait_timeout() {
        let registry = PauseFrameRegistry::new();
        let frame = registry.pause_frame("render");
        let gate = registry.gate();
        assert!(!gate.wait_timeout(Duration::from_millis(10)));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            frame.release();
        });
        assert!(gate.wait_timeout(Duration::from_secs(5)));
        releaser.join().unwrap();
    }
}
