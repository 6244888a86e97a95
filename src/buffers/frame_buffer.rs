use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::core::Frame;
use crate::error::{EisError, EisResult};

/// FIFO hand-off between the capture side and the processing task.
///
/// Any number of producers may push concurrently. Consumers must be
/// serialized by the caller; two concurrent `pop_front` callers get disjoint
/// but not necessarily contiguous batches.
#[derive(Clone, Default)]
pub struct FrameBuffer {
    frames: Arc<Mutex<VecDeque<Frame>>>,
    notify: Arc<Notify>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Frame) {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(frame);
        self.notify.notify_one();
    }

    /// Remove and return the `n` oldest frames.
    ///
    /// Fails with `BufferEmpty` and leaves the buffer untouched when fewer
    /// than `n` frames are queued.
    pub fn pop_front(&self, n: usize) -> EisResult<Vec<Frame>> {
        let mut frames = self
            .frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if frames.len() < n {
            return Err(EisError::BufferEmpty {
                requested: n,
                available: frames.len(),
            });
        }
        Ok(frames.drain(..n).collect())
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Wait for the next push. A push that happened before the call still
    /// wakes it (one stored permit).
    pub async fn ready(&self) {
        self.notify.notified().await;
    }
}
