use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::{Duration, Instant};

use crate::error::EisResult;
use crate::hal::TriggerSource;

#[derive(Debug, Clone)]
enum TriggerMode {
    Periodic { interval: Duration },
    Manual,
}

/// Trigger source for tests and demos.
///
/// In manual mode triggers are queued with `fire()`; in periodic mode a new
/// trigger becomes ready `interval` after the previous one was consumed.
pub struct SimulatedTriggerSource {
    mode: TriggerMode,
    pending: AtomicU64,
    consumed: AtomicU64,
    cleared: AtomicU64,
    last_consumed: Mutex<Instant>,
}

impl SimulatedTriggerSource {
    pub fn new() -> Self {
        Self::with_mode(TriggerMode::Manual)
    }

    pub fn periodic(interval: Duration) -> Self {
        Self::with_mode(TriggerMode::Periodic { interval })
    }

    fn with_mode(mode: TriggerMode) -> Self {
        Self {
            mode,
            pending: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
            last_consumed: Mutex::new(Instant::now()),
        }
    }

    /// Queue one trigger (manual mode).
    pub fn fire(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Number of `clear()` calls that actually discarded something.
    pub fn cleared(&self) -> u64 {
        self.cleared.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedTriggerSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TriggerSource for SimulatedTriggerSource {
    async fn is_ready(&self) -> EisResult<bool> {
        Ok(match &self.mode {
            TriggerMode::Manual => self.pending() > 0,
            TriggerMode::Periodic { interval } => {
                let last = *self
                    .last_consumed
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                last.elapsed() >= *interval
            }
        })
    }

    async fn consume(&self) -> EisResult<()> {
        if let TriggerMode::Manual = self.mode {
            let _ = self
                .pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1));
        }
        *self
            .last_consumed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
        self.consumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> EisResult<()> {
        if self.pending.swap(0, Ordering::SeqCst) > 0 {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
        *self
            .last_consumed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
        Ok(())
    }
}
