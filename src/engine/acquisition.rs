use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::state::AcquisitionState;
use crate::buffers::FrameBuffer;
use crate::core::AbortSignal;
use crate::error::{EisError, EisResult};
use crate::hal::Digitizer;
use crate::observability::StageMetrics;

const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// How a multi-frame recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingSummary {
    pub captured: usize,
    pub aborted: bool,
}

/// Clears the in-flight flag however the capture ends, including when the
/// capture future is dropped mid-await.
struct InFlight<'a> {
    flag: &'a AtomicBool,
    state: &'a Mutex<AcquisitionState>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != AcquisitionState::Idle {
            debug!("Capture interrupted while {}; back to idle", state.name());
            *state = AcquisitionState::Idle;
        }
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Arms the digitizer, reads frames back and hands them to the frame buffer.
pub struct AcquisitionLoop {
    digitizer: Arc<dyn Digitizer>,
    buffer: FrameBuffer,
    metrics: Arc<StageMetrics>,
    capture_timeout: Duration,
    in_flight: AtomicBool,
    state: Mutex<AcquisitionState>,
}

impl AcquisitionLoop {
    pub fn new(
        digitizer: Arc<dyn Digitizer>,
        buffer: FrameBuffer,
        metrics: Arc<StageMetrics>,
        capture_timeout: Duration,
    ) -> Self {
        Self {
            digitizer,
            buffer,
            metrics,
            capture_timeout,
            in_flight: AtomicBool::new(false),
            state: Mutex::new(AcquisitionState::Idle),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn advance(&self, target: AcquisitionState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = state.transition_to(target.clone()) {
            error!("{}; forcing {}", e, target.name());
            *state = target;
        }
    }

    fn fault(&self, e: &EisError) {
        self.metrics.record_capture_error();
        self.advance(AcquisitionState::Faulted {
            reason: e.to_string(),
        });
        warn!("Capture failed: {}", e);
        self.advance(AcquisitionState::Idle);
    }

    /// Capture one frame and push it, labelled, into the frame buffer.
    ///
    /// Only one capture may be in flight; a concurrent call fails with `Busy`.
    pub async fn record_frame(&self, label: Option<&str>) -> EisResult<()> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EisError::Busy("capture"));
        }
        let _guard = InFlight {
            flag: &self.in_flight,
            state: &self.state,
        };

        self.advance(AcquisitionState::Arming);
        if let Err(e) = self.digitizer.arm_and_wait(self.capture_timeout).await {
            self.fault(&e);
            return Err(e);
        }

        self.advance(AcquisitionState::Capturing);
        let frame = match self.digitizer.read_back().await {
            Ok(frame) => frame,
            Err(e) => {
                self.fault(&e);
                return Err(e);
            }
        };

        self.advance(AcquisitionState::Draining);
        let frame = match label {
            Some(label) => frame.with_label(label),
            None => frame,
        };
        self.buffer.push(frame);
        self.metrics.record_capture();
        debug!("Frame captured ({} buffered)", self.buffer.len());

        self.advance(AcquisitionState::Idle);
        Ok(())
    }

    fn mark_aborted(&self) {
        self.advance(AcquisitionState::Aborted);
        info!("Recording aborted");
        self.advance(AcquisitionState::Idle);
    }

    /// Capture `n` frames, checking `abort` before each one.
    pub async fn record_n(
        &self,
        n: usize,
        label: Option<&str>,
        abort: &AbortSignal,
    ) -> EisResult<RecordingSummary> {
        for captured in 0..n {
            if abort.is_triggered() {
                self.mark_aborted();
                return Ok(RecordingSummary {
                    captured,
                    aborted: true,
                });
            }
            self.record_frame(label).await?;
        }
        Ok(RecordingSummary {
            captured: n,
            aborted: false,
        })
    }

    /// Capture back-to-back frames until `duration` has elapsed or `abort` is set.
    ///
    /// A failed capture is logged and the loop moves on to the next cycle.
    pub async fn record_for_duration(
        &self,
        duration: Duration,
        label: Option<&str>,
        abort: &AbortSignal,
    ) -> EisResult<RecordingSummary> {
        let start = Instant::now();
        let mut captured = 0;

        while start.elapsed() < duration {
            if abort.is_triggered() {
                self.mark_aborted();
                return Ok(RecordingSummary {
                    captured,
                    aborted: true,
                });
            }
            match self.record_frame(label).await {
                Ok(()) => captured += 1,
                Err(e @ EisError::Busy(_)) => return Err(e),
                Err(_) => tokio::time::sleep(RETRY_BACKOFF).await,
            }
        }

        info!("Recorded {} frames in {:?}", captured, start.elapsed());
        Ok(RecordingSummary {
            captured,
            aborted: false,
        })
    }
}
