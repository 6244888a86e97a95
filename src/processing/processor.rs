use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::calibration::CalibrationFactors;
use super::extractor::SignalExtractor;
use crate::buffers::FrameBuffer;
use crate::core::{AbortSignal, Frame, Waveform};
use crate::error::{EisError, EisResult};
use crate::experiment::ExperimentLog;
use crate::fitting::{fit_bounded, FitSetup};
use crate::observability::StageMetrics;

/// Waveform on the generator together with the calibration loaded for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedWaveform {
    pub waveform: Waveform,
    pub calibration: CalibrationFactors,
    /// Peak-to-peak volts driven by the generator.
    pub vpp: f64,
}

struct ContextInner {
    applied: RwLock<Option<Arc<AppliedWaveform>>>,
    reference_correction: AtomicBool,
    fitting: AtomicBool,
    fit_setup: RwLock<Option<FitSetup>>,
}

/// Settings the processing task reads for every frame.
///
/// The waveform and its calibration are swapped as one `Arc`, so a frame is
/// never processed with a calibration meant for another waveform.
#[derive(Clone)]
pub struct ProcessingContext {
    inner: Arc<ContextInner>,
}

impl ProcessingContext {
    pub fn new(reference_correction: bool, fitting: bool) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                applied: RwLock::new(None),
                reference_correction: AtomicBool::new(reference_correction),
                fitting: AtomicBool::new(fitting),
                fit_setup: RwLock::new(None),
            }),
        }
    }

    pub fn apply(&self, applied: AppliedWaveform) {
        *self
            .inner
            .applied
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(applied));
    }

    pub fn applied(&self) -> Option<Arc<AppliedWaveform>> {
        self.inner
            .applied
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_reference_correction(&self, enabled: bool) {
        self.inner.reference_correction.store(enabled, Ordering::SeqCst);
    }

    pub fn reference_correction(&self) -> bool {
        self.inner.reference_correction.load(Ordering::SeqCst)
    }

    pub fn set_fitting(&self, enabled: bool) {
        self.inner.fitting.store(enabled, Ordering::SeqCst);
    }

    pub fn fitting(&self) -> bool {
        self.inner.fitting.load(Ordering::SeqCst)
    }

    pub fn set_fit_setup(&self, setup: Option<FitSetup>) {
        *self
            .inner
            .fit_setup
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = setup;
    }

    pub fn fit_setup(&self) -> Option<FitSetup> {
        self.inner
            .fit_setup
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The setup to fit with, if fitting is switched on and configured.
    pub fn active_fit_setup(&self) -> Option<FitSetup> {
        if self.fitting() {
            self.fit_setup()
        } else {
            None
        }
    }
}

/// Background consumer of the frame buffer.
pub struct SpectrumProcessor {
    buffer: FrameBuffer,
    context: ProcessingContext,
    log: ExperimentLog,
    metrics: Arc<StageMetrics>,
    extractor: SignalExtractor,
    idle_poll: Duration,
}

impl SpectrumProcessor {
    pub fn new(
        buffer: FrameBuffer,
        context: ProcessingContext,
        log: ExperimentLog,
        metrics: Arc<StageMetrics>,
        idle_poll: Duration,
    ) -> Self {
        Self {
            buffer,
            context,
            log,
            metrics,
            extractor: SignalExtractor::new(),
            idle_poll,
        }
    }

    /// Extract, optionally fit, and append one frame. Returns the stored index.
    pub async fn process_frame(&self, frame: Frame) -> EisResult<usize> {
        let applied = self.context.applied().ok_or(EisError::NoWaveformApplied)?;
        let calibration = self
            .context
            .reference_correction()
            .then_some(&applied.calibration);

        let mut spectrum = self.extractor.extract(&frame, &applied.waveform, calibration)?;

        if let Some(setup) = self.context.active_fit_setup() {
            let previous = self.log.latest().and_then(|s| s.fit().cloned());
            let request = setup.request(&spectrum, previous.as_ref());
            match fit_bounded(setup.fitter(), &request, setup.timeout()).await {
                Ok(fit) => {
                    self.metrics.record_fit();
                    spectrum.set_fit(Some(fit));
                }
                Err(e @ EisError::FitTimeout { .. }) => {
                    self.metrics.record_fit_timeout();
                    warn!("{}; storing spectrum without fit", e);
                }
                Err(e) => {
                    self.metrics.record_fit_failure();
                    warn!("{}; storing spectrum without fit", e);
                }
            }
        }

        self.log.append(spectrum)
    }

    async fn handle(&self, frame: Frame) {
        let start = self.metrics.start_processing();
        match self.process_frame(frame).await {
            Ok(index) => {
                self.metrics.record_stored();
                self.metrics.finish_processing(start);
                debug!("Spectrum #{} stored", index);
                return;
            }
            Err(e) if e.halts_experiment() => {
                error!("Frame rejected: {}", e);
                self.log.record_rejection(e.to_string());
            }
            Err(e) => {
                warn!("Frame rejected: {}", e);
                self.log.record_rejection(e.to_string());
            }
        }
        self.metrics.record_rejected();
    }

    /// Drain frames until `shutdown` is set and the buffer is empty.
    pub async fn run(self, shutdown: AbortSignal) {
        info!("Processing task started");
        loop {
            let pending = self.buffer.len();
            if pending > 0 {
                if let Ok(frames) = self.buffer.pop_front(pending) {
                    for frame in frames {
                        self.handle(frame).await;
                    }
                }
                continue;
            }

            if shutdown.is_triggered() {
                break;
            }

            tokio::select! {
                _ = self.buffer.ready() => {}
                _ = shutdown.triggered() => {}
                _ = tokio::time::sleep(self.idle_poll) => {}
            }
        }
        info!("Processing task stopped");
    }

    pub fn spawn(self, shutdown: AbortSignal) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
