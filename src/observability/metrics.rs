use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for the capture → extract → fit → store path.
#[derive(Default)]
pub struct StageMetrics {
    frames_captured: AtomicU64,
    capture_errors: AtomicU64,
    spectra_stored: AtomicU64,
    spectra_rejected: AtomicU64,
    fits_attached: AtomicU64,
    fit_timeouts: AtomicU64,
    fit_failures: AtomicU64,
    total_latency_us: AtomicU64,
    latency_samples: AtomicU64,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_capture(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_error(&self) {
        self.capture_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.spectra_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.spectra_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fit(&self) {
        self.fits_attached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fit_timeout(&self) {
        self.fit_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fit_failure(&self) {
        self.fit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_processing(&self) -> Instant {
        Instant::now()
    }

    /// Frame-to-stored latency of one processed frame.
    pub fn finish_processing(&self, start: Instant) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn capture_errors(&self) -> u64 {
        self.capture_errors.load(Ordering::Relaxed)
    }

    pub fn spectra_stored(&self) -> u64 {
        self.spectra_stored.load(Ordering::Relaxed)
    }

    pub fn spectra_rejected(&self) -> u64 {
        self.spectra_rejected.load(Ordering::Relaxed)
    }

    pub fn fits_attached(&self) -> u64 {
        self.fits_attached.load(Ordering::Relaxed)
    }

    pub fn fit_timeouts(&self) -> u64 {
        self.fit_timeouts.load(Ordering::Relaxed)
    }

    pub fn fit_failures(&self) -> u64 {
        self.fit_failures.load(Ordering::Relaxed)
    }

    pub fn avg_latency_us(&self) -> u64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / samples
    }

    pub fn generate_report(&self) -> String {
        let plural = |n: u64| if n == 1 { "" } else { "s" };
        let rejected = self.spectra_rejected();
        let timeouts = self.fit_timeouts();

        format!(
            "=== EIS Metrics ===\n\n[acquisition]\n  Frames: {} frames captured\n  Errors: {} capture error{}\n\n[processing]\n  Stored: {} spectra\n  Rejected: {} spectr{}\n  Fits: {} attached, {} timeout{}, {} failed\n  Avg Latency: {}μs\n",
            self.frames_captured(),
            self.capture_errors(),
            plural(self.capture_errors()),
            self.spectra_stored(),
            rejected,
            if rejected == 1 { "um" } else { "a" },
            self.fits_attached(),
            timeouts,
            plural(timeouts),
            self.fit_failures(),
            self.avg_latency_us()
        )
    }
}
