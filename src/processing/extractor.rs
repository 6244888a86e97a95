use std::collections::HashMap;
use std::sync::Mutex;

use rustfft::{num_complex::Complex, FftPlanner};
use tracing::{debug, warn};

use super::calibration::CalibrationFactors;
use crate::core::{frequency_key, round_frequency, Frame, ImpedanceSpectrum, Waveform};
use crate::error::{EisError, EisResult};

/// Slack when counting the samples of one slow period.
const CUTOFF_EPSILON: f64 = 1e-6;

/// Turns a captured frame into an impedance spectrum at the applied tones.
pub struct SignalExtractor {
    /// Cached FFT planner; frames of the same length reuse the plan.
    planner: Mutex<FftPlanner<f64>>,
}

impl SignalExtractor {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    /// Extract `Z = V / I` at the applied frequencies of `waveform`.
    ///
    /// The DFT window is exactly one period of the slowest tone, so bin `k`
    /// sits at `k * f_min`. Applied frequencies are matched to bins after
    /// rounding both to three decimals; anything that misses is dropped.
    pub fn extract(
        &self,
        frame: &Frame,
        waveform: &Waveform,
        calibration: Option<&CalibrationFactors>,
    ) -> EisResult<ImpedanceSpectrum> {
        let n = frame.len();
        if n == 0 {
            return Err(EisError::SpectrumEmpty("frame holds no samples".to_string()));
        }
        let params = frame.params();
        let dt = params.frame_duration / n as f64;
        let period = 1.0 / waveform.min_frequency();

        // Samples at t_i < period; the frame spans [0, frame_duration).
        let cutoff = (period / dt + CUTOFF_EPSILON).floor() as usize;
        if cutoff > n {
            return Err(EisError::SpectrumEmpty(format!(
                "frame of {:.6} s is shorter than one {:.6} s period of {} Hz",
                params.frame_duration,
                period,
                waveform.min_frequency()
            )));
        }
        if cutoff < 2 {
            return Err(EisError::SpectrumEmpty(
                "sample rate too low for the slowest tone".to_string(),
            ));
        }

        let sample_rate = n as f64 / params.frame_duration;
        let voltage: Vec<f64> = frame.voltage()[..cutoff].to_vec();
        let current: Vec<f64> = frame.current_monitor()[..cutoff]
            .iter()
            .map(|v| -v * params.current_range)
            .collect();

        let v_bins = self.one_sided_spectrum(&voltage);
        let i_bins = self.one_sided_spectrum(&current);

        let bin_index: HashMap<i64, usize> = (1..v_bins.len())
            .map(|k| (frequency_key(k as f64 * sample_rate / cutoff as f64), k))
            .collect();

        let mut frequencies = Vec::with_capacity(waveform.tones().len());
        let mut impedance = Vec::with_capacity(waveform.tones().len());
        let mut missed = Vec::new();
        let mut non_finite = Vec::new();

        for frequency in waveform.frequencies() {
            let Some(&k) = bin_index.get(&frequency_key(frequency)) else {
                missed.push(frequency);
                continue;
            };
            let mut z = v_bins[k] / i_bins[k];
            if !z.re.is_finite() || !z.im.is_finite() {
                non_finite.push(frequency);
                continue;
            }
            if let Some(factors) = calibration {
                z = factors.correct(frequency, z);
            }
            frequencies.push(round_frequency(frequency));
            impedance.push(z);
        }

        if !missed.is_empty() {
            warn!(
                "Applied frequencies {:?} Hz have no matching DFT bin (bin spacing {:.3} Hz); dropped",
                missed,
                sample_rate / cutoff as f64
            );
        }
        if !non_finite.is_empty() {
            warn!("Zero current at {:?} Hz; dropped", non_finite);
        }
        if frequencies.is_empty() {
            return Err(EisError::SpectrumEmpty(format!(
                "no applied frequency of waveform {} survived extraction",
                waveform.name()
            )));
        }

        debug!(
            "Extracted {} of {} tones from {} samples",
            frequencies.len(),
            waveform.tones().len(),
            cutoff
        );

        let spectrum = ImpedanceSpectrum::new(frame.captured_at(), frequencies, impedance)?;
        Ok(match frame.label() {
            Some(label) => spectrum.with_name(label),
            None => spectrum,
        })
    }

    /// DFT bins `0..=N/2` of a real signal.
    fn one_sided_spectrum(&self, samples: &[f64]) -> Vec<Complex<f64>> {
        let len = samples.len();
        let fft = self
            .planner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .plan_fft_forward(len);

        let mut buffer: Vec<Complex<f64>> =
            samples.iter().map(|&x| Complex::new(x, 0.0)).collect();
        fft.process(&mut buffer);
        buffer.truncate(len / 2 + 1);
        buffer
    }
}

impl Default for SignalExtractor {
    fn default() -> Self {
        Self::new()
    }
}
