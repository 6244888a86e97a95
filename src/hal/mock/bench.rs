use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rustfft::num_complex::Complex64;
use serde_json::Value;

use crate::core::{ChannelScaling, Frame, RecordingParams, Waveform};
use crate::error::{EisError, EisResult};
use crate::fitting::{predict, Topology};
use crate::hal::{Digitizer, WaveformDriver};

struct BenchState {
    sample_rate: f64,
    current_range: f64,
    noise: f64,
    latency: Duration,
    topology: Topology,
    values: Vec<f64>,
    connected: bool,
    applied: Option<(Waveform, f64)>,
    armed: bool,
    captures: u64,
}

/// Generator, cell and digitizer in one simulated setup.
///
/// The generator side stores the applied waveform; the digitizer side
/// synthesizes the voltage and the current a circuit model would draw.
#[derive(Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState {
                sample_rate: 100_000.0,
                current_range: 1e-3,
                noise: 0.0,
                latency: Duration::ZERO,
                topology: Topology::Rrc,
                values: vec![100.0, 1000.0, 1e-6],
                connected: true,
                applied: None,
                armed: false,
                captures: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BenchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply JSON settings: `sample_rate`, `current_range`, `noise`,
    /// `latency_ms`, `topology` and `values`.
    pub fn configure(&self, config: Value) -> Result<()> {
        let mut state = self.lock();

        if let Some(sr) = config["sample_rate"].as_f64() {
            if sr <= 0.0 {
                return Err(anyhow!("Sample rate must be positive, got {}", sr));
            }
            state.sample_rate = sr;
        }
        if let Some(range) = config["current_range"].as_f64() {
            state.current_range = range;
        }
        if let Some(noise) = config["noise"].as_f64() {
            state.noise = noise;
        }
        if let Some(ms) = config["latency_ms"].as_u64() {
            state.latency = Duration::from_millis(ms);
        }
        if let Some(name) = config["topology"].as_str() {
            state.topology =
                Topology::from_name(name).ok_or_else(|| anyhow!("Unknown topology: {}", name))?;
            state.values = state.topology.parameters().iter().map(|p| p.value).collect();
        }
        if let Some(values) = config["values"].as_array() {
            let values: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if values.len() != state.topology.parameters().len() {
                return Err(anyhow!(
                    "{} takes {} values, got {}",
                    state.topology,
                    state.topology.parameters().len(),
                    values.len()
                ));
            }
            state.values = values;
        }
        Ok(())
    }

    /// Cell impedance model used for subsequent captures.
    pub fn set_model(&self, topology: Topology, values: Vec<f64>) {
        let mut state = self.lock();
        state.topology = topology;
        state.values = values;
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn capture_count(&self) -> u64 {
        self.lock().captures
    }

    pub fn applied(&self) -> Option<(Waveform, f64)> {
        self.lock().applied.clone()
    }

    /// Impedance the model presents at `frequencies`.
    pub fn model_impedance(&self, frequencies: &[f64]) -> EisResult<Vec<Complex64>> {
        let state = self.lock();
        predict(state.topology, frequencies, &state.values)
    }
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WaveformDriver for SimulatedBench {
    async fn apply(&self, waveform: &Waveform, vpp: f64) -> EisResult<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(EisError::InstrumentUnavailable(
                "simulated generator disconnected".to_string(),
            ));
        }
        state.applied = Some((waveform.clone(), vpp));
        Ok(())
    }
}

#[async_trait]
impl Digitizer for SimulatedBench {
    async fn arm_and_wait(&self, timeout: Duration) -> EisResult<()> {
        let latency = {
            let mut state = self.lock();
            if !state.connected {
                return Err(EisError::InstrumentUnavailable(
                    "simulated digitizer disconnected".to_string(),
                ));
            }
            state.armed = true;
            state.latency
        };

        if latency > timeout {
            tokio::time::sleep(timeout).await;
            self.lock().armed = false;
            return Err(EisError::InstrumentUnavailable(format!(
                "digitizer not ready within {:?}",
                timeout
            )));
        }
        tokio::time::sleep(latency).await;
        Ok(())
    }

    async fn read_back(&self) -> EisResult<Frame> {
        let mut state = self.lock();
        if !state.armed {
            return Err(EisError::InstrumentUnavailable(
                "read back before arming".to_string(),
            ));
        }
        state.armed = false;

        let (waveform, vpp) = state.applied.clone().ok_or_else(|| {
            EisError::InstrumentUnavailable("generator has no waveform loaded".to_string())
        })?;

        let fs = state.sample_rate;
        let n = (1.2 * fs / waveform.min_frequency()).ceil() as usize + 1;
        let impedance = predict(state.topology, &waveform.frequencies(), &state.values)?;

        let mut channel1 = vec![0.0; n];
        let mut channel2 = vec![0.0; n];
        for (tone, z) in waveform.tones().iter().zip(&impedance) {
            let amplitude = tone.amplitude * vpp / 2.0;
            let phase = tone.phase.to_radians();
            let omega = 2.0 * PI * tone.frequency;
            let (z_abs, z_arg) = (z.norm(), z.arg());
            for i in 0..n {
                let t = i as f64 / fs;
                channel1[i] += amplitude * (omega * t + phase).sin();
                channel2[i] -= amplitude / z_abs * (omega * t + phase - z_arg).sin() / state.current_range;
            }
        }

        if state.noise > 0.0 {
            let mut rng = rand::thread_rng();
            let noise = state.noise;
            channel1.iter_mut().for_each(|v| *v += rng.gen_range(-noise..noise));
            channel2.iter_mut().for_each(|v| *v += rng.gen_range(-noise..noise));
        }

        state.captures += 1;
        let params = RecordingParams {
            sample_rate: fs,
            frame_duration: n as f64 / fs,
            current_range: state.current_range,
            channel1: ChannelScaling::default(),
            channel2: ChannelScaling::default(),
        };
        Frame::new(Utc::now(), params, channel1, channel2)
    }
}
