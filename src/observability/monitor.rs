use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::core::ImpedanceSpectrum;

/// Series key for spectra without a sensor label.
pub const UNLABELLED: &str = "all";

/// What the experiment log publishes for the presentation layer.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ExperimentStarted { dir: PathBuf },
    SpectrumStored { index: usize, spectrum: ImpedanceSpectrum },
    SpectrumRejected { reason: String },
    AppendHalted { expected: Vec<String>, found: Vec<String> },
}

/// Scalar tracked over time, one series per sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitorQuantity {
    Magnitude { frequency: f64 },
    Phase { frequency: f64 },
    FitParameter(String),
    ElectronTransferRate,
}

impl MonitorQuantity {
    pub fn value_of(&self, spectrum: &ImpedanceSpectrum) -> Option<f64> {
        match self {
            Self::Magnitude { frequency } => spectrum.at_frequency(*frequency).map(|(_, z)| z.norm()),
            Self::Phase { frequency } => spectrum
                .at_frequency(*frequency)
                .map(|(_, z)| z.arg().to_degrees()),
            Self::FitParameter(name) => spectrum.fit().and_then(|fit| fit.get(name)),
            Self::ElectronTransferRate => spectrum.fit().and_then(|fit| fit.electron_transfer_rate()),
        }
    }
}

/// Sensor label of a stored spectrum: its name up to the last `_`.
pub fn sensor_of(spectrum: &ImpedanceSpectrum) -> String {
    spectrum
        .name()
        .and_then(|name| name.rsplit_once('_'))
        .map(|(sensor, _)| sensor.to_string())
        .unwrap_or_else(|| UNLABELLED.to_string())
}

/// Time series derived from the monitor feed.
pub struct ExperimentMonitor {
    quantity: MonitorQuantity,
    started: Option<DateTime<Utc>>,
    series: BTreeMap<String, Vec<(f64, f64)>>,
    rejected: u64,
    halted: bool,
}

impl ExperimentMonitor {
    pub fn new(quantity: MonitorQuantity) -> Self {
        Self {
            quantity,
            started: None,
            series: BTreeMap::new(),
            rejected: 0,
            halted: false,
        }
    }

    /// Switch quantity; stored points are from the old one, so they go.
    pub fn set_quantity(&mut self, quantity: MonitorQuantity) {
        self.quantity = quantity;
        self.series.clear();
    }

    /// Consume every pending event without blocking.
    pub fn drain(&mut self, events: &Receiver<MonitorEvent>) -> usize {
        let mut n = 0;
        for event in events.try_iter() {
            self.ingest(&event);
            n += 1;
        }
        n
    }

    pub fn ingest(&mut self, event: &MonitorEvent) {
        match event {
            MonitorEvent::ExperimentStarted { .. } => {
                self.started = None;
                self.series.clear();
                self.rejected = 0;
                self.halted = false;
            }
            MonitorEvent::SpectrumStored { spectrum, .. } => {
                let started = *self.started.get_or_insert(spectrum.timestamp());
                let Some(value) = self.quantity.value_of(spectrum) else {
                    return;
                };
                let elapsed = (spectrum.timestamp() - started)
                    .to_std()
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                self.series
                    .entry(sensor_of(spectrum))
                    .or_default()
                    .push((elapsed, value));
            }
            MonitorEvent::SpectrumRejected { .. } => self.rejected += 1,
            MonitorEvent::AppendHalted { .. } => self.halted = true,
        }
    }

    pub fn sensors(&self) -> Vec<&str> {
        self.series.keys().map(String::as_str).collect()
    }

    /// `(seconds since first spectrum, value)` points for `sensor`.
    pub fn series(&self, sensor: &str) -> &[(f64, f64)] {
        self.series.get(sensor).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}
