use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fitting::Topology;
use crate::logging::LogLevel;

/// Root configuration. Every section falls back to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EisConfig {
    pub acquisition: AcquisitionSettings,
    pub processing: ProcessingSettings,
    pub paths: PathSettings,
    pub multiplex: MultiplexSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Bound on the digitizer ready poll, in seconds.
    pub capture_timeout_secs: f64,
    /// Peak-to-peak amplitude requested from the operator, in mV.
    pub amplitude_mv: f64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            capture_timeout_secs: 10.0,
            amplitude_mv: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingSettings {
    pub reference_correction: bool,
    pub fitting: bool,
    pub fit_timeout_ms: u64,
    /// External solver executable; fitting stays off without one.
    pub solver: Option<PathBuf>,
    pub topology: Topology,
    /// Frames averaged when recording a reference resistor.
    pub reference_frames: usize,
    /// How long an action waits for the processing task to catch up.
    pub processing_wait_secs: f64,
    /// Idle poll of the processing task when no frame wakes it.
    pub idle_poll_ms: u64,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            reference_correction: true,
            fitting: false,
            fit_timeout_ms: 400,
            solver: None,
            topology: Topology::Rrc,
            reference_frames: 5,
            processing_wait_secs: 30.0,
            idle_poll_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    pub output_root: PathBuf,
    pub waveform_dir: PathBuf,
    pub calibration_dir: PathBuf,
    pub trigger_file: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("EIS Output"),
            waveform_dir: PathBuf::from("waveforms"),
            calibration_dir: PathBuf::from("waveforms/reference"),
            trigger_file: PathBuf::from("update.txt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MultiplexSettings {
    pub trigger_poll_ms: u64,
    pub frames_per_sensor: usize,
}

impl Default for MultiplexSettings {
    fn default() -> Self {
        Self {
            trigger_poll_ms: 100,
            frames_per_sensor: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
}

impl EisConfig {
    pub fn from_json(config: Value) -> Result<Self> {
        serde_json::from_value(config).context("Failed to parse EIS configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config at {:?}", path))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, json).with_context(|| format!("Failed to write config to {:?}", path))
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.acquisition.capture_timeout_secs.max(0.0))
    }

    pub fn fit_timeout(&self) -> Duration {
        Duration::from_millis(self.processing.fit_timeout_ms)
    }

    pub fn processing_wait(&self) -> Duration {
        Duration::from_secs_f64(self.processing.processing_wait_secs.max(0.0))
    }

    pub fn trigger_poll(&self) -> Duration {
        Duration::from_millis(self.multiplex.trigger_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = EisConfig::from_json(json!({
            "processing": { "fitting": true },
            "multiplex": { "frames_per_sensor": 3 }
        }))
        .unwrap();

        assert!(config.processing.fitting);
        assert_eq!(config.processing.fit_timeout_ms, 400);
        assert_eq!(config.multiplex.frames_per_sensor, 3);
        assert_eq!(config.multiplex.trigger_poll_ms, 100);
        assert_eq!(config.paths.trigger_file, PathBuf::from("update.txt"));
        assert_eq!(config.processing.solver, None);
    }

    #[test]
    fn test_topology_uses_circuit_names() {
        let config = EisConfig::from_json(json!({
            "processing": { "solver": "bin/eisfit", "topology": "RRQ" }
        }))
        .unwrap();

        assert_eq!(config.processing.topology, Topology::Rrq);
        assert_eq!(config.processing.solver, Some(PathBuf::from("bin/eisfit")));
        assert!(EisConfig::from_json(json!({ "processing": { "topology": "RLC" } })).is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eis.json");

        let mut config = EisConfig::default();
        config.acquisition.amplitude_mv = 25.0;
        config.save(&path).unwrap();

        assert_eq!(EisConfig::load(&path).unwrap(), config);
    }
}
