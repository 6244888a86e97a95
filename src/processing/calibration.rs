use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{frequency_key, ImpedanceSpectrum, Waveform};
use crate::error::{EisError, EisResult};
use crate::experiment::store::atomic_write;

const CSV_HEADER: &str = "frequency,magnitude_factor,phase_offset_deg";

/// Per-frequency correction measured against a known resistor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFactors {
    frequencies: Vec<f64>,
    magnitude_factor: Vec<f64>,
    phase_offset_deg: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<PathBuf>,
}

impl CalibrationFactors {
    /// `(1, 0)` at every frequency: correction becomes the identity.
    pub fn neutral(frequencies: &[f64]) -> Self {
        Self {
            frequencies: frequencies.to_vec(),
            magnitude_factor: vec![1.0; frequencies.len()],
            phase_offset_deg: vec![0.0; frequencies.len()],
            source: None,
        }
    }

    pub fn new(
        frequencies: Vec<f64>,
        magnitude_factor: Vec<f64>,
        phase_offset_deg: Vec<f64>,
    ) -> EisResult<Self> {
        if magnitude_factor.len() != frequencies.len()
            || phase_offset_deg.len() != frequencies.len()
        {
            return Err(EisError::InvalidFrame(
                "calibration columns differ in length".to_string(),
            ));
        }
        if magnitude_factor.iter().any(|m| !(*m > 0.0) || !m.is_finite()) {
            return Err(EisError::InvalidFrame(
                "magnitude factors must be positive".to_string(),
            ));
        }
        Ok(Self {
            frequencies,
            magnitude_factor,
            phase_offset_deg,
            source: None,
        })
    }

    /// Factors from the averaged spectrum of a resistor of `resistance` ohms.
    pub fn from_reference(average: &ImpedanceSpectrum, resistance: f64) -> EisResult<Self> {
        if !(resistance > 0.0) {
            return Err(EisError::InvalidResistance(resistance.to_string()));
        }
        Self::new(
            average.frequencies().to_vec(),
            average.magnitude().iter().map(|m| m / resistance).collect(),
            average.phase_deg().to_vec(),
        )
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn is_neutral(&self) -> bool {
        self.magnitude_factor.iter().all(|m| *m == 1.0)
            && self.phase_offset_deg.iter().all(|p| *p == 0.0)
    }

    /// `(magnitude_factor, phase_offset_deg)` at `frequency`, neutral if absent.
    pub fn factor_at(&self, frequency: f64) -> (f64, f64) {
        let key = frequency_key(frequency);
        self.frequencies
            .iter()
            .position(|f| frequency_key(*f) == key)
            .map(|i| (self.magnitude_factor[i], self.phase_offset_deg[i]))
            .unwrap_or((1.0, 0.0))
    }

    /// `|Z| / m` and `phase - p`, recomposed.
    pub fn correct(&self, frequency: f64, z: Complex64) -> Complex64 {
        let (m, p) = self.factor_at(frequency);
        Complex64::from_polar(z.norm() / m, z.arg() - p.to_radians())
    }

    /// Inverse of `correct`.
    pub fn uncorrect(&self, frequency: f64, z: Complex64) -> Complex64 {
        let (m, p) = self.factor_at(frequency);
        Complex64::from_polar(z.norm() * m, z.arg() + p.to_radians())
    }

    fn to_csv(&self) -> String {
        let mut out = format!("{}\n", CSV_HEADER);
        for i in 0..self.frequencies.len() {
            out.push_str(&format!(
                "{},{},{}\n",
                self.frequencies[i], self.magnitude_factor[i], self.phase_offset_deg[i]
            ));
        }
        out
    }

    fn from_csv(path: &Path) -> EisResult<Self> {
        let text = fs::read_to_string(path)?;
        let malformed = |reason: String| EisError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let mut lines = text.lines();
        match lines.next() {
            Some(header) if header.trim() == CSV_HEADER => {}
            other => {
                return Err(malformed(format!("unexpected header {:?}", other)));
            }
        }

        let (mut frequencies, mut magnitude, mut phase) = (Vec::new(), Vec::new(), Vec::new());
        for line in lines.filter(|l| !l.trim().is_empty()) {
            let fields: Vec<f64> = line
                .split(',')
                .map(|s| s.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| malformed(e.to_string()))?;
            if fields.len() != 3 {
                return Err(malformed(format!("expected 3 columns in {:?}", line)));
            }
            frequencies.push(fields[0]);
            magnitude.push(fields[1]);
            phase.push(fields[2]);
        }

        let mut factors =
            Self::new(frequencies, magnitude, phase).map_err(|e| malformed(e.to_string()))?;
        factors.source = Some(path.to_path_buf());
        Ok(factors)
    }
}

/// Parse `"1000"`, `"10k"`, `"2.2M"` into ohms.
pub fn parse_resistance(text: &str) -> EisResult<f64> {
    let trimmed = text.trim();
    let (number, scale) = if let Some(n) = trimmed.strip_suffix(['k', 'K']) {
        (n, 1e3)
    } else if let Some(n) = trimmed.strip_suffix('M') {
        (n, 1e6)
    } else {
        (trimmed, 1.0)
    };

    number
        .trim()
        .parse::<f64>()
        .ok()
        .map(|v| v * scale)
        .filter(|v| *v > 0.0 && v.is_finite())
        .ok_or_else(|| EisError::InvalidResistance(text.to_string()))
}

/// Calibration files live in one directory, named
/// `{YYYY-MM-DD}-{canonical waveform name}-{R}Ohm.csv`.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Most recent calibration for `waveform`, or neutral factors.
    ///
    /// Never fails: a missing or unusable file is reported and the neutral
    /// fallback is returned.
    pub fn load(&self, waveform: &Waveform) -> CalibrationFactors {
        let frequencies = waveform.frequencies();
        let Some(path) = self.newest_for(waveform) else {
            let missing = EisError::CalibrationMissing {
                waveform: waveform.canonical_name(),
            };
            warn!("{} in {:?}; using neutral factors", missing, self.dir);
            return CalibrationFactors::neutral(&frequencies);
        };

        match CalibrationFactors::from_csv(&path) {
            Ok(factors) if same_frequencies(&factors.frequencies, &frequencies) => {
                info!("Loaded calibration {:?}", path);
                factors
            }
            Ok(_) => {
                warn!(
                    "Calibration {:?} does not line up with waveform {}; using neutral factors",
                    path,
                    waveform.name()
                );
                CalibrationFactors::neutral(&frequencies)
            }
            Err(e) => {
                warn!("Failed to read calibration {:?}: {}; using neutral factors", path, e);
                CalibrationFactors::neutral(&frequencies)
            }
        }
    }

    pub fn save(
        &self,
        waveform: &Waveform,
        resistance: f64,
        factors: &CalibrationFactors,
        date: NaiveDate,
    ) -> EisResult<PathBuf> {
        let path = self.dir.join(format!(
            "{}-{}-{}Ohm.csv",
            date.format("%Y-%m-%d"),
            waveform.canonical_name(),
            resistance
        ));
        atomic_write(&path, &factors.to_csv())?;
        info!("Saved calibration {:?}", path);
        Ok(path)
    }

    fn newest_for(&self, waveform: &Waveform) -> Option<PathBuf> {
        let needle = format!("-{}-", waveform.canonical_name());
        let entries = fs::read_dir(&self.dir).ok()?;

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.contains(&needle) && name.ends_with("Ohm.csv")
            })
            .filter_map(|entry| {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, entry.path()))
            })
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
            .map(|(_, path)| path)
    }
}

fn same_frequencies(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| frequency_key(*x) == frequency_key(*y))
}
