use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{EisError, EisResult};

/// Fitted parameter values, in topology order.
///
/// The order of `names()` is what locks an experiment's fit-history header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FitResult {
    parameters: Vec<(String, f64)>,
}

impl FitResult {
    pub fn new(parameters: Vec<(String, f64)>) -> Self {
        Self { parameters }
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.parameters.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Electron-transfer rate `1 / (2 Rct Cads)` when both parameters are present.
    pub fn electron_transfer_rate(&self) -> Option<f64> {
        let rct = self.get("Rct")?;
        let cads = self.get("Cads")?;
        let k = 1.0 / (2.0 * rct * cads);
        k.is_finite().then_some(k)
    }
}

/// Complex impedance at the applied frequencies of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpedanceSpectrum {
    timestamp: DateTime<Utc>,
    frequencies: Vec<f64>,
    impedance: Vec<Complex64>,
    phase_deg: Vec<f64>,
    name: Option<String>,
    fit: Option<FitResult>,
}

impl ImpedanceSpectrum {
    /// Phase is derived from the impedance.
    pub fn new(
        timestamp: DateTime<Utc>,
        frequencies: Vec<f64>,
        impedance: Vec<Complex64>,
    ) -> EisResult<Self> {
        if frequencies.len() != impedance.len() {
            return Err(EisError::InvalidFrame(format!(
                "{} frequencies but {} impedance values",
                frequencies.len(),
                impedance.len()
            )));
        }
        let phase_deg = impedance.iter().map(|z| z.arg().to_degrees()).collect();
        Ok(Self {
            timestamp,
            frequencies,
            impedance,
            phase_deg,
            name: None,
            fit: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn set_fit(&mut self, fit: Option<FitResult>) {
        self.fit = fit;
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn impedance(&self) -> &[Complex64] {
        &self.impedance
    }

    pub fn phase_deg(&self) -> &[f64] {
        &self.phase_deg
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fit(&self) -> Option<&FitResult> {
        self.fit.as_ref()
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    pub fn magnitude(&self) -> Vec<f64> {
        self.impedance.iter().map(|z| z.norm()).collect()
    }

    /// Impedance at the frequency closest to `frequency`.
    pub fn at_frequency(&self, frequency: f64) -> Option<(f64, Complex64)> {
        self.frequencies
            .iter()
            .zip(&self.impedance)
            .min_by(|(a, _), (b, _)| (*a - frequency).abs().total_cmp(&(*b - frequency).abs()))
            .map(|(f, z)| (*f, *z))
    }

    /// Element-wise mean of impedance and of phase.
    ///
    /// All inputs must share the first spectrum's frequency set. The result
    /// keeps the first spectrum's timestamp and name and carries no fit.
    pub fn average(spectra: &[ImpedanceSpectrum]) -> EisResult<Self> {
        let first = spectra
            .first()
            .ok_or_else(|| EisError::SpectrumEmpty("nothing to average".to_string()))?;
        if spectra.iter().any(|s| s.frequencies != first.frequencies) {
            return Err(EisError::InvalidFrame(
                "cannot average spectra with different frequency sets".to_string(),
            ));
        }

        let count = spectra.len() as f64;
        let mut impedance = vec![Complex64::new(0.0, 0.0); first.len()];
        let mut phase_deg = vec![0.0; first.len()];
        for spectrum in spectra {
            for (i, z) in spectrum.impedance.iter().enumerate() {
                impedance[i] += z;
                phase_deg[i] += spectrum.phase_deg[i];
            }
        }
        impedance.iter_mut().for_each(|z| *z /= count);
        phase_deg.iter_mut().for_each(|p| *p /= count);

        Ok(Self {
            timestamp: first.timestamp,
            frequencies: first.frequencies.clone(),
            impedance,
            phase_deg,
            name: first.name.clone(),
            fit: None,
        })
    }

    /// Tab-separated `<Frequency>\t<Re(Z)>\t<Im(Z)>` text, sorted by frequency.
    pub fn to_text(&self) -> String {
        let mut rows: Vec<(f64, Complex64)> = self
            .frequencies
            .iter()
            .cloned()
            .zip(self.impedance.iter().cloned())
            .collect();
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut out = String::from("<Frequency>\t<Re(Z)>\t<Im(Z)>\n");
        for (f, z) in rows {
            out.push_str(&format!("{}\t{}\t{}\n", f, z.re, z.im));
        }
        out
    }

    /// Read a spectrum file written by `to_text`.
    pub fn from_file(path: impl AsRef<Path>, timestamp: DateTime<Utc>) -> EisResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let malformed = |reason: String| EisError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let mut frequencies = Vec::new();
        let mut impedance = Vec::new();
        for (lineno, line) in text.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<f64> = line
                .split('\t')
                .map(|s| s.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| malformed(format!("line {}: {}", lineno + 1, e)))?;
            if fields.len() != 3 {
                return Err(malformed(format!("line {}: expected 3 columns", lineno + 1)));
            }
            frequencies.push(fields[0]);
            impedance.push(Complex64::new(fields[1], fields[2]));
        }

        let mut spectrum = Self::new(timestamp, frequencies, impedance)?;
        spectrum.name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
        Ok(spectrum)
    }
}
