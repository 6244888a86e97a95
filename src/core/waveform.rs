use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::spectrum::ImpedanceSpectrum;
use crate::error::{EisError, EisResult};

/// Decimal places used whenever two frequencies are compared.
pub const FREQUENCY_DECIMALS: i32 = 3;

const MAINS_HZ: f64 = 60.0;
const OPTIMIZED_SUFFIX: &str = "_opt";

/// Round to the comparison precision shared by bins and applied tones.
pub fn round_frequency(frequency: f64) -> f64 {
    let scale = 10f64.powi(FREQUENCY_DECIMALS);
    (frequency * scale).round() / scale
}

/// Integer key for exact frequency matching at `FREQUENCY_DECIMALS`.
pub fn frequency_key(frequency: f64) -> i64 {
    (frequency * 10f64.powi(FREQUENCY_DECIMALS)).round() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tone {
    pub frequency: f64,
    /// Degrees
    pub phase: f64,
    pub amplitude: f64,
}

/// Multi-tone excitation: unique frequencies, strictly ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WaveformRecord")]
pub struct Waveform {
    tones: Vec<Tone>,
    optimized: bool,
}

/// Serialized form, validated through `Waveform::new` on the way in.
#[derive(Deserialize)]
struct WaveformRecord {
    tones: Vec<Tone>,
    #[serde(default)]
    optimized: bool,
}

impl TryFrom<WaveformRecord> for Waveform {
    type Error = EisError;

    fn try_from(record: WaveformRecord) -> EisResult<Self> {
        let mut waveform = Waveform::new(record.tones)?;
        waveform.optimized = record.optimized;
        Ok(waveform)
    }
}

impl Waveform {
    pub fn new(tones: Vec<Tone>) -> EisResult<Self> {
        if tones.is_empty() {
            return Err(EisError::InvalidWaveform("no tones".to_string()));
        }
        if tones.iter().any(|t| !(t.frequency > 0.0) || !t.frequency.is_finite()) {
            return Err(EisError::InvalidWaveform(
                "frequencies must be positive".to_string(),
            ));
        }
        for pair in tones.windows(2) {
            if frequency_key(pair[1].frequency) <= frequency_key(pair[0].frequency) {
                return Err(EisError::InvalidWaveform(format!(
                    "frequencies must be unique and ascending ({} then {})",
                    pair[0].frequency, pair[1].frequency
                )));
            }
        }
        Ok(Self {
            tones,
            optimized: false,
        })
    }

    /// Unit-amplitude, zero-phase tones at the given frequencies.
    pub fn from_frequencies(frequencies: &[f64]) -> EisResult<Self> {
        Self::new(
            frequencies
                .iter()
                .map(|&frequency| Tone {
                    frequency,
                    phase: 0.0,
                    amplitude: 1.0,
                })
                .collect(),
        )
    }

    /// Pick `n_points` log-spaced tones between `f_min` and `f_max`.
    ///
    /// Every tone is an integer multiple of `f_min` so one period of the
    /// slowest tone holds a whole number of cycles of every other tone.
    /// Mains harmonics and exact second harmonics of lower tones are skipped.
    pub fn generate(f_min: f64, f_max: f64, n_points: usize) -> EisResult<Self> {
        if !(f_max > f_min && f_min > 0.0) {
            return Err(EisError::InvalidWaveform(
                "must have f_max > f_min > 0".to_string(),
            ));
        }
        if n_points == 0 || f_max <= n_points as f64 * f_min {
            return Err(EisError::InvalidWaveform(format!(
                "cannot fit {} points between {} and {} Hz: all tones must be integer multiples of {} Hz",
                n_points, f_min, f_max, f_min
            )));
        }

        let multiples: Vec<f64> = (1..=(f_max / f_min).floor() as usize)
            .map(|k| k as f64 * f_min)
            .collect();
        let targets: Vec<f64> = (0..n_points)
            .map(|i| {
                let frac = if n_points == 1 {
                    0.0
                } else {
                    i as f64 / (n_points - 1) as f64
                };
                10f64.powf(f_min.log10() + frac * (f_max.log10() - f_min.log10()))
            })
            .collect();

        let mut chosen: Vec<f64> = Vec::with_capacity(n_points);
        for target in targets {
            let mut idx = nearest_index(&multiples, target);
            loop {
                let candidate = multiples[idx];
                let rejected = chosen.iter().any(|&c| frequency_key(c) == frequency_key(candidate))
                    || is_mains_harmonic(candidate)
                    || chosen
                        .iter()
                        .any(|&c| frequency_key(candidate) == frequency_key(2.0 * c));
                if !rejected {
                    chosen.push(candidate);
                    break;
                }
                idx += 1;
                if idx >= multiples.len() {
                    return Err(EisError::InvalidWaveform(format!(
                        "ran out of usable multiples of {} Hz below {} Hz",
                        f_min, f_max
                    )));
                }
            }
        }
        chosen.sort_by(|a, b| a.total_cmp(b));

        let mut rng = rand::thread_rng();
        Self::new(
            chosen
                .into_iter()
                .map(|frequency| Tone {
                    frequency,
                    phase: rng.gen_range(-180..180) as f64,
                    amplitude: 1.0,
                })
                .collect(),
        )
    }

    /// Same tones with amplitudes proportional to `sqrt(|Z|)` of `spectrum`.
    pub fn optimized_from(&self, spectrum: &ImpedanceSpectrum) -> EisResult<Self> {
        let applied: Vec<i64> = self.tones.iter().map(|t| frequency_key(t.frequency)).collect();
        let measured: Vec<i64> = spectrum.frequencies().iter().map(|&f| frequency_key(f)).collect();
        if applied != measured {
            return Err(EisError::InvalidWaveform(
                "spectrum frequencies do not match the waveform".to_string(),
            ));
        }

        let weights: Vec<f64> = spectrum.impedance().iter().map(|z| z.norm().sqrt()).collect();
        let max = weights.iter().cloned().fold(0.0_f64, f64::max);
        if max <= 0.0 || !max.is_finite() {
            return Err(EisError::InvalidWaveform(
                "spectrum magnitudes are not usable for amplitude optimization".to_string(),
            ));
        }

        let tones = self
            .tones
            .iter()
            .zip(weights)
            .map(|(tone, w)| Tone {
                amplitude: w / max,
                ..*tone
            })
            .collect();
        Ok(Self {
            tones,
            optimized: true,
        })
    }

    pub fn tones(&self) -> &[Tone] {
        &self.tones
    }

    pub fn frequencies(&self) -> Vec<f64> {
        self.tones.iter().map(|t| t.frequency).collect()
    }

    pub fn min_frequency(&self) -> f64 {
        self.tones[0].frequency
    }

    pub fn max_frequency(&self) -> f64 {
        self.tones[self.tones.len() - 1].frequency
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    /// Identity shared by a waveform and its optimized variants.
    pub fn canonical_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.min_frequency(),
            self.max_frequency(),
            self.tones.len()
        )
    }

    pub fn name(&self) -> String {
        if self.optimized {
            format!("{}{}", self.canonical_name(), OPTIMIZED_SUFFIX)
        } else {
            self.canonical_name()
        }
    }

    /// One period of the slowest tone, peak rescaled to the largest amplitude.
    pub fn time_domain(&self, sample_rate: f64) -> Vec<f64> {
        let period = 1.0 / self.min_frequency();
        let n = (period * sample_rate).ceil() as usize;
        if n == 0 {
            return Vec::new();
        }
        let step = if n > 1 { period / (n - 1) as f64 } else { 0.0 };

        let mut signal: Vec<f64> = (0..n)
            .map(|i| {
                let t = i as f64 * step;
                self.tones
                    .iter()
                    .map(|tone| {
                        tone.amplitude
                            * (2.0 * PI * tone.frequency * t + tone.phase.to_radians()).sin()
                    })
                    .sum()
            })
            .collect();

        let peak = signal.iter().cloned().fold(f64::MIN, f64::max);
        let target = self.tones.iter().map(|t| t.amplitude).fold(0.0_f64, f64::max);
        if peak > 0.0 {
            let scale = target / peak;
            signal.iter_mut().for_each(|v| *v *= scale);
        }
        signal
    }

    pub fn to_csv(&self, dir: impl AsRef<Path>) -> EisResult<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.csv", self.name()));

        let mut body = String::from("frequency,phase,amplitude\n");
        for tone in &self.tones {
            body.push_str(&format!("{},{},{}\n", tone.frequency, tone.phase, tone.amplitude));
        }
        fs::write(&path, body)?;
        Ok(path)
    }

    pub fn from_csv(path: impl AsRef<Path>) -> EisResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let malformed = |reason: String| EisError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let mut tones = Vec::new();
        for (lineno, line) in text.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<f64> = line
                .split(',')
                .map(|s| s.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| malformed(format!("line {}: {}", lineno + 1, e)))?;
            if fields.len() != 3 {
                return Err(malformed(format!(
                    "line {}: expected 3 columns, found {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            tones.push(Tone {
                frequency: fields[0],
                phase: fields[1],
                amplitude: fields[2],
            });
        }

        let mut waveform = Self::new(tones)?;
        waveform.optimized = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.ends_with(OPTIMIZED_SUFFIX))
            .unwrap_or(false);
        Ok(waveform)
    }
}

fn nearest_index(values: &[f64], target: f64) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - target).abs().total_cmp(&(*b - target).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn is_mains_harmonic(frequency: f64) -> bool {
    let ratio = frequency / MAINS_HZ;
    (ratio - ratio.round()).abs() < 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsorted_or_duplicate_frequencies() {
        assert!(Waveform::from_frequencies(&[10.0, 5.0]).is_err());
        assert!(Waveform::from_frequencies(&[10.0, 10.0]).is_err());
        assert!(Waveform::from_frequencies(&[]).is_err());
        assert!(Waveform::from_frequencies(&[10.0, 31.6, 100.0]).is_ok());
    }

    #[test]
    fn test_generated_tones_follow_placement_rules() {
        let waveform = Waveform::generate(10.0, 1000.0, 14).unwrap();
        let freqs = waveform.frequencies();
        assert_eq!(freqs.len(), 14);
        assert_eq!(freqs[0], 10.0);

        for (i, &f) in freqs.iter().enumerate() {
            assert!(((f / 10.0) - (f / 10.0).round()).abs() < 1e-9, "{} not a multiple", f);
            assert!(!is_mains_harmonic(f), "{} is a mains harmonic", f);
            for &lower in &freqs[..i] {
                assert!(frequency_key(f) != frequency_key(2.0 * lower));
            }
        }
        for tone in waveform.tones() {
            assert!((-180.0..180.0).contains(&tone.phase));
        }
    }

    #[test]
    fn test_generate_rejects_impossible_requests() {
        assert!(Waveform::generate(10.0, 50.0, 10).is_err());
        assert!(Waveform::generate(100.0, 10.0, 3).is_err());
    }

    #[test]
    fn test_names_share_canonical_identity() {
        let waveform = Waveform::from_frequencies(&[1.0, 10.0, 1000.0]).unwrap();
        assert_eq!(waveform.name(), "1_1000_3");

        let mut optimized = waveform.clone();
        optimized.optimized = true;
        assert_eq!(optimized.name(), "1_1000_3_opt");
        assert_eq!(optimized.canonical_name(), waveform.canonical_name());
    }

    #[test]
    fn test_time_domain_covers_one_slow_period() {
        let waveform = Waveform::from_frequencies(&[10.0, 20.0]).unwrap();
        let signal = waveform.time_domain(1000.0);
        assert_eq!(signal.len(), 100);
        let peak = signal.iter().cloned().fold(f64::MIN, f64::max);
        assert!((peak - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_csv_round_trip_keeps_optimized_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut waveform = Waveform::from_frequencies(&[2.0, 4.5, 9.0]).unwrap();
        waveform.optimized = true;

        let path = waveform.to_csv(dir.path()).unwrap();
        assert!(path.ends_with("2_9_3_opt.csv"));
        assert_eq!(Waveform::from_csv(&path).unwrap(), waveform);
    }

    #[test]
    fn test_deserialize_validates_tones() {
        let empty = serde_json::from_str::<Waveform>(r#"{"tones": [], "optimized": false}"#);
        assert!(empty.is_err());

        let descending = serde_json::json!({
            "tones": [
                { "frequency": 100.0, "phase": 0.0, "amplitude": 1.0 },
                { "frequency": 10.0, "phase": 0.0, "amplitude": 1.0 }
            ]
        });
        assert!(serde_json::from_value::<Waveform>(descending).is_err());

        let waveform = Waveform::from_frequencies(&[10.0, 100.0]).unwrap();
        let json = serde_json::to_string(&waveform).unwrap();
        assert_eq!(serde_json::from_str::<Waveform>(&json).unwrap(), waveform);
    }
}
