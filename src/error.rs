use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy shared by the acquisition, processing and sequencing layers.
///
/// Every variant except `SchemaViolation` is recoverable: the caller logs it and
/// moves on to the next observation.
#[derive(Debug, Error)]
pub enum EisError {
    #[error("instrument unavailable: {0}")]
    InstrumentUnavailable(String),

    #[error("no calibration file for waveform {waveform}")]
    CalibrationMissing { waveform: String },

    #[error("spectrum empty: {0}")]
    SpectrumEmpty(String),

    #[error("fit exceeded its {timeout_ms} ms budget")]
    FitTimeout { timeout_ms: u64 },

    #[error("fit failed: {0}")]
    FitFailure(String),

    #[error("fit parameters {found:?} do not match locked fit-history header {expected:?}")]
    SchemaViolation {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("experiment append path halted until the schema violation is acknowledged")]
    AppendHalted,

    #[error("aborted by operator")]
    Aborted,

    #[error("another {0} is already in progress")]
    Busy(&'static str),

    #[error("requested {requested} frames but only {available} buffered")]
    BufferEmpty { requested: usize, available: usize },

    #[error("spectrum timestamp {found} is not after the previous one ({previous})")]
    OutOfOrder { previous: String, found: String },

    #[error("invalid waveform: {0}")]
    InvalidWaveform(String),

    #[error("invalid resistance {0:?}: expected a number with optional k or M suffix")]
    InvalidResistance(String),

    #[error("invalid sensor list: {0}")]
    InvalidSensors(String),

    #[error("runtime is not started")]
    NotRunning,

    #[error("apply a waveform before recording")]
    NoWaveformApplied,

    #[error("processing did not catch up within {0:?}")]
    ProcessingStalled(std::time::Duration),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("malformed file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EisError {
    /// True for failures that must stop the current experiment's append path.
    pub fn halts_experiment(&self) -> bool {
        matches!(self, Self::SchemaViolation { .. } | Self::AppendHalted)
    }
}

pub type EisResult<T> = Result<T, EisError>;
