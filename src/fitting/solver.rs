use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::topology::Topology;
use crate::core::{FitResult, ImpedanceSpectrum};
use crate::error::{EisError, EisResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParameter {
    pub name: String,
    pub value: f64,
    /// Fixed parameters keep their value through the fit.
    pub free: bool,
}

impl FitParameter {
    pub fn new(name: impl Into<String>, value: f64, free: bool) -> Self {
        Self {
            name: name.into(),
            value,
            free,
        }
    }
}

/// Everything an external solver needs for one spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRequest {
    pub topology: Topology,
    pub frequencies: Vec<f64>,
    pub real: Vec<f64>,
    pub imag: Vec<f64>,
    pub parameters: Vec<FitParameter>,
}

impl FitRequest {
    pub fn new(topology: Topology, spectrum: &ImpedanceSpectrum, parameters: Vec<FitParameter>) -> Self {
        Self {
            topology,
            frequencies: spectrum.frequencies().to_vec(),
            real: spectrum.impedance().iter().map(|z| z.re).collect(),
            imag: spectrum.impedance().iter().map(|z| z.im).collect(),
            parameters,
        }
    }
}

/// Boundary to a nonlinear least-squares solver.
#[async_trait]
pub trait SpectrumFitter: Send + Sync {
    async fn fit(&self, request: &FitRequest) -> EisResult<FitResult>;
}

/// Run `fitter` under `timeout`; a timeout surfaces as `FitTimeout`.
pub async fn fit_bounded(
    fitter: &dyn SpectrumFitter,
    request: &FitRequest,
    timeout: Duration,
) -> EisResult<FitResult> {
    let result = tokio::time::timeout(timeout, fitter.fit(request))
        .await
        .map_err(|_| EisError::FitTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })??;

    if result.iter().any(|(_, v)| !v.is_finite()) {
        return Err(EisError::FitFailure("solver returned non-finite values".to_string()));
    }
    Ok(result)
}

/// Like `fit_bounded`, but any failure is logged and becomes `None`.
pub async fn fit_with_timeout(
    fitter: &dyn SpectrumFitter,
    request: &FitRequest,
    timeout: Duration,
) -> Option<FitResult> {
    match fit_bounded(fitter, request, timeout).await {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("No fit for this spectrum: {}", e);
            None
        }
    }
}

/// Operator's fitting choices for an experiment.
#[derive(Clone)]
pub struct FitSetup {
    fitter: Arc<dyn SpectrumFitter>,
    topology: Topology,
    parameters: Vec<FitParameter>,
    timeout: Duration,
}

/// Serializable part of a `FitSetup`, recorded in experiment metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDescription {
    pub topology: Topology,
    pub parameters: Vec<FitParameter>,
    pub timeout_ms: u64,
}

impl FitSetup {
    pub fn new(fitter: Arc<dyn SpectrumFitter>, topology: Topology, timeout: Duration) -> Self {
        Self {
            fitter,
            topology,
            parameters: topology.parameters(),
            timeout,
        }
    }

    /// Replace the default guesses. Names must match the topology, in order.
    pub fn with_parameters(mut self, parameters: Vec<FitParameter>) -> EisResult<Self> {
        let names: Vec<String> = parameters.iter().map(|p| p.name.clone()).collect();
        if names != self.topology.parameter_names() {
            return Err(EisError::FitFailure(format!(
                "parameters {:?} do not match topology {} ({:?})",
                names,
                self.topology,
                self.topology.parameter_names()
            )));
        }
        self.parameters = parameters;
        Ok(self)
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn parameters(&self) -> &[FitParameter] {
        &self.parameters
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn fitter(&self) -> &dyn SpectrumFitter {
        self.fitter.as_ref()
    }

    /// Guesses for the next spectrum: the previous fit where it has a value
    /// for a free parameter, the operator's guess otherwise.
    pub fn initial_guess(&self, previous: Option<&FitResult>) -> Vec<FitParameter> {
        self.parameters
            .iter()
            .map(|p| {
                let carried = previous
                    .filter(|_| p.free)
                    .and_then(|fit| fit.get(&p.name))
                    .filter(|v| v.is_finite());
                FitParameter {
                    value: carried.unwrap_or(p.value),
                    ..p.clone()
                }
            })
            .collect()
    }

    pub fn request(&self, spectrum: &ImpedanceSpectrum, previous: Option<&FitResult>) -> FitRequest {
        FitRequest::new(self.topology, spectrum, self.initial_guess(previous))
    }

    pub fn describe(&self) -> FitDescription {
        FitDescription {
            topology: self.topology,
            parameters: self.parameters.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SolverReply {
    Fit(FitResult),
    Failure { error: String },
}

/// Solver running as a child process.
///
/// The request goes to the child's stdin as JSON; the child answers on stdout
/// with a `FitResult` or `{"error": "..."}`. Dropping the future (for example
/// on timeout) kills the child.
#[derive(Debug, Clone)]
pub struct CommandFitter {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandFitter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl SpectrumFitter for CommandFitter {
    async fn fit(&self, request: &FitRequest) -> EisResult<FitResult> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| EisError::FitFailure(format!("cannot encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EisError::FitFailure(format!("cannot start {:?}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(EisError::FitFailure(format!(
                "{:?} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!("Solver replied with {} bytes", output.stdout.len());
        match serde_json::from_slice::<SolverReply>(&output.stdout) {
            Ok(SolverReply::Fit(result)) => Ok(result),
            Ok(SolverReply::Failure { error }) => Err(EisError::FitFailure(error)),
            Err(e) => Err(EisError::FitFailure(format!("unreadable solver reply: {}", e))),
        }
    }
}
