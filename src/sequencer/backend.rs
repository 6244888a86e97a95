use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::{AbortSignal, FitResult, ImpedanceSpectrum};
use crate::error::EisResult;
use crate::hal::TriggerSource;

/// What the sequencer needs from acquisition and storage.
#[async_trait]
pub trait MultiplexBackend: Send + Sync {
    /// Capture one labelled frame into the live experiment.
    async fn capture_frame(&self, label: &str) -> EisResult<()>;

    /// Capture `n` frames and return the spectra they produced.
    async fn record_and_collect(
        &self,
        n: usize,
        abort: &AbortSignal,
    ) -> EisResult<Vec<ImpedanceSpectrum>>;

    /// Fit if fitting is enabled. `None` on timeout or failure.
    async fn fit(&self, spectrum: &ImpedanceSpectrum) -> Option<FitResult>;

    /// Persist an averaged, named spectrum in the run's experiment.
    async fn store_average(&self, spectrum: ImpedanceSpectrum) -> EisResult<()>;
}

/// Supplies titration conditions. `None` ends the run.
#[async_trait]
pub trait ConcentrationSource: Send {
    async fn next_concentration(&mut self) -> Option<String>;
}

/// Fixed list of concentrations.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConcentrations {
    queue: VecDeque<String>,
}

impl ScriptedConcentrations {
    pub fn new<I, S>(concentrations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: concentrations.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ConcentrationSource for ScriptedConcentrations {
    async fn next_concentration(&mut self) -> Option<String> {
        self.queue.pop_front()
    }
}

/// Concentrations entered by an operator elsewhere; closing the channel ends the run.
#[async_trait]
impl ConcentrationSource for mpsc::Receiver<String> {
    async fn next_concentration(&mut self) -> Option<String> {
        self.recv().await
    }
}

/// Poll `trigger` until it is ready. `Ok(false)` means `abort` was set first.
///
/// There is no deadline: the trigger comes from an application we do not
/// control, and only the operator can give up on it.
pub async fn wait_for_trigger(
    trigger: &dyn TriggerSource,
    abort: &AbortSignal,
    poll: Duration,
) -> EisResult<bool> {
    loop {
        if abort.is_triggered() {
            return Ok(false);
        }
        if trigger.is_ready().await? {
            return Ok(true);
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = abort.triggered() => {}
        }
    }
}
