use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio::sync::watch;
use tracing::debug;

use super::store::Experiment;
use crate::core::ImpedanceSpectrum;
use crate::error::{EisError, EisResult};
use crate::observability::MonitorEvent;

const MONITOR_CAPACITY: usize = 1024;

/// Frames the processing task has finished with, whatever the outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observations {
    pub stored: u64,
    pub rejected: u64,
}

impl Observations {
    pub fn total(&self) -> u64 {
        self.stored + self.rejected
    }
}

/// Shared handle to the experiment currently receiving spectra.
#[derive(Clone)]
pub struct ExperimentLog {
    current: Arc<RwLock<Experiment>>,
    /// Serializes appends and swaps; files are written without `current` locked.
    appending: Arc<Mutex<()>>,
    observations: Arc<watch::Sender<Observations>>,
    events_tx: Sender<MonitorEvent>,
    events_rx: Receiver<MonitorEvent>,
}

impl ExperimentLog {
    pub fn new(experiment: Experiment) -> Self {
        let (tx, _rx) = watch::channel(Observations::default());
        let (events_tx, events_rx) = crossbeam_channel::bounded(MONITOR_CAPACITY);
        Self {
            current: Arc::new(RwLock::new(experiment)),
            appending: Arc::new(Mutex::new(())),
            observations: Arc::new(tx),
            events_tx,
            events_rx,
        }
    }

    /// Replace the current experiment; the old one is returned.
    pub fn set_experiment(&self, experiment: Experiment) -> Experiment {
        let dir = experiment.dir().to_path_buf();
        let previous = {
            let _appending = self
                .appending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *current, experiment)
        };
        self.publish(MonitorEvent::ExperimentStarted { dir });
        previous
    }

    /// Append to the current experiment and count the observation.
    pub fn append(&self, spectrum: ImpedanceSpectrum) -> EisResult<usize> {
        let result = {
            let _appending = self
                .appending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            self.store(&spectrum)
        };

        match result {
            Ok(index) => {
                self.observations.send_modify(|o| o.stored += 1);
                self.publish(MonitorEvent::SpectrumStored { index, spectrum });
                Ok(index)
            }
            Err(e) => {
                if let EisError::SchemaViolation { expected, found } = &e {
                    self.publish(MonitorEvent::AppendHalted {
                        expected: expected.clone(),
                        found: found.clone(),
                    });
                }
                Err(e)
            }
        }
    }

    fn store(&self, spectrum: &ImpedanceSpectrum) -> EisResult<usize> {
        let pending = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .prepare_append(spectrum)?;
        pending.write()?;
        Ok(self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .commit_append(spectrum.clone(), pending))
    }

    /// Count a frame that produced nothing storable.
    pub fn record_rejection(&self, reason: impl Into<String>) {
        self.observations.send_modify(|o| o.rejected += 1);
        self.publish(MonitorEvent::SpectrumRejected {
            reason: reason.into(),
        });
    }

    pub fn observations(&self) -> Observations {
        *self.observations.borrow()
    }

    /// Wait until at least `target` observations were made in total.
    pub async fn wait_for_observations(&self, target: u64, timeout: Duration) -> EisResult<()> {
        let mut rx = self.observations.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|o| o.total() >= target))
            .await
            .is_ok();
        if reached {
            Ok(())
        } else {
            Err(EisError::ProcessingStalled(timeout))
        }
    }

    /// Run `f` with read access to the current experiment.
    pub fn read<R>(&self, f: impl FnOnce(&Experiment) -> R) -> R {
        let current = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&current)
    }

    pub fn count(&self) -> usize {
        self.read(|e| e.count())
    }

    pub fn latest(&self) -> Option<ImpedanceSpectrum> {
        self.read(|e| e.latest().cloned())
    }

    /// Spectra stored after the first `count` ones.
    pub fn spectra_since(&self, count: usize) -> Vec<ImpedanceSpectrum> {
        self.read(|e| e.spectra().iter().skip(count).cloned().collect())
    }

    pub fn is_halted(&self) -> bool {
        self.read(|e| e.is_halted())
    }

    pub fn acknowledge_schema_violation(&self) {
        self.current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .acknowledge_schema_violation();
    }

    /// Non-blocking feed for the presentation layer, polled with `try_iter`.
    ///
    /// The feed holds the newest events; a slow reader loses the oldest.
    pub fn events(&self) -> Receiver<MonitorEvent> {
        self.events_rx.clone()
    }

    fn publish(&self, mut event: MonitorEvent) {
        loop {
            match self.events_tx.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.events_rx.try_recv().is_ok() {
                        debug!("Monitor feed full; oldest event dropped");
                    }
                    event = rejected;
                }
            }
        }
    }
}
