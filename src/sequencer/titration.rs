use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use super::backend::{wait_for_trigger, ConcentrationSource, MultiplexBackend};
use super::state::{MultiplexState, SequenceOutcome, TitrationState};
use crate::core::{AbortSignal, ImpedanceSpectrum};
use crate::error::{EisError, EisResult};
use crate::hal::TriggerSource;

/// Titration: for every concentration, one averaged spectrum per sensor,
/// each started by an external trigger.
pub struct TitrationSequencer {
    state: MultiplexState,
    poll: Duration,
    progress: watch::Sender<TitrationState>,
}

impl TitrationSequencer {
    pub fn new(state: MultiplexState, poll: Duration) -> Self {
        let (progress, _rx) = watch::channel(TitrationState::AwaitingConcentration);
        Self {
            state,
            poll,
            progress,
        }
    }

    pub fn state(&self) -> &MultiplexState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<TitrationState> {
        self.progress.subscribe()
    }

    fn publish(&self, state: TitrationState) {
        self.progress.send_replace(state);
    }

    fn aborted(&self) -> EisResult<SequenceOutcome> {
        info!(
            "Titration aborted after {} captures",
            self.state.total_captures()
        );
        self.publish(TitrationState::Aborted);
        Ok(SequenceOutcome::Aborted)
    }

    pub async fn run(
        &mut self,
        backend: &dyn MultiplexBackend,
        trigger: &dyn TriggerSource,
        concentrations: &mut dyn ConcentrationSource,
        abort: &AbortSignal,
    ) -> EisResult<SequenceOutcome> {
        trigger.clear().await?;

        loop {
            self.publish(TitrationState::AwaitingConcentration);
            if abort.is_triggered() {
                return self.aborted();
            }
            let concentration = tokio::select! {
                c = concentrations.next_concentration() => c,
                _ = abort.triggered() => return self.aborted(),
            };
            let Some(concentration) = concentration else {
                info!("No more concentrations; titration finished");
                self.publish(TitrationState::Finished);
                return Ok(SequenceOutcome::Finished);
            };
            info!("Titration condition {}", concentration);
            self.state.set_condition(concentration.clone());

            while !self.state.condition_complete() {
                let sensor = self.state.current_sensor().to_string();
                self.publish(TitrationState::AwaitingTrigger {
                    sensor: sensor.clone(),
                });
                if !wait_for_trigger(trigger, abort, self.poll).await? {
                    return self.aborted();
                }

                if self.state.is_complete(&sensor, &concentration) {
                    info!(
                        "{} already stored at {}; trigger passes to the next sensor",
                        sensor, concentration
                    );
                    trigger.consume().await?;
                    self.state.record_capture();
                    continue;
                }

                let frames = self.state.frames_per_condition();
                self.publish(TitrationState::Recording {
                    sensor: sensor.clone(),
                    frames,
                });
                let recorded = backend.record_and_collect(frames, abort).await;
                trigger.consume().await?;
                self.state.record_capture();

                match recorded {
                    Ok(spectra) if spectra.is_empty() => {
                        warn!(
                            "No usable spectra for {} at {}; sensor not marked complete",
                            sensor, concentration
                        );
                    }
                    Ok(spectra) => {
                        self.publish(TitrationState::AveragingAndSaving {
                            sensor: sensor.clone(),
                        });
                        match self.save_average(backend, &spectra, &sensor, &concentration).await {
                            Ok(()) => self.state.mark_complete(&sensor),
                            Err(e) => warn!("Failed to store average for {}: {}", sensor, e),
                        }
                    }
                    Err(EisError::Aborted) => return self.aborted(),
                    Err(e) => warn!("Recording for {} failed: {}", sensor, e),
                }

                if abort.is_triggered() {
                    return self.aborted();
                }
            }
        }
    }

    async fn save_average(
        &self,
        backend: &dyn MultiplexBackend,
        spectra: &[ImpedanceSpectrum],
        sensor: &str,
        concentration: &str,
    ) -> EisResult<()> {
        let mut average = ImpedanceSpectrum::average(spectra)?
            .with_name(format!("{}_{}.txt", sensor, concentration));
        let fit = backend.fit(&average).await;
        average.set_fit(fit);
        backend.store_average(average).await
    }
}
