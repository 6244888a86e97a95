use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use super::backend::MultiplexBackend;
use super::state::{InVivoState, MultiplexState, SequenceOutcome};
use crate::core::AbortSignal;
use crate::error::EisResult;
use crate::hal::TriggerSource;

/// In-vivo: one frame per trigger, sensors in rotation, until the run
/// duration has elapsed.
pub struct InVivoSequencer {
    state: MultiplexState,
    duration: Duration,
    poll: Duration,
    progress: watch::Sender<InVivoState>,
}

impl InVivoSequencer {
    pub fn new(state: MultiplexState, duration: Duration, poll: Duration) -> Self {
        let (progress, _rx) = watch::channel(InVivoState::Idle);
        Self {
            state,
            duration,
            poll,
            progress,
        }
    }

    pub fn state(&self) -> &MultiplexState {
        &self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<InVivoState> {
        self.progress.subscribe()
    }

    fn publish(&self, state: InVivoState) {
        self.progress.send_replace(state);
    }

    pub async fn run(
        &mut self,
        backend: &dyn MultiplexBackend,
        trigger: &dyn TriggerSource,
        abort: &AbortSignal,
    ) -> EisResult<SequenceOutcome> {
        trigger.clear().await?;
        let start = Instant::now();

        loop {
            if start.elapsed() >= self.duration {
                info!(
                    "In-vivo run finished after {} captures",
                    self.state.total_captures()
                );
                self.publish(InVivoState::TimedOut);
                return Ok(SequenceOutcome::TimedOut);
            }
            if abort.is_triggered() {
                info!(
                    "In-vivo run aborted after {} captures",
                    self.state.total_captures()
                );
                self.publish(InVivoState::Aborted);
                return Ok(SequenceOutcome::Aborted);
            }

            let sensor = self.state.current_sensor().to_string();
            self.publish(InVivoState::AwaitingTrigger {
                sensor: sensor.clone(),
            });
            if !trigger.is_ready().await? {
                let remaining = self.duration.saturating_sub(start.elapsed());
                tokio::select! {
                    _ = tokio::time::sleep(self.poll.min(remaining)) => {}
                    _ = abort.triggered() => {}
                }
                continue;
            }

            let cycle = self.state.cycle();
            self.publish(InVivoState::CaptureOne {
                sensor: sensor.clone(),
                cycle,
            });
            let label = format!("{}_{:06}.txt", sensor, cycle);
            if let Err(e) = backend.capture_frame(&label).await {
                warn!("Capture {} failed: {}", label, e);
            }
            trigger.consume().await?;
            self.state.record_capture();
        }
    }
}
