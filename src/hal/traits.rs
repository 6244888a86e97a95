use std::time::Duration;

use async_trait::async_trait;

use crate::core::{Frame, Waveform};
use crate::error::EisResult;

/// Two-channel capture instrument: voltage on channel 1, current monitor on
/// channel 2.
#[async_trait]
pub trait Digitizer: Send + Sync {
    /// Arm a single acquisition and wait until it reports ready.
    ///
    /// Fails with `InstrumentUnavailable` when the instrument is unreachable
    /// or not ready within `timeout`.
    async fn arm_and_wait(&self, timeout: Duration) -> EisResult<()>;

    /// Read back the completed acquisition.
    async fn read_back(&self) -> EisResult<Frame>;

    async fn arm_and_capture(&self, timeout: Duration) -> EisResult<Frame> {
        self.arm_and_wait(timeout).await?;
        self.read_back().await
    }
}

/// Arbitrary waveform generator driving the excitation.
#[async_trait]
pub trait WaveformDriver: Send + Sync {
    /// Upload `waveform` and drive it at `vpp` volts peak-to-peak.
    async fn apply(&self, waveform: &Waveform, vpp: f64) -> EisResult<()>;
}

/// Poll-and-consume view of the external trigger signal.
#[async_trait]
pub trait TriggerSource: Send + Sync {
    async fn is_ready(&self) -> EisResult<bool>;

    /// Acknowledge one trigger. Called exactly once per detected trigger.
    async fn consume(&self) -> EisResult<()>;

    /// Drop any stale trigger before a run starts.
    async fn clear(&self) -> EisResult<()>;
}
