use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EisError, EisResult};

/// Vertical scaling the digitizer applied when converting ADC counts to volts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelScaling {
    pub volts_per_div: f64,
    pub offset: f64,
}

impl Default for ChannelScaling {
    fn default() -> Self {
        Self {
            volts_per_div: 1.0,
            offset: 0.0,
        }
    }
}

/// Acquisition settings in effect for one capture
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordingParams {
    /// Samples per second
    pub sample_rate: f64,

    /// Length of the capture window in seconds
    pub frame_duration: f64,

    /// Amps per volt on the current-monitor channel
    pub current_range: f64,

    pub channel1: ChannelScaling,
    pub channel2: ChannelScaling,
}

/// One digitizer capture: voltage on channel 1, current monitor on channel 2.
///
/// Frames are immutable once built and move through the FrameBuffer by value.
#[derive(Debug, Clone)]
pub struct Frame {
    captured_at: DateTime<Utc>,
    params: RecordingParams,
    channel1: Vec<f64>,
    channel2: Vec<f64>,
    label: Option<String>,
}

impl Frame {
    pub fn new(
        captured_at: DateTime<Utc>,
        params: RecordingParams,
        channel1: Vec<f64>,
        channel2: Vec<f64>,
    ) -> EisResult<Self> {
        if channel1.len() != channel2.len() {
            return Err(EisError::InvalidFrame(format!(
                "channel lengths differ ({} vs {})",
                channel1.len(),
                channel2.len()
            )));
        }
        if params.sample_rate <= 0.0 || params.frame_duration <= 0.0 {
            return Err(EisError::InvalidFrame(
                "sample rate and frame duration must be positive".to_string(),
            ));
        }
        Ok(Self {
            captured_at,
            params,
            channel1,
            channel2,
            label: None,
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn params(&self) -> &RecordingParams {
        &self.params
    }

    pub fn voltage(&self) -> &[f64] {
        &self.channel1
    }

    pub fn current_monitor(&self) -> &[f64] {
        &self.channel2
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn len(&self) -> usize {
        self.channel1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel1.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RecordingParams {
        RecordingParams {
            sample_rate: 1000.0,
            frame_duration: 0.01,
            current_range: 1e-3,
            channel1: ChannelScaling::default(),
            channel2: ChannelScaling::default(),
        }
    }

    #[test]
    fn test_rejects_mismatched_channels() {
        let result = Frame::new(Utc::now(), params(), vec![0.0; 10], vec![0.0; 9]);
        assert!(matches!(result, Err(EisError::InvalidFrame(_))));
    }

    #[test]
    fn test_label_is_optional() {
        let frame = Frame::new(Utc::now(), params(), vec![0.0; 10], vec![0.0; 10]).unwrap();
        assert_eq!(frame.label(), None);
        assert_eq!(frame.with_label("s1").label(), Some("s1"));
    }
}
