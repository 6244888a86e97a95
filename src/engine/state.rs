use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Acquisition loop states
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcquisitionState {
    #[default]
    Idle,
    Arming,
    Capturing,
    /// Frame captured, being handed to the frame buffer
    Draining,
    Aborted,
    Faulted {
        reason: String,
    },
}

impl AcquisitionState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &AcquisitionState) -> bool {
        use AcquisitionState::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Arming) |
            (Idle, Aborted) |

            // From Arming
            (Arming, Capturing) |
            (Arming, Faulted { .. }) |

            // From Capturing
            (Capturing, Draining) |
            (Capturing, Faulted { .. }) |

            // From Draining
            (Draining, Idle) |
            (Draining, Aborted) |

            // Recovery
            (Aborted, Idle) |
            (Faulted { .. }, Idle)
        )
    }

    /// Get human-readable state name
    pub fn name(&self) -> &str {
        match self {
            Self::Idle => "Idle",
            Self::Arming => "Arming",
            Self::Capturing => "Capturing",
            Self::Draining => "Draining",
            Self::Aborted => "Aborted",
            Self::Faulted { .. } => "Faulted",
        }
    }

    /// Move to `target`, refusing transitions the state machine does not allow.
    pub fn transition_to(&mut self, target: AcquisitionState) -> Result<()> {
        if !self.can_transition_to(&target) {
            return Err(anyhow!(
                "Invalid state transition: {} -> {}",
                self.name(),
                target.name()
            ));
        }
        *self = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_cycle() {
        let mut state = AcquisitionState::Idle;
        for next in [
            AcquisitionState::Arming,
            AcquisitionState::Capturing,
            AcquisitionState::Draining,
            AcquisitionState::Idle,
        ] {
            state.transition_to(next).unwrap();
        }
        assert_eq!(state, AcquisitionState::Idle);
    }

    #[test]
    fn test_cannot_skip_arming() {
        let idle = AcquisitionState::Idle;
        assert!(!idle.can_transition_to(&AcquisitionState::Capturing));
        assert!(!idle.can_transition_to(&AcquisitionState::Draining));
    }

    #[test]
    fn test_fault_recovery() {
        let mut state = AcquisitionState::Arming;
        state
            .transition_to(AcquisitionState::Faulted {
                reason: "timeout".to_string(),
            })
            .unwrap();
        assert_eq!(state.name(), "Faulted");
        assert!(state.transition_to(AcquisitionState::Arming).is_err());
        state.transition_to(AcquisitionState::Idle).unwrap();
    }
}
