use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{EisError, EisResult};

/// Bookkeeping of a multi-sensor run. Owned by the sequencer alone.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplexState {
    sensors: Vec<String>,
    frames_per_condition: usize,
    condition: Option<String>,
    completed: BTreeSet<(String, String)>,
    total_captures: u64,
}

impl MultiplexState {
    pub fn new(sensors: Vec<String>, frames_per_condition: usize) -> EisResult<Self> {
        if sensors.is_empty() {
            return Err(EisError::InvalidSensors("at least one sensor is required".to_string()));
        }
        if let Some(blank) = sensors.iter().position(|s| s.trim().is_empty()) {
            return Err(EisError::InvalidSensors(format!("sensor #{} has an empty label", blank + 1)));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = sensors.iter().find(|s| !seen.insert(s.as_str())) {
            return Err(EisError::InvalidSensors(format!("duplicate sensor {:?}", dup)));
        }
        if frames_per_condition == 0 {
            return Err(EisError::InvalidSensors(
                "frames per condition must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            sensors,
            frames_per_condition,
            condition: None,
            completed: BTreeSet::new(),
            total_captures: 0,
        })
    }

    pub fn sensors(&self) -> &[String] {
        &self.sensors
    }

    pub fn frames_per_condition(&self) -> usize {
        self.frames_per_condition
    }

    /// Sensor the next trigger belongs to.
    pub fn current_sensor(&self) -> &str {
        let n = self.sensors.len() as u64;
        &self.sensors[(self.total_captures % n) as usize]
    }

    /// Full passes over the sensor list so far.
    pub fn cycle(&self) -> u64 {
        self.total_captures / self.sensors.len() as u64
    }

    pub fn total_captures(&self) -> u64 {
        self.total_captures
    }

    pub fn record_capture(&mut self) {
        self.total_captures += 1;
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn set_condition(&mut self, condition: impl Into<String>) {
        self.condition = Some(condition.into());
    }

    pub fn mark_complete(&mut self, sensor: &str) {
        if let Some(condition) = &self.condition {
            self.completed.insert((sensor.to_string(), condition.clone()));
        }
    }

    pub fn is_complete(&self, sensor: &str, condition: &str) -> bool {
        self.completed
            .contains(&(sensor.to_string(), condition.to_string()))
    }

    /// Every sensor has a stored average for the current condition.
    pub fn condition_complete(&self) -> bool {
        match &self.condition {
            Some(condition) => self.sensors.iter().all(|s| self.is_complete(s, condition)),
            None => false,
        }
    }
}

/// Titration progress as published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TitrationState {
    AwaitingConcentration,
    AwaitingTrigger { sensor: String },
    Recording { sensor: String, frames: usize },
    AveragingAndSaving { sensor: String },
    Finished,
    Aborted,
}

/// In-vivo progress as published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InVivoState {
    Idle,
    AwaitingTrigger { sensor: String },
    CaptureOne { sensor: String, cycle: u64 },
    TimedOut,
    Aborted,
}

/// How a sequencer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceOutcome {
    Finished,
    TimedOut,
    Aborted,
}
