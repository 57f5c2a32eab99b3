//! Ride-level descriptors shared by producer and viewers.

use serde::{Deserialize, Serialize};

use crate::MetricSample;

/// Which clock the `timestamp` of outgoing sample frames is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBase {
    /// Seconds since ride start.
    #[default]
    Elapsed,
    /// Absolute epoch seconds.
    Epoch,
}

/// Ride parameters announced to every viewer before replay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RideInfo {
    /// Wall-clock anchor, epoch seconds.
    pub start_time: f64,
    /// Seconds; bounds chart x-axis and the viewer retention window.
    pub duration_limit: f64,
    #[serde(default)]
    pub time_base: TimeBase,
}

impl RideInfo {
    /// Convert a wire timestamp into ride-elapsed seconds.
    pub fn to_elapsed(&self, timestamp: f64) -> f64 {
        match self.time_base {
            TimeBase::Elapsed => timestamp,
            TimeBase::Epoch => timestamp - self.start_time,
        }
    }

    /// Convert ride-elapsed seconds into a wire timestamp.
    pub fn to_wire(&self, elapsed: f64) -> f64 {
        match self.time_base {
            TimeBase::Elapsed => elapsed,
            TimeBase::Epoch => elapsed + self.start_time,
        }
    }
}

/// A stopped ride, handed to a [`RideRecorder`](crate::RideRecorder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRide {
    pub info: RideInfo,
    /// Epoch seconds.
    pub ended_at: f64,
    /// Timeline in append order.
    pub samples: Vec<MetricSample>,
}

impl CompletedRide {
    pub fn elapsed(&self) -> f64 {
        (self.ended_at - self.info.start_time).max(0.0)
    }
}
