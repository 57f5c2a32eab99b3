//! Ride session lifecycle

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use contracts::{CompletedRide, RideInfo, TimeBase};
use tracing::info;

use crate::aggregator::TelemetryAggregator;
use crate::live::{LiveValues, DEFAULT_STALE_AFTER};
use crate::timeline::{timeline, TimelineReader};

/// Epoch seconds now.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// One ride: its parameters and the read side of its timeline.
#[derive(Debug, Clone)]
pub struct RideSession {
    info: RideInfo,
    reader: TimelineReader,
}

impl RideSession {
    /// Start a ride anchored at `start_time` (epoch seconds).
    ///
    /// The returned aggregator holds the timeline's only writer.
    pub fn begin(
        start_time: f64,
        duration_limit: f64,
        time_base: TimeBase,
    ) -> (Self, TelemetryAggregator) {
        let info = RideInfo {
            start_time,
            duration_limit,
            time_base,
        };
        let (writer, reader) = timeline();
        info!(start_time, duration_limit, time_base = ?time_base, "ride started");
        (Self { info, reader }, TelemetryAggregator::new(info, writer))
    }

    pub fn info(&self) -> &RideInfo {
        &self.info
    }

    pub fn reader(&self) -> &TimelineReader {
        &self.reader
    }

    pub fn elapsed_at(&self, epoch: f64) -> f64 {
        (epoch - self.info.start_time).max(0.0)
    }

    /// The ride has run for its full duration at `epoch`.
    pub fn is_over(&self, epoch: f64) -> bool {
        self.elapsed_at(epoch) >= self.info.duration_limit
    }

    /// Time left until the duration limit, measured from `epoch`.
    pub fn remaining(&self, epoch: f64) -> Duration {
        Duration::from_secs_f64((self.info.duration_limit - self.elapsed_at(epoch)).max(0.0))
    }

    /// Current value per metric at `epoch`.
    pub fn live_values(&self, epoch: f64) -> LiveValues {
        let now = self.elapsed_at(epoch);
        self.reader
            .read(|samples| LiveValues::from_samples(samples, now, DEFAULT_STALE_AFTER))
    }

    /// Hand the timeline over for recording.
    ///
    /// Call after the aggregator has finished; anything appended later is
    /// not part of the returned ride.
    pub fn finish(self, ended_at: f64) -> CompletedRide {
        let samples = self.reader.snapshot();
        info!(
            samples = samples.len(),
            elapsed = self.elapsed_at(ended_at),
            writer_closed = self.reader.is_closed(),
            "ride finished"
        );
        CompletedRide {
            info: self.info,
            ended_at,
            samples,
        }
    }
}
