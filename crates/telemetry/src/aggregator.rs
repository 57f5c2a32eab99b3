//! Telemetry Aggregator
//!
//! Turns per-device readings into timeline samples. It is the timeline's
//! only writer.

use std::collections::BTreeMap;

use contracts::{DeviceAddress, MetricKey, MetricSample, RideInfo, TaggedReading};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};

use crate::timeline::TimelineWriter;

/// Outcome of one observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Appended at this elapsed time
    Appended(f64),
    /// Timestamped before the ride started; dropped
    BeforeRideStart,
    /// Non-finite value or timestamp; dropped
    InvalidValue,
}

/// Counters kept by the aggregator. Rejections are counted here, never
/// propagated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub appended: u64,
    pub before_ride_start: u64,
    pub invalid_values: u64,
    pub per_device: BTreeMap<DeviceAddress, u64>,
}

impl AggregatorStats {
    pub fn rejected(&self) -> u64 {
        self.before_ride_start + self.invalid_values
    }
}

/// Round to the display precision of `key`: speed to 0.1, the rest to integers.
/// Halves go to the even neighbour.
pub fn normalize(key: MetricKey, value: f64) -> f64 {
    let scale = 10f64.powi(key.precision() as i32);
    (value * scale).round_ties_even() / scale
}

pub struct TelemetryAggregator {
    info: RideInfo,
    writer: TimelineWriter,
    stats: AggregatorStats,
}

impl TelemetryAggregator {
    pub(crate) fn new(info: RideInfo, writer: TimelineWriter) -> Self {
        Self {
            info,
            writer,
            stats: AggregatorStats::default(),
        }
    }

    pub fn info(&self) -> &RideInfo {
        &self.info
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Timestamp one reading against the ride start and append it.
    pub fn observe(
        &mut self,
        address: &DeviceAddress,
        key: MetricKey,
        value: f64,
        device_timestamp: f64,
    ) -> Observation {
        if !value.is_finite() || !device_timestamp.is_finite() {
            self.stats.invalid_values += 1;
            observability::record_sample_rejected("invalid_value");
            trace!(address = %address, key = %key, "non-finite reading dropped");
            return Observation::InvalidValue;
        }

        let elapsed = device_timestamp - self.info.start_time;
        if elapsed < 0.0 {
            self.stats.before_ride_start += 1;
            observability::record_sample_rejected("before_ride_start");
            trace!(address = %address, key = %key, elapsed, "reading before ride start dropped");
            return Observation::BeforeRideStart;
        }

        let len = self
            .writer
            .push(MetricSample::single(elapsed, key, normalize(key, value)));

        self.stats.appended += 1;
        *self.stats.per_device.entry(address.clone()).or_default() += 1;
        observability::record_sample_appended(key);
        observability::record_timeline_len(len);

        Observation::Appended(elapsed)
    }

    /// Consume readings until every sender is gone, then close the timeline.
    #[instrument(name = "telemetry_aggregator", skip_all, fields(start_time = self.info.start_time))]
    pub async fn run(mut self, mut rx: mpsc::Receiver<TaggedReading>) -> AggregatorStats {
        info!("aggregator started");

        while let Some(TaggedReading { address, reading }) = rx.recv().await {
            self.observe(&address, reading.key, reading.value, reading.device_timestamp);
        }

        debug!(samples = self.writer.len(), "reading channel closed");
        info!(
            appended = self.stats.appended,
            rejected = self.stats.rejected(),
            "aggregator finished"
        );
        self.stats
    }
}
