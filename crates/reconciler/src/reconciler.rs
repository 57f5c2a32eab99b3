//! Two-phase reconciliation of replay and live frames.
//!
//! ```text
//!            hello
//!              |
//!   Replay: buffer samples, no drawing
//!              |  replay_end, or replay_idle of silence
//!              v
//!   stable sort by elapsed, apply all, Redraw
//!              |
//!   Live: apply each sample as it comes, Point update
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use contracts::{MetricKey, RideInfo, WireFrame};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::series::{ChartSeries, PointKind};

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Chart window in seconds; replaced by the ride's limit on hello
    pub duration_limit: f64,
    /// Points closer than this (seconds) are merged
    pub merge_tolerance: f64,
    /// Silence that ends the replay phase without a marker
    pub replay_idle: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            duration_limit: 1800.0,
            merge_tolerance: 1.0,
            replay_idle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Replay,
    Live,
}

/// What a chart needs to do after a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChartUpdate {
    /// Replay applied; redraw every series
    Redraw,
    /// One live point inserted or merged
    Point {
        key: MetricKey,
        elapsed: f64,
        value: f64,
        kind: PointKind,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    /// Sample values applied to a series (inserted or merged)
    pub applied: u64,
    pub merged: u64,
    pub out_of_window: u64,
    pub evicted: u64,
    /// Replay phases completed
    pub replays: u64,
}

#[derive(Debug, Clone, Copy)]
struct Buffered {
    elapsed: f64,
    key: MetricKey,
    value: f64,
}

/// Client-side state for one viewer
#[derive(Debug)]
pub struct Reconciler {
    config: ReconcilerConfig,
    ride: Option<RideInfo>,
    phase: Phase,
    buffer: Vec<Buffered>,
    series: BTreeMap<MetricKey, ChartSeries>,
    last_message: Option<Instant>,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            ride: None,
            phase: Phase::Replay,
            buffer: Vec::new(),
            series: BTreeMap::new(),
            last_message: None,
            stats: ReconcilerStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn ride(&self) -> Option<&RideInfo> {
        self.ride.as_ref()
    }

    pub fn duration_limit(&self) -> f64 {
        self.config.duration_limit
    }

    pub fn stats(&self) -> &ReconcilerStats {
        &self.stats
    }

    pub fn series(&self, key: MetricKey) -> Option<&ChartSeries> {
        self.series.get(&key)
    }

    /// `(elapsed, value)` pairs of one series, in order.
    pub fn points(&self, key: MetricKey) -> Vec<(f64, f64)> {
        self.series
            .get(&key)
            .map(|s| s.points().iter().map(|p| (p.elapsed, p.value)).collect())
            .unwrap_or_default()
    }

    /// Latest plotted value per key.
    pub fn latest(&self) -> BTreeMap<MetricKey, f64> {
        self.series
            .iter()
            .filter_map(|(key, s)| s.points().last().map(|p| (*key, p.value)))
            .collect()
    }

    /// Feed one frame received at `now`.
    pub fn ingest(&mut self, frame: WireFrame, now: Instant) -> Vec<ChartUpdate> {
        self.last_message = Some(now);

        match frame {
            WireFrame::Hello { ride } => {
                self.start_replay(ride);
                Vec::new()
            }
            WireFrame::ReplayEnd { replay_end } => {
                if self.phase != Phase::Replay {
                    return Vec::new();
                }
                debug!(expected = replay_end, buffered = self.buffer.len(), "replay marker");
                vec![self.finish_replay()]
            }
            WireFrame::Sample(sample) => {
                let elapsed = self.to_elapsed(sample.timestamp);
                let values = sample.values.into_iter();
                match self.phase {
                    Phase::Replay => {
                        self.buffer
                            .extend(values.map(|(key, value)| Buffered { elapsed, key, value }));
                        Vec::new()
                    }
                    Phase::Live => values
                        .filter_map(|(key, value)| self.apply(key, elapsed, value))
                        .collect(),
                }
            }
        }
    }

    /// End the replay phase if it has been silent for `replay_idle`.
    pub fn poll_idle(&mut self, now: Instant) -> Vec<ChartUpdate> {
        match self.idle_deadline() {
            Some(deadline) if now >= deadline => {
                debug!(buffered = self.buffer.len(), "replay ended by silence");
                vec![self.finish_replay()]
            }
            _ => Vec::new(),
        }
    }

    /// When the replay phase ends by silence, if nothing else arrives.
    pub fn idle_deadline(&self) -> Option<Instant> {
        match (self.phase, self.last_message) {
            (Phase::Replay, Some(at)) => Some(at + self.config.replay_idle),
            _ => None,
        }
    }

    /// Back to the replay phase, e.g. after reconnecting.
    fn start_replay(&mut self, ride: RideInfo) {
        self.config.duration_limit = ride.duration_limit;
        self.ride = Some(ride);
        self.phase = Phase::Replay;
        self.buffer.clear();
        self.series.clear();
        debug!(duration_limit = ride.duration_limit, time_base = ?ride.time_base, "replay started");
    }

    fn finish_replay(&mut self) -> ChartUpdate {
        let mut buffered = std::mem::take(&mut self.buffer);
        // Stable: equal timestamps keep arrival order
        buffered.sort_by(|a, b| a.elapsed.total_cmp(&b.elapsed));
        for entry in buffered {
            self.apply(entry.key, entry.elapsed, entry.value);
        }
        self.phase = Phase::Live;
        self.stats.replays += 1;
        ChartUpdate::Redraw
    }

    fn apply(&mut self, key: MetricKey, elapsed: f64, value: f64) -> Option<ChartUpdate> {
        let (limit, tolerance) = (self.config.duration_limit, self.config.merge_tolerance);
        let series = self
            .series
            .entry(key)
            .or_insert_with(|| ChartSeries::new(limit, tolerance));

        let Some(applied) = series.apply(elapsed, value) else {
            self.stats.out_of_window += 1;
            observability::record_sample_rejected("out_of_window");
            trace!(key = %key, elapsed, "sample outside chart window");
            return None;
        };

        self.stats.applied += 1;
        if applied.kind == PointKind::Merged {
            self.stats.merged += 1;
        }
        if applied.evicted.is_some() {
            self.stats.evicted += 1;
        }
        if !applied.is_retained() {
            trace!(key = %key, elapsed, "sample trimmed on arrival");
            return None;
        }

        Some(ChartUpdate::Point {
            key,
            elapsed: applied.elapsed,
            value,
            kind: applied.kind,
        })
    }

    /// Before any hello, timestamps are taken as elapsed seconds.
    fn to_elapsed(&self, timestamp: f64) -> f64 {
        self.ride
            .map_or(timestamp, |ride| ride.to_elapsed(timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{MetricSample, TimeBase};

    fn hello(duration_limit: f64, time_base: TimeBase) -> WireFrame {
        WireFrame::Hello {
            ride: RideInfo {
                start_time: 1_700_000_000.0,
                duration_limit,
                time_base,
            },
        }
    }

    fn power(t: f64, v: f64) -> WireFrame {
        WireFrame::Sample(MetricSample::single(t, MetricKey::Power, v))
    }

    #[test]
    fn test_replay_then_live_ordering() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());

        reconciler.ingest(hello(1800.0, TimeBase::Elapsed), now);
        for frame in [power(20.0, 2.0), power(5.0, 1.0), power(15.0, 3.0)] {
            assert!(reconciler.ingest(frame, now).is_empty());
        }
        assert!(reconciler.points(MetricKey::Power).is_empty());

        let updates = reconciler.ingest(WireFrame::ReplayEnd { replay_end: 3 }, now);
        assert_eq!(updates, vec![ChartUpdate::Redraw]);

        let updates = reconciler.ingest(power(25.0, 4.0), now);
        assert_eq!(
            updates,
            vec![ChartUpdate::Point {
                key: MetricKey::Power,
                elapsed: 25.0,
                value: 4.0,
                kind: PointKind::Inserted,
            }]
        );
        assert_eq!(
            reconciler.points(MetricKey::Power),
            vec![(5.0, 1.0), (15.0, 3.0), (20.0, 2.0), (25.0, 4.0)]
        );
    }

    #[test]
    fn test_duplicate_sample_merges() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        reconciler.ingest(hello(1800.0, TimeBase::Elapsed), now);
        reconciler.ingest(WireFrame::ReplayEnd { replay_end: 0 }, now);

        reconciler.ingest(power(10.0, 200.0), now);
        let updates = reconciler.ingest(power(10.0, 200.0), now);

        assert!(matches!(
            updates[..],
            [ChartUpdate::Point { kind: PointKind::Merged, .. }]
        ));
        assert_eq!(reconciler.points(MetricKey::Power).len(), 1);
        assert_eq!(reconciler.stats().merged, 1);
    }

    #[test]
    fn test_window_rejects_outside_samples() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        reconciler.ingest(hello(60.0, TimeBase::Elapsed), now);
        reconciler.ingest(power(61.0, 1.0), now);
        reconciler.ingest(power(-1.0, 1.0), now);
        reconciler.ingest(power(30.0, 1.0), now);
        reconciler.ingest(WireFrame::ReplayEnd { replay_end: 3 }, now);

        assert_eq!(reconciler.points(MetricKey::Power), vec![(30.0, 1.0)]);
        assert_eq!(reconciler.stats().out_of_window, 2);
    }

    #[test]
    fn test_epoch_timestamps_converted() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        reconciler.ingest(hello(1800.0, TimeBase::Epoch), now);
        reconciler.ingest(power(1_700_000_012.0, 250.0), now);
        reconciler.ingest(WireFrame::ReplayEnd { replay_end: 1 }, now);

        assert_eq!(reconciler.points(MetricKey::Power), vec![(12.0, 250.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_ends_replay() {
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        let start = Instant::now();
        reconciler.ingest(hello(1800.0, TimeBase::Elapsed), start);
        reconciler.ingest(power(3.0, 150.0), start);

        assert_eq!(reconciler.idle_deadline(), Some(start + Duration::from_secs(1)));
        assert!(reconciler.poll_idle(start + Duration::from_millis(900)).is_empty());
        assert_eq!(
            reconciler.poll_idle(start + Duration::from_secs(1)),
            vec![ChartUpdate::Redraw]
        );
        assert_eq!(reconciler.phase(), Phase::Live);
        assert_eq!(reconciler.idle_deadline(), None);
        assert_eq!(reconciler.points(MetricKey::Power), vec![(3.0, 150.0)]);
    }

    #[test]
    fn test_hello_restarts_replay() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        reconciler.ingest(hello(1800.0, TimeBase::Elapsed), now);
        reconciler.ingest(power(1.0, 100.0), now);
        reconciler.ingest(WireFrame::ReplayEnd { replay_end: 1 }, now);
        assert_eq!(reconciler.phase(), Phase::Live);

        reconciler.ingest(hello(1800.0, TimeBase::Elapsed), now);
        assert_eq!(reconciler.phase(), Phase::Replay);
        reconciler.ingest(power(1.0, 100.0), now);
        reconciler.ingest(power(2.0, 110.0), now);
        reconciler.ingest(WireFrame::ReplayEnd { replay_end: 2 }, now);

        assert_eq!(reconciler.points(MetricKey::Power), vec![(1.0, 100.0), (2.0, 110.0)]);
        assert_eq!(reconciler.stats().replays, 2);
    }

    #[test]
    fn test_live_point_trimmed_on_arrival_is_not_drawn() {
        let now = Instant::now();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        reconciler.ingest(hello(3.0, TimeBase::Elapsed), now);
        for t in [1.0, 2.0, 3.0] {
            reconciler.ingest(power(t, t), now);
        }
        reconciler.ingest(WireFrame::ReplayEnd { replay_end: 3 }, now);

        let updates = reconciler.ingest(power(0.0, 9.0), now);
        assert!(updates.is_empty(), "{updates:?}");
        assert_eq!(
            reconciler.points(MetricKey::Power),
            vec![(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)]
        );
        assert_eq!(reconciler.stats().evicted, 1);
    }
}
