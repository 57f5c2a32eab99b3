//! 骑行管线指标
//!
//! `record_*` 通过 `metrics` facade 上报，由已安装的 recorder 接收
//! (生产环境为 Prometheus，测试中为空)。
//! [`RideMetricsAggregator`] 在内存中保留同样的统计，用于骑行结束时的汇总。

use std::collections::BTreeMap;

use contracts::{ConnectionState, MetricKey, MetricSample, StateTransition};
use metrics::{counter, gauge, histogram};

/// 记录设备送达的一条原始读数
pub fn record_reading_received(address: &str, key: MetricKey) {
    counter!(
        "pedal_readings_total",
        "address" => address.to_string(),
        "metric" => key.as_str()
    )
    .increment(1);
}

/// 记录因读数通道已满而丢弃的读数
pub fn record_reading_dropped(address: &str) {
    counter!("pedal_readings_dropped_total", "address" => address.to_string()).increment(1);
}

/// 记录连接状态迁移
pub fn record_connection_transition(transition: &StateTransition) {
    counter!(
        "pedal_connection_transitions_total",
        "state" => transition.current.as_str()
    )
    .increment(1);

    if transition.is_fresh_loss() {
        counter!(
            "pedal_connection_losses_total",
            "address" => transition.address.to_string()
        )
        .increment(1);
    }

    if transition.current == ConnectionState::Failed {
        counter!(
            "pedal_connection_failures_total",
            "address" => transition.address.to_string()
        )
        .increment(1);
    }

    let connected = if transition.current == ConnectionState::Connected {
        1.0
    } else {
        0.0
    };
    gauge!(
        "pedal_device_connected",
        "address" => transition.address.to_string(),
        "capability" => transition.capability.as_str()
    )
    .set(connected);
}

/// 记录追加到骑行时间线的样本
pub fn record_sample_appended(key: MetricKey) {
    counter!("pedal_samples_appended_total", "metric" => key.as_str()).increment(1);
}

/// Record a rejected observation (`before_ride_start`, `invalid_value`, `out_of_window`)
pub fn record_sample_rejected(reason: &'static str) {
    counter!("pedal_samples_rejected_total", "reason" => reason).increment(1);
}

pub fn record_timeline_len(len: usize) {
    gauge!("pedal_timeline_samples").set(len as f64);
}

pub fn record_viewer_connected() {
    counter!("pedal_viewers_connected_total").increment(1);
    gauge!("pedal_viewers_active").increment(1.0);
}

pub fn record_viewer_disconnected(transport_lost: bool) {
    let cause = if transport_lost { "transport_lost" } else { "closed" };
    counter!("pedal_viewers_disconnected_total", "cause" => cause).increment(1);
    gauge!("pedal_viewers_active").decrement(1.0);
}

/// Record a frame delivery attempt; `phase` is `replay` or `live`
pub fn record_frame_sent(phase: &'static str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "pedal_frames_sent_total",
        "phase" => phase,
        "status" => status
    )
    .increment(1);
}

/// Record a finished replay burst
pub fn record_replay_completed(samples: usize, duration_ms: f64) {
    histogram!("pedal_replay_samples").record(samples as f64);
    histogram!("pedal_replay_duration_ms").record(duration_ms);
}

/// 骑行统计聚合器
///
/// 与 `record_*` 使用相同的事件，骑行结束时汇总。
#[derive(Debug, Clone, Default)]
pub struct RideMetricsAggregator {
    pub total_samples: u64,
    pub rejected_before_start: u64,
    pub invalid_values: u64,
    pub connection_losses: u64,
    pub connection_failures: u64,
    /// Largest elapsed timestamp seen
    pub last_elapsed: f64,
    pub per_metric: BTreeMap<MetricKey, RunningStats>,
}

impl RideMetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a complete timeline
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a MetricSample>) -> Self {
        let mut aggregator = Self::new();
        for sample in samples {
            aggregator.push_sample(sample);
        }
        aggregator
    }

    pub fn push_sample(&mut self, sample: &MetricSample) {
        self.total_samples += 1;
        self.last_elapsed = self.last_elapsed.max(sample.timestamp);
        for (key, value) in &sample.values {
            self.per_metric.entry(*key).or_default().push(*value);
        }
    }

    pub fn record_transition(&mut self, transition: &StateTransition) {
        if transition.is_fresh_loss() {
            self.connection_losses += 1;
        }
        if transition.current == ConnectionState::Failed {
            self.connection_failures += 1;
        }
    }

    pub fn summary(&self) -> RideMetricsSummary {
        RideMetricsSummary {
            total_samples: self.total_samples,
            duration_secs: self.last_elapsed,
            rejected_before_start: self.rejected_before_start,
            invalid_values: self.invalid_values,
            connection_losses: self.connection_losses,
            connection_failures: self.connection_failures,
            metrics: self
                .per_metric
                .iter()
                .map(|(key, stats)| (*key, StatsSummary::from(stats)))
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// 骑行汇总
#[derive(Debug, Clone, Default)]
pub struct RideMetricsSummary {
    pub total_samples: u64,
    pub duration_secs: f64,
    pub rejected_before_start: u64,
    pub invalid_values: u64,
    pub connection_losses: u64,
    pub connection_failures: u64,
    pub metrics: BTreeMap<MetricKey, StatsSummary>,
}

impl std::fmt::Display for RideMetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Ride Summary ===")?;
        let minutes = (self.duration_secs / 60.0).floor();
        let seconds = self.duration_secs - minutes * 60.0;
        writeln!(f, "Duration: {:.0}m {:02.0}s", minutes, seconds)?;
        writeln!(f, "Samples: {}", self.total_samples)?;
        if self.rejected_before_start > 0 || self.invalid_values > 0 {
            writeln!(
                f,
                "Rejected: {} before start, {} invalid",
                self.rejected_before_start, self.invalid_values
            )?;
        }
        writeln!(
            f,
            "Connection losses: {}, failures: {}",
            self.connection_losses, self.connection_failures
        )?;
        for (key, stats) in &self.metrics {
            writeln!(f, "{} ({}): {}", key, key.unit(), stats)?;
        }
        Ok(())
    }
}

/// Summary of one running statistic
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线均值/方差 (Welford 算法)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 样本方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::Capability;

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();

        stats.push(1.0);
        stats.push(2.0);
        stats.push(3.0);
        stats.push(4.0);
        stats.push(5.0);

        assert_eq!(stats.count(), 5);
        assert!((stats.mean() - 3.0).abs() < 1e-10);
        assert!((stats.min() - 1.0).abs() < 1e-10);
        assert!((stats.max() - 5.0).abs() < 1e-10);
        assert!((stats.variance() - 2.5).abs() < 1e-10);
    }

    #[test]
    fn test_aggregator_from_samples() {
        let power = [100.0, 200.0, 300.0, 250.0, 150.0];
        let samples: Vec<_> = power
            .iter()
            .enumerate()
            .map(|(i, p)| MetricSample::single(i as f64, MetricKey::Power, *p))
            .chain(std::iter::once(MetricSample::single(
                4.5,
                MetricKey::HeartRate,
                140.0,
            )))
            .collect();

        let summary = RideMetricsAggregator::from_samples(&samples).summary();

        assert_eq!(summary.total_samples, 6);
        assert_eq!(summary.duration_secs, 4.5);
        let power_stats = &summary.metrics[&MetricKey::Power];
        assert_eq!(power_stats.count, 5);
        assert_eq!(power_stats.max, 300.0);
        assert!((power_stats.mean - 200.0).abs() < 1e-10);
        assert_eq!(summary.metrics[&MetricKey::HeartRate].count, 1);
    }

    #[test]
    fn test_aggregator_counts_losses_and_failures() {
        let mut aggregator = RideMetricsAggregator::new();
        let mut transition = StateTransition {
            address: "trainer".into(),
            capability: Capability::Power,
            previous: Some(ConnectionState::Connected),
            current: ConnectionState::Disconnected,
            attempt: None,
            reason: None,
        };
        aggregator.record_transition(&transition);

        transition.previous = Some(ConnectionState::Disconnected);
        transition.current = ConnectionState::Failed;
        aggregator.record_transition(&transition);

        assert_eq!(aggregator.connection_losses, 1);
        assert_eq!(aggregator.connection_failures, 1);
    }

    #[test]
    fn test_summary_display() {
        let summary = RideMetricsSummary {
            total_samples: 100,
            duration_secs: 125.0,
            connection_losses: 2,
            metrics: BTreeMap::from([(
                MetricKey::Power,
                StatsSummary {
                    count: 100,
                    min: 90.0,
                    max: 310.0,
                    mean: 180.0,
                    std_dev: 20.0,
                },
            )]),
            ..Default::default()
        };

        let output = format!("{}", summary);
        assert!(output.contains("Duration: 2m 05s"));
        assert!(output.contains("Samples: 100"));
        assert!(output.contains("power (W): min=90.000"));
        assert!(!output.contains("Rejected"));
    }
}
