//! # Observability
//!
//! 可观测性模块：Tracing + Prometheus 指标。
//!
//! ## 功能
//!
//! - Tracing 初始化 (JSON/Pretty/Compact 格式)
//! - Prometheus 指标导出
//! - `record_*` 指标记录，供 connection / telemetry / distribution 调用
//! - 骑行统计汇总 (结束时打印)
//!
//! ## 使用示例
//!
//! ```ignore
//! // 初始化
//! observability::init_with_config(ObservabilityConfig::for_verbosity(1, false))?;
//!
//! // 记录样本指标
//! observability::record_sample_appended(MetricKey::Power);
//! ```

pub mod metrics;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Re-exports
pub use crate::metrics::{
    record_connection_transition, record_frame_sent, record_reading_dropped,
    record_reading_received, record_replay_completed, record_sample_appended,
    record_sample_rejected, record_timeline_len, record_viewer_connected,
    record_viewer_disconnected, RideMetricsAggregator, RideMetricsSummary, RunningStats,
    StatsSummary,
};

/// 可观测性配置
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// 日志格式
    pub log_format: LogFormat,
    /// Prometheus 端口 (None = 禁用)
    pub metrics_port: Option<u16>,
    /// 未设置 `RUST_LOG` 时的默认过滤级别
    pub default_filter: String,
    /// 忽略 `RUST_LOG`，只输出 warn 及以上
    pub quiet: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_port: None,
            default_filter: "info".to_string(),
            quiet: false,
        }
    }
}

impl ObservabilityConfig {
    /// `-v` 次数对应级别：0 = info，1 = debug，更多 = trace
    pub fn for_verbosity(verbose: u8, quiet: bool) -> Self {
        let level = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        Self {
            default_filter: level.to_string(),
            quiet,
            ..Default::default()
        }
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        if self.quiet {
            return EnvFilter::new("warn");
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON 结构化日志
    Json,
    /// 人类可读 (多行)
    #[default]
    Pretty,
    /// 单行紧凑
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// 初始化可观测性（Tracing + 可选 Prometheus）
pub fn init_with_config(config: ObservabilityConfig) -> Result<()> {
    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    if let Some(port) = config.metrics_port {
        init_metrics_only(port)?;
    }

    tracing::debug!(log_format = ?config.log_format, "Observability initialized");
    Ok(())
}

/// 仅初始化 Prometheus 导出器，监听 `0.0.0.0:<port>`
pub fn init_metrics_only(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .with_context(|| format!("Failed to install Prometheus recorder on port {port}"))?;

    tracing::info!(port, "Prometheus metrics endpoint initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_filter() {
        assert_eq!(ObservabilityConfig::for_verbosity(0, false).default_filter, "info");
        assert_eq!(ObservabilityConfig::for_verbosity(1, false).default_filter, "debug");
        assert_eq!(ObservabilityConfig::for_verbosity(5, false).default_filter, "trace");

        let quiet = ObservabilityConfig::for_verbosity(2, true);
        assert!(quiet.quiet);
        assert_eq!(quiet.metrics_port, None);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
