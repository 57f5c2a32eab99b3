//! JsonLinesRecorder - writes a completed ride to disk
//!
//! Layout: one header line with the ride info, then one sample per line.
//!
//! ```text
//! {"ride":{"start_time":1700000000.0,"duration_limit":1800.0,"time_base":"elapsed"},"ended_at":1700000600.0,"samples":2}
//! {"timestamp":1.0,"power":210.0}
//! {"timestamp":1.5,"heart_rate":128.0}
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use contracts::{CompletedRide, ContractError, RideInfo, RideRecorder};
use serde::Serialize;
use tracing::{debug, info, instrument};

#[derive(Serialize)]
struct Header<'a> {
    ride: &'a RideInfo,
    ended_at: f64,
    samples: usize,
}

/// Recorder that writes `<output_dir>/<start>[_<name>].jsonl`
#[derive(Debug, Clone)]
pub struct JsonLinesRecorder {
    output_dir: PathBuf,
    ride_name: Option<String>,
}

impl JsonLinesRecorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ride_name: None,
        }
    }

    pub fn with_ride_name(mut self, name: impl Into<String>) -> Self {
        self.ride_name = Some(name.into());
        self
    }

    fn file_path(&self, ride: &CompletedRide) -> PathBuf {
        let secs = ride.info.start_time.floor() as i64;
        let started = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();
        let mut stem = started.format("%Y%m%d_%H%M%S").to_string();
        if let Some(name) = &self.ride_name {
            let clean: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
                .collect();
            stem.push('_');
            stem.push_str(&clean);
        }
        self.output_dir.join(format!("{stem}.jsonl"))
    }

    fn encode(ride: &CompletedRide) -> Result<String, ContractError> {
        let header = Header {
            ride: &ride.info,
            ended_at: ride.ended_at,
            samples: ride.samples.len(),
        };
        let mut out = serde_json::to_string(&header)
            .map_err(|e| ContractError::recorder(e.to_string()))?;
        out.push('\n');
        for sample in &ride.samples {
            let line =
                serde_json::to_string(sample).map_err(|e| ContractError::recorder(e.to_string()))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }
}

impl RideRecorder for JsonLinesRecorder {
    #[instrument(name = "jsonl_record", skip(self, ride), fields(samples = ride.samples.len()))]
    async fn record(&mut self, ride: &CompletedRide) -> Result<String, ContractError> {
        if ride.samples.is_empty() {
            return Err(ContractError::recorder("no samples to record"));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.file_path(ride);
        let body = Self::encode(ride)?;
        debug!(bytes = body.len(), "ride encoded");
        tokio::fs::write(&path, body).await?;

        let location = path.display().to_string();
        info!(path = %location, "ride recorded");
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{MetricKey, MetricSample, TimeBase};

    fn ride(samples: Vec<MetricSample>) -> CompletedRide {
        CompletedRide {
            info: RideInfo {
                start_time: 1_700_000_000.0,
                duration_limit: 1800.0,
                time_base: TimeBase::Elapsed,
            },
            ended_at: 1_700_000_600.0,
            samples,
        }
    }

    #[tokio::test]
    async fn test_record_writes_header_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = JsonLinesRecorder::new(dir.path()).with_ride_name("morning ride");

        let path = recorder
            .record(&ride(vec![
                MetricSample::single(1.0, MetricKey::Power, 210.0),
                MetricSample::single(1.5, MetricKey::HeartRate, 128.0),
            ]))
            .await
            .unwrap();

        assert!(path.ends_with("20231114_221320_morning_ride.jsonl"));
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with(r#"{"ride":"#));
        assert_eq!(lines[1], r#"{"timestamp":1.0,"power":210.0}"#);
        assert_eq!(lines[2], r#"{"timestamp":1.5,"heart_rate":128.0}"#);
    }

    #[tokio::test]
    async fn test_empty_ride_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = JsonLinesRecorder::new(dir.path());

        let err = recorder.record(&ride(Vec::new())).await.unwrap_err();
        assert!(err.to_string().contains("no samples to record"));
    }
}
