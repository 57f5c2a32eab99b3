//! Current value per metric, assembled by scanning the timeline backward.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use contracts::{MetricKey, MetricSample};

/// Age after which a value counts as stale
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveValue {
    pub value: f64,
    /// Elapsed time of the sample the value came from
    pub elapsed: f64,
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveValues {
    values: BTreeMap<MetricKey, LiveValue>,
}

impl LiveValues {
    /// Latest value per key as of `now_elapsed`.
    ///
    /// A stale cadence reads 0 (the rider stopped pedalling); other stale
    /// keys keep their last value.
    pub fn from_samples(samples: &[MetricSample], now_elapsed: f64, stale_after: Duration) -> Self {
        let mut values = BTreeMap::new();

        for sample in samples.iter().rev() {
            for (key, value) in &sample.values {
                values.entry(*key).or_insert_with(|| {
                    let stale = now_elapsed - sample.timestamp > stale_after.as_secs_f64();
                    let value = if stale && *key == MetricKey::Cadence {
                        0.0
                    } else {
                        *value
                    };
                    LiveValue {
                        value,
                        elapsed: sample.timestamp,
                        stale,
                    }
                });
            }
            if values.len() == MetricKey::ALL.len() {
                break;
            }
        }

        Self { values }
    }

    pub fn get(&self, key: MetricKey) -> Option<f64> {
        self.values.get(&key).map(|v| v.value)
    }

    pub fn entry(&self, key: MetricKey) -> Option<&LiveValue> {
        self.values.get(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricKey, &LiveValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }
}

impl fmt::Display for LiveValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.values.is_empty() {
            return write!(f, "no data");
        }
        let mut first = true;
        for (key, live) in &self.values {
            if !first {
                write!(f, " | ")?;
            }
            first = false;
            write!(
                f,
                "{key} {:.*} {}",
                key.precision() as usize,
                live.value,
                key.unit()
            )?;
            if live.stale {
                write!(f, " (stale)")?;
            }
        }
        Ok(())
    }
}
