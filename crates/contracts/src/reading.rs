//! Raw device readings and canonical metric samples.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{DeviceAddress, MetricKey};

/// One value produced by a device, before ride-relative timestamping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub key: MetricKey,
    pub value: f64,
    /// Epoch seconds on the ride clock.
    pub device_timestamp: f64,
}

impl RawReading {
    pub fn new(key: MetricKey, value: f64, device_timestamp: f64) -> Self {
        Self {
            key,
            value,
            device_timestamp,
        }
    }
}

/// A reading tagged with the handle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedReading {
    pub address: DeviceAddress,
    pub reading: RawReading,
}

/// Canonical timeline entry.
///
/// `values` holds only the keys that changed; the aggregator emits one key
/// per sample. Serialises flat: `{"timestamp": 12.0, "power": 210.0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Ride-elapsed seconds, or epoch seconds once rebased for the wire.
    pub timestamp: f64,
    #[serde(flatten)]
    pub values: BTreeMap<MetricKey, f64>,
}

impl MetricSample {
    pub fn single(timestamp: f64, key: MetricKey, value: f64) -> Self {
        Self {
            timestamp,
            values: BTreeMap::from([(key, value)]),
        }
    }

    pub fn get(&self, key: MetricKey) -> Option<f64> {
        self.values.get(&key).copied()
    }
}
