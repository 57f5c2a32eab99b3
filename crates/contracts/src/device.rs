//! Device-side types: capabilities, metric keys, connection states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::DeviceAddress;

/// What a physical sensor is configured to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Power,
    Speed,
    Cadence,
    HeartRate,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Power,
        Capability::Speed,
        Capability::Cadence,
        Capability::HeartRate,
    ];

    /// The metric a device of this capability reports first and foremost.
    ///
    /// Devices may report secondary keys as well (a smart trainer configured
    /// as `Power` also reports speed and cadence).
    pub fn metric_key(self) -> MetricKey {
        match self {
            Capability::Power => MetricKey::Power,
            Capability::Speed => MetricKey::Speed,
            Capability::Cadence => MetricKey::Cadence,
            Capability::HeartRate => MetricKey::HeartRate,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.metric_key().as_str()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical metric keys carried in samples and wire frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    Power,
    Speed,
    Cadence,
    HeartRate,
}

impl MetricKey {
    pub const ALL: [MetricKey; 4] = [
        MetricKey::Power,
        MetricKey::Speed,
        MetricKey::Cadence,
        MetricKey::HeartRate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKey::Power => "power",
            MetricKey::Speed => "speed",
            MetricKey::Cadence => "cadence",
            MetricKey::HeartRate => "heart_rate",
        }
    }

    /// Display unit.
    pub fn unit(self) -> &'static str {
        match self {
            MetricKey::Power => "W",
            MetricKey::Speed => "km/h",
            MetricKey::Cadence => "RPM",
            MetricKey::HeartRate => "BPM",
        }
    }

    /// Decimal places kept when a raw value is normalised.
    pub fn precision(self) -> u32 {
        match self {
            MetricKey::Speed => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power" => Ok(MetricKey::Power),
            "speed" => Ok(MetricKey::Speed),
            "cadence" => Ok(MetricKey::Cadence),
            "heart_rate" => Ok(MetricKey::HeartRate),
            other => Err(format!("unknown metric key '{other}'")),
        }
    }
}

/// One device the ride should connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub address: DeviceAddress,
    pub capability: Capability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DeviceSpec {
    pub fn new(address: impl Into<DeviceAddress>, capability: Capability) -> Self {
        Self {
            address: address.into(),
            capability,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Human label: configured name, else the address.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.address.as_str())
    }
}

/// Lifecycle state of one sensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    AwaitingDevice,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::AwaitingDevice => "awaiting_device",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }

    /// `Connected` or `Failed`: the outcome of a listen request is known.
    pub fn is_settled(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed state change of a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub address: DeviceAddress,
    pub capability: Capability,
    pub previous: Option<ConnectionState>,
    pub current: ConnectionState,
    /// Reconnection attempt number (1-based), when the transition belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StateTransition {
    /// A connected device was lost.
    pub fn is_fresh_loss(&self) -> bool {
        self.previous == Some(ConnectionState::Connected)
            && self.current == ConnectionState::Disconnected
    }

    /// A reconnection attempt failed.
    pub fn is_repeated_failure(&self) -> bool {
        self.previous == Some(ConnectionState::Connecting)
            && self.current == ConnectionState::Disconnected
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.previous {
            Some(prev) => write!(f, "{} [{}]: {} -> {}", self.address, self.capability, prev, self.current)?,
            None => write!(f, "{} [{}]: {}", self.address, self.capability, self.current)?,
        }
        if let Some(attempt) = self.attempt {
            write!(f, " (attempt {attempt})")?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}
