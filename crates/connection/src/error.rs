//! Connection manager error types

use contracts::DeviceAddress;
use thiserror::Error;

/// Connection manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Some devices did not reach `Connected` before the listen deadline.
    /// The ones in `connected` stay connected.
    #[error("discovery timeout after {waited_ms}ms: missing {missing:?}")]
    DiscoveryTimeout {
        waited_ms: u64,
        missing: Vec<DeviceAddress>,
        connected: Vec<DeviceAddress>,
    },

    /// No handle registered for this address
    #[error("unknown device {address}")]
    UnknownDevice { address: DeviceAddress },

    /// The handle's reading stream was already handed out
    #[error("readings for {address} already taken")]
    ReadingsTaken { address: DeviceAddress },

    /// Manager has been stopped
    #[error("connection manager stopped")]
    Stopped,
}

/// Connection Result alias
pub type Result<T> = std::result::Result<T, ManagerError>;
