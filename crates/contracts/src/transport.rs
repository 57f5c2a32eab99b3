//! DeviceTransport / DeviceLink - device-protocol boundary
//!
//! The connection manager drives handles through these traits only, so it
//! works the same over Bluetooth LE, a simulator, or a scripted test double.

use crate::{DeviceSpec, LinkError, RawReading};

/// An established connection to one device.
#[trait_variant::make(DeviceLink: Send)]
pub trait LocalDeviceLink {
    /// Suspend until the device produces its next reading.
    ///
    /// Readings come back in the order the device produced them. No read
    /// timeout applies; a quiet device is not an error.
    ///
    /// # Errors
    /// `LinkError::Dropped` when the connection is lost unexpectedly.
    async fn next_reading(&mut self) -> Result<RawReading, LinkError>;

    /// Release device-level resources. Must be safe to call on a dropped link.
    async fn disconnect(&mut self) -> Result<(), LinkError>;
}

/// Discovers and connects devices for the connection manager.
///
/// One transport is shared by every handle task, so implementations must
/// tolerate concurrent calls for different devices.
#[trait_variant::make(DeviceTransport: Send)]
pub trait LocalDeviceTransport {
    type Link: DeviceLink + 'static;

    /// Suspend until the device is visible to the transport.
    ///
    /// The caller bounds this with its own deadline.
    async fn discover(&self, spec: &DeviceSpec) -> Result<(), LinkError>;

    /// Open a link to a discovered device.
    async fn connect(&self, spec: &DeviceSpec) -> Result<Self::Link, LinkError>;
}
