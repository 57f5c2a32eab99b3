//! # Contracts
//!
//! Shared data structures and traits for the ride telemetry pipeline.
//! Every stage crate depends on this crate; it depends on none of them.
//!
//! ## Time Model
//! - Devices stamp readings in epoch seconds (f64) on the ride clock
//! - The aggregator converts them to ride-elapsed seconds, the canonical ordering key

mod blueprint;
mod device;
mod device_address;
mod error;
mod frame;
mod reading;
mod ride;
mod sink;
mod transport;

pub use blueprint::*;
pub use device::*;
pub use device_address::DeviceAddress;
pub use error::*;
pub use frame::*;
pub use reading::*;
pub use ride::*;
pub use sink::*;
pub use transport::{DeviceLink, DeviceTransport, LocalDeviceLink, LocalDeviceTransport};
