//! # Connection Manager
//!
//! Device discovery, connection and reconnection.
//!
//! Responsibilities:
//! - One independent handle per configured device, each on its own task
//! - Listen-with-timeout: devices that never connect are reported, the rest keep running
//! - Bounded reconnection after a drop (attempts and backoff from [`ReconnectPolicy`])
//! - Per-handle reading streams with a drop policy when the consumer lags
//!
//! ## Usage Example
//!
//! ```ignore
//! use connection::{ConnectionManager, SimulatedClock, SimulatedTransport};
//!
//! let transport = SimulatedTransport::new(SimulatedClock::system());
//! let mut manager = ConnectionManager::new(transport);
//!
//! let mut session = manager.start_listening(specs, Duration::from_secs(10))?;
//! while let Some(transition) = session.next_transition().await {
//!     println!("{transition}");
//! }
//! let report = session.finish().await;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(256);
//! manager.merge_readings(tx);
//! while let Some(tagged) = rx.recv().await {
//!     // hand to the aggregator
//! }
//! ```

#[cfg(feature = "ble")]
mod ble;
mod channel;
mod config;
pub mod decode;
mod error;
mod handle;
mod manager;
mod simulated;

#[cfg(feature = "ble")]
pub use ble::{BleLink, BleTransport};
pub use config::{ConnectionMetrics, DropPolicy, MetricsSnapshot, ReadingChannelConfig, ReconnectPolicy};
pub use error::{ManagerError, Result};
pub use handle::HandleStatus;
pub use manager::{ConnectReport, ConnectionManager, ListenSession, ReadingStream};
pub use simulated::{SimulatedClock, SimulatedDevice, SimulatedLink, SimulatedTransport};
