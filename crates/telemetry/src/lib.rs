//! # Telemetry
//!
//! Ride timeline and the aggregator that feeds it.
//!
//! Responsibilities:
//! - Timestamp raw readings against the ride start (`elapsed`), reject the rest
//! - Append-only timeline with a single writer and cursor-based readers
//! - Current-value view for displays
//! - Hand the completed ride to a recorder
//!
//! ## Usage Example
//!
//! ```ignore
//! use telemetry::{epoch_now, RideSession};
//!
//! let (session, aggregator) = RideSession::begin(epoch_now(), 1800.0, TimeBase::Elapsed);
//! let (tx, rx) = tokio::sync::mpsc::channel(1024);
//! manager.merge_readings(tx);
//! let writer = tokio::spawn(aggregator.run(rx));
//!
//! let (replay, mut cursor) = session.reader().snapshot_with_cursor();
//! while let Some(batch) = cursor.next_batch().await {
//!     // forward live samples
//! }
//! ```

mod aggregator;
mod live;
mod recorder;
mod session;
mod timeline;

pub use aggregator::{normalize, AggregatorStats, Observation, TelemetryAggregator};
pub use live::{LiveValue, LiveValues, DEFAULT_STALE_AFTER};
pub use recorder::JsonLinesRecorder;
pub use session::{epoch_now, RideSession};
pub use timeline::{timeline, TimelineCursor, TimelineReader, TimelineWriter};
