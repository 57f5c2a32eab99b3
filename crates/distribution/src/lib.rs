//! # Distribution
//!
//! Makes the ride timeline visible to viewers.
//!
//! Responsibilities:
//! - Replay the whole timeline to a new viewer, then mark the end of replay
//! - Follow the timeline tail per viewer, each through its own cursor
//! - One isolated worker per viewer; a lost viewer is dropped, never queued for
//! - Serve viewers over WebSocket
//!
//! ## Usage Example
//!
//! ```ignore
//! let service = Arc::new(DistributionService::new(
//!     session.reader().clone(),
//!     *session.info(),
//!     DistributionConfig::default(),
//! ));
//! let server = DistributionServer::bind("127.0.0.1:8000", service, shutdown_rx).await?;
//! let report = server.run().await?;
//! ```

mod error;
mod handle;
mod metrics;
mod server;
mod service;

pub use error::{DistributionError, Result};
pub use handle::{ViewerExit, ViewerHandle};
pub use metrics::{MetricsSnapshot, ViewerMetrics};
pub use server::{DistributionServer, ServerReport, WebSocketViewer};
pub use service::{DistributionConfig, DistributionService, Subscription, SubscriptionPhase};
