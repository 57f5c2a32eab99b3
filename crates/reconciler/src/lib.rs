//! # Reconciler
//!
//! Viewer side of the ride stream: turns a replay followed by live frames
//! into per-metric chart series that are sorted, windowed and free of
//! near-duplicate points.
//!
//! ## Usage Example
//!
//! ```ignore
//! let mut reconciler = Reconciler::new(ReconcilerConfig::default());
//! let client = ViewerClient::new("ws://127.0.0.1:8000");
//! loop {
//!     match client.run(&mut reconciler, shutdown.clone(), |r, updates| redraw(r, updates)).await {
//!         Err(ReconcilerError::TransportLost { .. }) => continue,
//!         other => break other,
//!     }
//! }
//! ```

mod client;
mod error;
mod reconciler;
mod series;

pub use client::{ClientExit, ViewerClient};
pub use error::{ReconcilerError, Result};
pub use reconciler::{ChartUpdate, Phase, Reconciler, ReconcilerConfig, ReconcilerStats};
pub use series::{Applied, ChartPoint, ChartSeries, PointKind};
