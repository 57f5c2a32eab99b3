//! Ride orchestration module.

mod orchestrator;
mod stats;

pub use orchestrator::{RideConfig, RideRunner};
pub use stats::RideStats;
