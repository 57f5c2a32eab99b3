//! Outbound traits: viewer transports and ride recorders.

use crate::{CompletedRide, ContractError, WireFrame};

/// Frame-level transport to one subscribed viewer.
#[trait_variant::make(ViewerSink: Send)]
pub trait LocalViewerSink {
    /// Viewer label (used for logging/metrics)
    fn name(&self) -> &str;

    /// Send one frame.
    ///
    /// # Errors
    /// `ContractError::TransportLost` once the viewer is gone; the caller
    /// must not retry on the same sink.
    async fn send(&mut self, frame: &WireFrame) -> Result<(), ContractError>;

    /// Close the transport.
    async fn close(&mut self) -> Result<(), ContractError>;
}

/// Receives the completed timeline on ride stop/save.
#[trait_variant::make(RideRecorder: Send)]
pub trait LocalRideRecorder {
    /// Persist or forward the ride; returns a description of where it went.
    async fn record(&mut self, ride: &CompletedRide) -> Result<String, ContractError>;
}
