//! ViewerHandle - one worker task per subscribed viewer

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use contracts::{ViewerSink, WireFrame};

use crate::metrics::ViewerMetrics;
use crate::service::{Subscription, SubscriptionPhase};

/// Why a viewer worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerExit {
    /// Timeline closed and everything was delivered
    RideEnded,
    /// A send failed; the viewer must resubscribe for a fresh replay
    TransportLost(String),
    /// Shut down by the server
    Shutdown,
}

/// Handle to a running viewer worker
pub struct ViewerHandle {
    id: u64,
    name: String,
    metrics: Arc<ViewerMetrics>,
    shutdown: watch::Sender<bool>,
    worker_handle: JoinHandle<ViewerExit>,
}

impl ViewerHandle {
    /// Spawn a worker pumping `subscription` into `sink`.
    pub fn spawn<S: ViewerSink + 'static>(sink: S, subscription: Subscription) -> Self {
        let id = subscription.id();
        let name = sink.name().to_string();
        let metrics = Arc::new(ViewerMetrics::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker_metrics = Arc::clone(&metrics);
        let worker_name = name.clone();
        let worker_handle = tokio::spawn(async move {
            viewer_worker(sink, subscription, worker_metrics, shutdown_rx, worker_name).await
        });

        observability::record_viewer_connected();

        Self {
            id,
            name,
            metrics,
            shutdown,
            worker_handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &Arc<ViewerMetrics> {
        &self.metrics
    }

    pub fn is_finished(&self) -> bool {
        self.worker_handle.is_finished()
    }

    /// Wait for the worker to end on its own.
    pub async fn join(self) -> ViewerExit {
        Self::outcome(&self.name, self.worker_handle.await)
    }

    /// Stop the worker and close its sink.
    #[instrument(name = "viewer_handle_shutdown", skip(self), fields(viewer = %self.name))]
    pub async fn shutdown(self) -> ViewerExit {
        self.shutdown.send_replace(true);
        let exit = Self::outcome(&self.name, self.worker_handle.await);
        debug!(viewer = %self.name, exit = ?exit, "ViewerHandle shutdown complete");
        exit
    }

    fn outcome(
        name: &str,
        joined: Result<ViewerExit, tokio::task::JoinError>,
    ) -> ViewerExit {
        joined.unwrap_or_else(|e| {
            error!(viewer = %name, error = ?e, "Viewer worker panicked");
            ViewerExit::TransportLost(e.to_string())
        })
    }
}

/// Worker task that forwards subscription frames to the sink
#[instrument(
    name = "viewer_worker_loop",
    skip(sink, subscription, metrics, shutdown),
    fields(viewer = %name, id = subscription.id())
)]
async fn viewer_worker<S: ViewerSink>(
    mut sink: S,
    mut subscription: Subscription,
    metrics: Arc<ViewerMetrics>,
    mut shutdown: watch::Receiver<bool>,
    name: String,
) -> ViewerExit {
    debug!(viewer = %name, "Viewer worker started");

    let exit = loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break ViewerExit::Shutdown,
            frame = subscription.next_frame() => frame,
        };

        let Some(frame) = frame else {
            break ViewerExit::RideEnded;
        };

        let phase = phase_label(&frame, subscription.phase());
        match sink.send(&frame).await {
            Ok(()) => {
                observability::record_frame_sent(phase, true);
                if let WireFrame::Sample(_) = frame {
                    match phase {
                        "replay" => metrics.inc_replayed(),
                        _ => metrics.inc_live(),
                    }
                }
            }
            Err(e) => {
                // No queuing for a lost viewer: it resubscribes and replays.
                metrics.inc_send_failures();
                observability::record_frame_sent(phase, false);
                warn!(viewer = %name, error = %e, "Viewer transport lost");
                break ViewerExit::TransportLost(e.to_string());
            }
        }
    };

    if !matches!(exit, ViewerExit::TransportLost(_)) {
        if let Err(e) = sink.close().await {
            debug!(viewer = %name, error = %e, "Close failed");
        }
    }
    observability::record_viewer_disconnected(matches!(exit, ViewerExit::TransportLost(_)));

    debug!(viewer = %name, exit = ?exit, "Viewer worker stopped");
    exit
}

/// Phase a frame belongs to, after `next_frame` has advanced the phase.
fn phase_label(frame: &WireFrame, phase: SubscriptionPhase) -> &'static str {
    match frame {
        WireFrame::Hello { .. } => "hello",
        WireFrame::ReplayEnd { .. } => "replay",
        WireFrame::Sample(_) => phase.as_str(),
    }
}
