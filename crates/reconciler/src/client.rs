//! ViewerClient - WebSocket viewer driving a [`Reconciler`]

use std::future::pending;

use contracts::WireFrame;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::error::{ReconcilerError, Result};
use crate::reconciler::{ChartUpdate, Reconciler};

/// How a viewer session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// Server closed the stream (ride over)
    Closed,
    /// Local shutdown requested
    Shutdown,
}

pub struct ViewerClient {
    url: String,
}

impl ViewerClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Receive frames into `reconciler` until the stream ends.
    ///
    /// `on_update` is called with the reconciler and the updates each
    /// frame (or the replay silence timer) produced.
    ///
    /// # Errors
    /// `TransportLost` when the connection drops; calling `run` again
    /// resubscribes and starts over with a fresh replay.
    #[instrument(name = "viewer_client_run", skip_all, fields(url = %self.url))]
    pub async fn run<F>(
        &self,
        reconciler: &mut Reconciler,
        mut shutdown: watch::Receiver<bool>,
        mut on_update: F,
    ) -> Result<ClientExit>
    where
        F: FnMut(&Reconciler, &[ChartUpdate]),
    {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ReconcilerError::connect(&self.url, e.to_string()))?;
        info!("viewer connected");

        loop {
            let idle = reconciler.idle_deadline();
            let idle_timer = async move {
                match idle {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            let stop_requested = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };

            let updates = tokio::select! {
                biased;
                _ = stop_requested => None,
                message = ws.next() => Some(match message {
                    Some(Ok(Message::Text(text))) => match WireFrame::from_json(&text) {
                        Ok(frame) => reconciler.ingest(frame, Instant::now()),
                        Err(e) => {
                            warn!(error = %e, "ignoring malformed frame");
                            Vec::new()
                        }
                    },
                    Some(Ok(Message::Close(_))) => {
                        debug!("server closed the stream");
                        return Ok(ClientExit::Closed);
                    }
                    Some(Ok(_)) => Vec::new(),
                    Some(Err(e)) => return Err(ReconcilerError::transport_lost(e.to_string())),
                    None => return Err(ReconcilerError::transport_lost("stream ended without close")),
                }),
                _ = idle_timer => Some(reconciler.poll_idle(Instant::now())),
            };

            let Some(updates) = updates else {
                let _ = ws.close(None).await;
                return Ok(ClientExit::Shutdown);
            };

            if !updates.is_empty() {
                on_update(reconciler, &updates);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReconcilerConfig;
    use contracts::{DeviceAddress, MetricKey, TimeBase};
    use distribution::{DistributionConfig, DistributionServer, DistributionService};
    use std::sync::Arc;
    use telemetry::RideSession;

    #[test]
    fn test_run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let client = ViewerClient::new("ws://127.0.0.1:9");
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let run = client.run(&mut reconciler, stop_rx, |_, _| {});
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_shutdown_closes_without_waiting_for_server() {
        let start = 1_700_000_000.0;
        let (session, _aggregator) = RideSession::begin(start, 600.0, TimeBase::Elapsed);
        let service = Arc::new(DistributionService::new(
            session.reader().clone(),
            *session.info(),
            DistributionConfig::default(),
        ));
        let (_server_stop, server_rx) = watch::channel(false);
        let server = DistributionServer::bind("127.0.0.1:0", service, server_rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let (stop_tx, stop_rx) = watch::channel(false);
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let client_task = tokio::spawn(async move {
            let mut reconciler = Reconciler::new(ReconcilerConfig::default());
            ViewerClient::new(format!("ws://{addr}"))
                .run(&mut reconciler, stop_rx, move |_, updates| {
                    let _ = seen_tx.send(updates.len());
                })
                .await
        });

        // Replay of an empty ride finishes with a redraw
        assert_eq!(seen_rx.recv().await, Some(1));
        stop_tx.send_replace(true);
        assert_eq!(client_task.await.unwrap().unwrap(), ClientExit::Shutdown);
    }

    #[tokio::test]
    async fn test_client_reconciles_replay_and_live() {
        let start = 1_700_000_000.0;
        let (session, mut aggregator) = RideSession::begin(start, 600.0, TimeBase::Elapsed);
        let trainer: DeviceAddress = "trainer".into();
        for t in [20.0, 5.0, 15.0] {
            aggregator.observe(&trainer, MetricKey::Power, 100.0 + t, start + t);
        }

        let service = Arc::new(DistributionService::new(
            session.reader().clone(),
            *session.info(),
            DistributionConfig::default(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = DistributionServer::bind("127.0.0.1:0", service, stop_rx.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(server.run());

        let client = ViewerClient::new(format!("ws://{addr}"));
        let (live_tx, mut live_rx) = tokio::sync::mpsc::unbounded_channel();
        let client_task = tokio::spawn(async move {
            let mut reconciler = Reconciler::new(ReconcilerConfig::default());
            let exit = client
                .run(&mut reconciler, stop_rx, move |_, updates| {
                    for update in updates {
                        let _ = live_tx.send(*update);
                    }
                })
                .await;
            (exit, reconciler)
        });

        assert_eq!(live_rx.recv().await, Some(ChartUpdate::Redraw));
        aggregator.observe(&trainer, MetricKey::Power, 125.0, start + 25.0);
        assert!(matches!(live_rx.recv().await, Some(ChartUpdate::Point { elapsed, .. }) if elapsed == 25.0));

        stop_tx.send_replace(true);
        let (exit, reconciler) = client_task.await.unwrap();
        assert!(exit.is_ok());
        assert_eq!(
            reconciler.points(MetricKey::Power),
            vec![(5.0, 105.0), (15.0, 115.0), (20.0, 120.0), (25.0, 125.0)]
        );
        server_task.await.unwrap().unwrap();
    }
}
