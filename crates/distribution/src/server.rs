//! DistributionServer - WebSocket accept loop
//!
//! Every accepted connection becomes a fresh subscription with its own
//! [`ViewerHandle`]. Inbound messages are drained and ignored; the
//! underlying protocol answers pings.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use contracts::{ContractError, ViewerSink, WireFrame};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use crate::error::{DistributionError, Result};
use crate::handle::{ViewerExit, ViewerHandle};
use crate::service::DistributionService;

/// Frame sink over one WebSocket connection
pub struct WebSocketViewer {
    name: String,
    tx: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl ViewerSink for WebSocketViewer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, frame: &WireFrame) -> std::result::Result<(), ContractError> {
        let text = frame.to_json()?;
        self.tx
            .send(Message::Text(text))
            .await
            .map_err(|e| ContractError::transport_lost(&self.name, e.to_string()))
    }

    async fn close(&mut self) -> std::result::Result<(), ContractError> {
        self.tx
            .close()
            .await
            .map_err(|e| ContractError::transport_lost(&self.name, e.to_string()))
    }
}

/// Totals reported when the server stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerReport {
    pub accepted: u64,
    pub handshake_failures: u64,
    pub transport_lost: u64,
}

/// Longest a peer may take to complete the WebSocket upgrade
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often finished viewer workers are collected
const REAP_INTERVAL: Duration = Duration::from_millis(250);

type Handshake = (SocketAddr, Result<WebSocketViewer>);

pub struct DistributionServer {
    listener: TcpListener,
    service: Arc<DistributionService>,
    shutdown: watch::Receiver<bool>,
    handshake_timeout: Duration,
    active: watch::Sender<usize>,
}

impl DistributionServer {
    /// Bind the listener. Port 0 picks a free port.
    #[instrument(name = "distribution_server_bind", skip(service, shutdown))]
    pub async fn bind(
        addr: &str,
        service: Arc<DistributionService>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DistributionError::bind(addr, e))?;
        Ok(Self {
            listener,
            service,
            shutdown,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            active: watch::Sender::new(0),
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of attached viewers whose worker is still running.
    pub fn active_viewers(&self) -> watch::Receiver<usize> {
        self.active.subscribe()
    }

    /// Accept viewers until shutdown is signalled, then stop every viewer.
    ///
    /// Upgrades run concurrently, each bounded by the handshake timeout, so
    /// a stalled peer never holds up the next one.
    #[instrument(name = "distribution_server_run", skip(self))]
    pub async fn run(self) -> Result<ServerReport> {
        let local = self.local_addr()?;
        info!(addr = %local, "distribution server listening");

        let Self {
            listener,
            service,
            mut shutdown,
            handshake_timeout,
            active,
        } = self;

        let mut report = ServerReport::default();
        let mut viewers: Vec<ViewerHandle> = Vec::new();
        let mut handshakes: JoinSet<Handshake> = JoinSet::new();
        let mut reap_tick = interval(REAP_INTERVAL);
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stop_requested = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };

            tokio::select! {
                biased;
                _ = stop_requested => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let limit = handshake_timeout;
                        handshakes.spawn(async move {
                            let upgraded = match timeout(limit, upgrade(stream, peer)).await {
                                Ok(upgraded) => upgraded,
                                Err(_) => Err(DistributionError::Handshake {
                                    peer,
                                    message: format!("no upgrade within {limit:?}"),
                                }),
                            };
                            (peer, upgraded)
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(joined) = handshakes.join_next() => match joined {
                    Ok((peer, Ok(sink))) => {
                        report.accepted += 1;
                        let handle = ViewerHandle::spawn(sink, service.subscribe());
                        debug!(viewer = handle.id(), peer = %peer, "viewer attached");
                        viewers.push(handle);
                        active.send_replace(viewers.len());
                    }
                    Ok((_, Err(e))) => {
                        report.handshake_failures += 1;
                        warn!(error = %e, "viewer rejected");
                    }
                    Err(e) => {
                        report.handshake_failures += 1;
                        warn!(error = %e, "handshake task failed");
                    }
                },
                _ = reap_tick.tick() => {
                    report.transport_lost += reap(&mut viewers).await;
                    active.send_if_modified(|count| {
                        let changed = *count != viewers.len();
                        *count = viewers.len();
                        changed
                    });
                }
            }
        }

        handshakes.shutdown().await;
        info!(viewers = viewers.len(), "distribution server shutting down");
        for handle in viewers {
            if let ViewerExit::TransportLost(_) = handle.shutdown().await {
                report.transport_lost += 1;
            }
        }
        active.send_replace(0);
        info!(
            accepted = report.accepted,
            handshake_failures = report.handshake_failures,
            transport_lost = report.transport_lost,
            "distribution server stopped"
        );
        Ok(report)
    }
}

/// Drop handles whose worker already ended; returns how many lost transport.
async fn reap(viewers: &mut Vec<ViewerHandle>) -> u64 {
    let (finished, running): (Vec<_>, Vec<_>) =
        viewers.drain(..).partition(|handle| handle.is_finished());
    *viewers = running;

    let mut lost = 0;
    for handle in finished {
        if let ViewerExit::TransportLost(_) = handle.join().await {
            lost += 1;
        }
    }
    lost
}

async fn upgrade(stream: TcpStream, peer: SocketAddr) -> Result<WebSocketViewer> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| DistributionError::Handshake {
            peer,
            message: e.to_string(),
        })?;
    let (tx, mut rx) = ws.split();

    // Drain inbound traffic so control frames are processed.
    tokio::spawn(async move {
        while let Some(message) = rx.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        debug!(peer = %peer, "viewer inbound closed");
    });

    Ok(WebSocketViewer {
        name: peer.to_string(),
        tx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DistributionConfig;
    use contracts::{DeviceAddress, MetricKey, TimeBase};
    use telemetry::{RideSession, TelemetryAggregator};
    use tokio_tungstenite::connect_async;

    const START: f64 = 1_700_000_000.0;

    async fn serve(
        configure: impl FnOnce(DistributionServer) -> DistributionServer,
    ) -> (
        TelemetryAggregator,
        RideSession,
        SocketAddr,
        watch::Receiver<usize>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<Result<ServerReport>>,
    ) {
        let (session, aggregator) = RideSession::begin(START, 600.0, TimeBase::Elapsed);
        let service = Arc::new(DistributionService::new(
            session.reader().clone(),
            *session.info(),
            DistributionConfig::default(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = configure(
            DistributionServer::bind("127.0.0.1:0", service, stop_rx)
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let active = server.active_viewers();
        let task = tokio::spawn(server.run());
        (aggregator, session, addr, active, stop_tx, task)
    }

    #[tokio::test]
    async fn test_viewer_gets_hello_replay_and_marker() {
        let start = 1_700_000_000.0;
        let (session, mut aggregator) = RideSession::begin(start, 600.0, TimeBase::Elapsed);
        let trainer: DeviceAddress = "trainer".into();
        aggregator.observe(&trainer, MetricKey::Power, 180.0, start + 1.0);
        aggregator.observe(&trainer, MetricKey::Speed, 28.3, start + 1.0);

        let service = Arc::new(DistributionService::new(
            session.reader().clone(),
            *session.info(),
            DistributionConfig::default(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = DistributionServer::bind("127.0.0.1:0", service, stop_rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(server.run());

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let mut frames = Vec::new();
        while frames.len() < 4 {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                frames.push(WireFrame::from_json(&text).unwrap());
            }
        }

        assert!(matches!(frames[0], WireFrame::Hello { .. }));
        assert_eq!(frames[3], WireFrame::ReplayEnd { replay_end: 2 });

        stop_tx.send_replace(true);
        let report = server_task.await.unwrap().unwrap();
        assert_eq!(report.accepted, 1);
    }

    #[tokio::test]
    async fn test_stalled_handshake_does_not_block_other_viewers() {
        let (_aggregator, _session, addr, mut active, stop_tx, task) =
            serve(|server| server.with_handshake_timeout(Duration::from_millis(300))).await;

        // Opens TCP and never sends the upgrade request
        let _stalled = TcpStream::connect(addr).await.unwrap();

        let (mut ws, _) = tokio::time::timeout(Duration::from_secs(3), connect_async(format!("ws://{addr}")))
            .await
            .expect("healthy viewer blocked by stalled peer")
            .unwrap();
        let first = ws.next().await.unwrap().unwrap();
        assert!(matches!(
            WireFrame::from_json(first.to_text().unwrap()).unwrap(),
            WireFrame::Hello { .. }
        ));
        tokio::time::timeout(Duration::from_secs(3), active.wait_for(|n| *n == 1))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        stop_tx.send_replace(true);
        let report = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("shutdown held up")
            .unwrap()
            .unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.handshake_failures, 1);
    }

    #[tokio::test]
    async fn test_lost_viewer_reaped_without_new_connections() {
        let (mut aggregator, _session, addr, mut active, stop_tx, task) = serve(|server| server).await;
        let trainer: DeviceAddress = "trainer".into();

        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), active.wait_for(|n| *n == 1))
            .await
            .unwrap()
            .unwrap();
        drop(ws);

        // The worker notices the loss on its next send
        let mut reaped = false;
        for t in 1..=50 {
            aggregator.observe(&trainer, MetricKey::Power, 200.0, START + f64::from(t));
            if tokio::time::timeout(Duration::from_millis(100), active.wait_for(|n| *n == 0))
                .await
                .is_ok()
            {
                reaped = true;
                break;
            }
        }
        assert!(reaped, "lost viewer still counted as active");

        stop_tx.send_replace(true);
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.transport_lost, 1);
    }
}
