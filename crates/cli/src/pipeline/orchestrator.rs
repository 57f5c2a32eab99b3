//! Ride orchestrator - coordinates all components.
//!
//! Runs against simulated sensors or, with the `ble` feature, real ones.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use connection::{
    ConnectionManager, ManagerError, ReadingChannelConfig, ReconnectPolicy, SimulatedClock,
    SimulatedDevice, SimulatedTransport,
};
use contracts::{DeviceTransport, RideBlueprint, RideRecorder, StateTransition};
use distribution::{DistributionConfig, DistributionServer, DistributionService};
use observability::RideMetricsAggregator;
use telemetry::{epoch_now, JsonLinesRecorder, RideSession};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{info, warn};

use super::RideStats;
use crate::error::CliError;

/// How often current values are logged during a ride
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RideConfig {
    pub blueprint: RideBlueprint,

    /// Simulated sensors instead of Bluetooth
    pub simulate: bool,

    /// Viewer server address
    pub bind: String,

    /// Where the completed ride is written (None = not recorded)
    pub record_dir: Option<PathBuf>,

    pub ride_name: Option<String>,

    /// Per-device reading buffer
    pub buffer_size: usize,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

pub struct RideRunner {
    config: RideConfig,
}

impl RideRunner {
    pub fn new(config: RideConfig) -> Self {
        Self { config }
    }

    /// Ride until the duration limit or `shutdown`, whichever comes first.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<RideStats> {
        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        if self.config.simulate {
            info!("Running with SIMULATED sensors");
            let transport = simulated_transport(&self.config.blueprint);
            return self.run_with(transport, shutdown).await;
        }
        self.run_ble(shutdown).await
    }

    #[cfg(feature = "ble")]
    async fn run_ble(self, shutdown: impl Future<Output = ()>) -> Result<RideStats> {
        let transport = connection::BleTransport::new()
            .await
            .context("Failed to open Bluetooth adapter")?;
        self.run_with(transport, shutdown).await
    }

    #[cfg(not(feature = "ble"))]
    async fn run_ble(self, _shutdown: impl Future<Output = ()>) -> Result<RideStats> {
        Err(CliError::BleUnavailable.into())
    }

    async fn run_with<T>(self, transport: T, shutdown: impl Future<Output = ()>) -> Result<RideStats>
    where
        T: DeviceTransport + Sync + 'static,
    {
        let started = Instant::now();
        let blueprint = &self.config.blueprint;

        let mut manager = ConnectionManager::with_config(
            transport,
            ReconnectPolicy::from(&blueprint.reconnect),
            ReadingChannelConfig {
                capacity: self.config.buffer_size,
                ..Default::default()
            },
        );
        let transition_task = tokio::spawn(log_transitions(manager.subscribe_transitions()));

        let (session, aggregator) = RideSession::begin(
            epoch_now(),
            blueprint.ride.duration_limit_secs(),
            blueprint.ride.time_base,
        );

        // Connect
        let timeout = Duration::try_from_secs_f64(blueprint.ride.connect_timeout_secs).unwrap_or(Duration::MAX);
        info!(devices = blueprint.devices.len(), timeout_secs = timeout.as_secs_f64(), "Connecting devices...");
        let listen = manager.start_listening(blueprint.device_specs(), timeout)?;
        match listen.finish().await {
            Ok(report) => {
                info!(
                    connected = report.connected.len(),
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "All devices connected"
                );
            }
            Err(ManagerError::DiscoveryTimeout {
                missing, connected, ..
            }) => {
                warn!(?missing, ?connected, "Some devices did not connect; riding without them");
                if connected.is_empty() {
                    manager.stop().await;
                    return Err(CliError::NoDevices {
                        timeout_secs: timeout.as_secs_f64(),
                    }
                    .into());
                }
            }
            Err(e) => return Err(e).context("Failed to start listening"),
        }

        // Aggregate
        let (reading_tx, reading_rx) = mpsc::channel(self.config.buffer_size);
        let streams = manager.merge_readings(reading_tx);
        let aggregator_task = tokio::spawn(aggregator.run(reading_rx));
        info!(streams, "Aggregator started");

        // Serve viewers
        let (stop_tx, stop_rx) = watch::channel(false);
        let service = Arc::new(DistributionService::new(
            session.reader().clone(),
            *session.info(),
            DistributionConfig {
                replay_chunk_size: blueprint.server.replay_chunk_size,
                time_base: blueprint.ride.time_base,
                ..Default::default()
            },
        ));
        let server = DistributionServer::bind(&self.config.bind, service, stop_rx)
            .await
            .with_context(|| format!("Failed to bind viewer server on {}", self.config.bind))?;
        info!(addr = %server.local_addr()?, "Viewers can connect");
        let server_task = tokio::spawn(server.run());

        // Ride
        let reason = {
            let deadline = sleep(session.remaining(epoch_now()));
            tokio::pin!(deadline);
            tokio::pin!(shutdown);
            let mut status = interval(STATUS_INTERVAL);
            status.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut deadline => break "duration limit reached",
                    _ = &mut shutdown => break "shutdown requested",
                    _ = status.tick() => {
                        let values = session.live_values(epoch_now());
                        info!(samples = session.reader().len(), "{}", values);
                    }
                }
            }
        };

        // Shutdown
        info!(reason, "Stopping ride...");
        let connection = manager.metrics();
        manager.stop().await;
        let aggregated = aggregator_task.await.context("Aggregator task failed")?;

        stop_tx.send_replace(true);
        let server_report = server_task
            .await
            .context("Viewer server task failed")?
            .context("Viewer server failed")?;

        drop(manager);
        let mut ride_metrics = transition_task.await.context("Transition log task failed")?;

        let completed = session.finish(epoch_now());
        for sample in &completed.samples {
            ride_metrics.push_sample(sample);
        }
        ride_metrics.rejected_before_start = aggregated.before_ride_start;
        ride_metrics.invalid_values = aggregated.invalid_values;

        let recorded = match &self.config.record_dir {
            Some(dir) => {
                let mut recorder = JsonLinesRecorder::new(dir);
                if let Some(name) = &self.config.ride_name {
                    recorder = recorder.with_ride_name(name);
                }
                match recorder.record(&completed).await {
                    Ok(path) => {
                        info!(path = %path, "Ride recorded");
                        Some(path)
                    }
                    Err(e) => {
                        warn!(error = %e, "Ride not recorded");
                        None
                    }
                }
            }
            None => None,
        };

        let stats = RideStats {
            duration: started.elapsed(),
            summary: ride_metrics.summary(),
            aggregated,
            connection,
            server: server_report,
            recorded,
        };

        info!(
            samples = stats.summary.total_samples,
            viewers = stats.server.accepted,
            duration_secs = stats.duration.as_secs_f64(),
            "Ride shutdown complete"
        );

        Ok(stats)
    }
}

/// Simulator scripted from the per-device `simulation` sections.
fn simulated_transport(blueprint: &RideBlueprint) -> SimulatedTransport {
    blueprint
        .devices
        .iter()
        .filter_map(|device| {
            device
                .simulation
                .as_ref()
                .map(|sim| (device.address.clone(), SimulatedDevice::from(sim)))
        })
        .fold(
            SimulatedTransport::new(SimulatedClock::system()),
            |transport, (address, device)| transport.with_device(address, device),
        )
}

/// Log every transition until the manager is gone; counts losses for the summary.
async fn log_transitions(mut rx: broadcast::Receiver<StateTransition>) -> RideMetricsAggregator {
    let mut metrics = RideMetricsAggregator::new();
    loop {
        match rx.recv().await {
            Ok(transition) => {
                if transition.is_fresh_loss() {
                    warn!(address = %transition.address, "{}", transition);
                } else {
                    info!(address = %transition.address, "{}", transition);
                }
                metrics.record_transition(&transition);
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Transition log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    metrics
}
