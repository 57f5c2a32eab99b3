//! ConnectionManager main entry

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use contracts::{
    ConnectionState, DeviceAddress, DeviceSpec, DeviceTransport, RawReading, StateTransition,
    TaggedReading,
};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::channel::ReadingSender;
use crate::config::{ConnectionMetrics, MetricsSnapshot, ReadingChannelConfig, ReconnectPolicy};
use crate::error::{ManagerError, Result};
use crate::handle::{stop_requested, HandleContext, HandleStatus, HandleTask};

const TRANSITION_CAPACITY: usize = 256;

/// Slack after the listen deadline before a session stops waiting on
/// handles that have not reported their outcome.
const SETTLE_GRACE: Duration = Duration::from_millis(500);

/// Stand-in deadline for timeouts too large to represent (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + after`, saturating to a far-future instant instead of overflowing.
fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .unwrap_or_else(|| from + FAR_FUTURE)
}

struct HandleSlot {
    spec: DeviceSpec,
    status: Arc<watch::Sender<HandleStatus>>,
    readings: Option<ReadingSender>,
    reading_rx: Option<Receiver<RawReading>>,
    task: Option<JoinHandle<()>>,
}

impl HandleSlot {
    fn new(spec: DeviceSpec, channel: &ReadingChannelConfig) -> Self {
        let (readings, reading_rx) = ReadingSender::channel(channel);
        let (status, _) = watch::channel(HandleStatus::initial());
        Self {
            spec,
            status: Arc::new(status),
            readings: Some(readings),
            reading_rx: Some(reading_rx),
            task: None,
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }
}

/// Connection Manager
///
/// Owns one handle per configured device and drives each from its own task,
/// so a stalled or failing device never holds up the others.
pub struct ConnectionManager<T: DeviceTransport> {
    transport: Arc<T>,
    policy: ReconnectPolicy,
    channel: ReadingChannelConfig,
    slots: HashMap<DeviceAddress, HandleSlot>,
    transitions: broadcast::Sender<StateTransition>,
    shutdown: watch::Sender<bool>,
    metrics: Arc<ConnectionMetrics>,
    stopped: bool,
}

impl<T> ConnectionManager<T>
where
    T: DeviceTransport + Sync + 'static,
{
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ReconnectPolicy::default(), ReadingChannelConfig::default())
    }

    pub fn with_config(transport: T, policy: ReconnectPolicy, channel: ReadingChannelConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            transport: Arc::new(transport),
            policy,
            channel,
            slots: HashMap::new(),
            transitions,
            shutdown,
            metrics: Arc::new(ConnectionMetrics::new()),
            stopped: false,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Begin discovery and connection for every device in `specs`.
    ///
    /// Returns immediately; the session reports transitions as they happen.
    /// Devices not `Connected` within `timeout` end up `Failed` and are
    /// reported by [`ListenSession::finish`]. Re-issuing a `Failed` address
    /// restarts it; re-issuing a live one only watches it.
    #[instrument(
        name = "connection_start_listening",
        skip(self, specs),
        fields(timeout_ms = timeout.as_millis() as u64)
    )]
    pub fn start_listening(
        &mut self,
        specs: impl IntoIterator<Item = DeviceSpec>,
        timeout: Duration,
    ) -> Result<ListenSession> {
        if self.stopped {
            return Err(ManagerError::Stopped);
        }

        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        // Subscribe before any task starts so no transition is missed.
        let transitions = self.transitions.subscribe();
        let ctx = self.context();
        let mut watched = Vec::new();
        let mut seen = HashSet::new();

        for spec in specs {
            if !seen.insert(spec.address.clone()) {
                continue;
            }

            let slot = self
                .slots
                .entry(spec.address.clone())
                .or_insert_with(|| HandleSlot::new(spec.clone(), &self.channel));

            let restart = match slot.task {
                None => true,
                Some(_) => slot.state() == ConnectionState::Failed,
            };

            if restart {
                if slot.task.is_some() {
                    slot.status
                        .send_replace(HandleStatus::restarted(ConnectionState::Failed));
                }
                slot.spec = spec.clone();

                let Some(readings) = slot.readings.clone() else {
                    continue;
                };
                let task = HandleTask::new(
                    spec.clone(),
                    ctx.clone(),
                    slot.status.clone(),
                    readings,
                    deadline,
                );
                slot.task = Some(tokio::spawn(task.run()));
                debug!(address = %spec.address, capability = %spec.capability, "handle started");
            } else {
                debug!(address = %spec.address, state = %slot.state(), "handle already active");
            }

            watched.push((spec.address.clone(), slot.status.subscribe()));
        }

        info!(devices = watched.len(), "listening for devices");

        Ok(ListenSession {
            transitions,
            handles: watched,
            reached: HashSet::new(),
            shutdown: self.shutdown.subscribe(),
            started,
            deadline,
        })
    }

    /// The reading stream of one handle.
    ///
    /// The stream survives reconnects and restarts and ends only on
    /// [`stop`](Self::stop). It can be taken once.
    pub fn readings(&mut self, address: &str) -> Result<ReadingStream> {
        let slot = self
            .slots
            .get_mut(address)
            .ok_or_else(|| ManagerError::UnknownDevice {
                address: address.into(),
            })?;

        let rx = slot
            .reading_rx
            .take()
            .ok_or_else(|| ManagerError::ReadingsTaken {
                address: slot.spec.address.clone(),
            })?;

        Ok(ReadingStream {
            address: slot.spec.address.clone(),
            rx,
        })
    }

    /// Forward every not-yet-taken reading stream into `tx`.
    ///
    /// Each handle gets its own forwarder task. Returns the number of
    /// streams attached.
    pub fn merge_readings(&mut self, tx: mpsc::Sender<TaggedReading>) -> usize {
        let mut attached = 0;
        for slot in self.slots.values_mut() {
            let Some(rx) = slot.reading_rx.take() else {
                continue;
            };
            let mut stream = ReadingStream {
                address: slot.spec.address.clone(),
                rx,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(reading) = stream.next().await {
                    let tagged = TaggedReading {
                        address: stream.address.clone(),
                        reading,
                    };
                    if tx.send(tagged).await.is_err() {
                        break;
                    }
                }
                debug!(address = %stream.address, "reading forwarder finished");
            });
            attached += 1;
        }
        attached
    }

    pub fn status(&self, address: &str) -> Option<HandleStatus> {
        self.slots.get(address).map(|slot| *slot.status.borrow())
    }

    /// Every handle with its current status, ordered by address.
    pub fn states(&self) -> Vec<(DeviceSpec, HandleStatus)> {
        let mut states: Vec<_> = self
            .slots
            .values()
            .map(|slot| (slot.spec.clone(), *slot.status.borrow()))
            .collect();
        states.sort_by(|a, b| a.0.address.cmp(&b.0.address));
        states
    }

    /// Live feed of every handle's transitions, for operator displays.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Disconnect every handle and end all reading streams. Idempotent.
    #[instrument(name = "connection_stop", skip(self))]
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self
            .slots
            .values_mut()
            .filter_map(|slot| slot.task.take())
            .collect();
        let count = tasks.len();

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "handle task ended abnormally");
            }
        }

        for slot in self.slots.values_mut() {
            slot.readings = None;
        }

        info!(handles = count, "connection manager stopped");
    }

    fn context(&self) -> HandleContext<T> {
        HandleContext {
            transport: self.transport.clone(),
            policy: self.policy,
            transitions: self.transitions.clone(),
            shutdown: self.shutdown.subscribe(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: DeviceTransport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        // Tasks observe this and release their links.
        self.shutdown.send_replace(true);
    }
}

/// Lazy stream of raw readings for one handle.
pub struct ReadingStream {
    address: DeviceAddress,
    rx: Receiver<RawReading>,
}

impl ReadingStream {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Suspend until the next reading. `None` once the manager has stopped.
    pub async fn next(&mut self) -> Option<RawReading> {
        self.rx.recv().await.ok()
    }
}

/// Outcome of a listen request where every device connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReport {
    pub connected: Vec<DeviceAddress>,
    pub elapsed: Duration,
}

/// Live view of one `start_listening` call.
pub struct ListenSession {
    transitions: broadcast::Receiver<StateTransition>,
    handles: Vec<(DeviceAddress, watch::Receiver<HandleStatus>)>,
    /// Handles seen reaching `Connected` during this session
    reached: HashSet<DeviceAddress>,
    shutdown: watch::Receiver<bool>,
    started: Instant,
    deadline: Instant,
}

impl ListenSession {
    pub fn addresses(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.handles.iter().map(|(address, _)| address)
    }

    /// Every handle has connected or failed.
    pub fn is_settled(&self) -> bool {
        self.handles
            .iter()
            .all(|(_, status)| status.borrow().state.is_settled())
    }

    /// Next transition of a handle in this session.
    ///
    /// `None` once every handle has settled and its transitions have been
    /// delivered.
    pub async fn next_transition(&mut self) -> Option<StateTransition> {
        loop {
            // Read settledness first: tasks broadcast before updating status.
            let settled = self.is_settled();

            match self.transitions.try_recv() {
                Ok(transition) => match self.accept(transition) {
                    Some(transition) => return Some(transition),
                    None => continue,
                },
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "listen session lagged behind transitions");
                    continue;
                }
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) if settled => return None,
                Err(TryRecvError::Empty) => {}
            }

            tokio::select! {
                received = self.transitions.recv() => match received {
                    Ok(transition) => {
                        if let Some(transition) = self.accept(transition) {
                            return Some(transition);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "listen session lagged behind transitions");
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = sleep_until(deadline_after(self.deadline, SETTLE_GRACE)) => return None,
                _ = stop_requested(&mut self.shutdown) => return None,
            }
        }
    }

    /// Drain remaining transitions and report the outcome.
    ///
    /// # Errors
    /// `ManagerError::DiscoveryTimeout` naming the devices that never
    /// connected; the connected ones stay connected.
    pub async fn finish(mut self) -> Result<ConnectReport> {
        while self.next_transition().await.is_some() {}
        self.report()
    }

    fn report(&self) -> Result<ConnectReport> {
        let mut connected = Vec::new();
        let mut missing = Vec::new();

        for (address, status) in &self.handles {
            let state = status.borrow().state;
            if state == ConnectionState::Connected || self.reached.contains(address) {
                connected.push(address.clone());
            } else {
                missing.push(address.clone());
            }
        }

        let elapsed = self.started.elapsed();
        if missing.is_empty() {
            Ok(ConnectReport { connected, elapsed })
        } else {
            Err(ManagerError::DiscoveryTimeout {
                waited_ms: elapsed.as_millis() as u64,
                missing,
                connected,
            })
        }
    }

    fn accept(&mut self, transition: StateTransition) -> Option<StateTransition> {
        if !self
            .handles
            .iter()
            .any(|(address, _)| *address == transition.address)
        {
            return None;
        }
        if transition.current == ConnectionState::Connected {
            self.reached.insert(transition.address.clone());
        }
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimulatedClock, SimulatedDevice, SimulatedTransport};
    use contracts::Capability;

    fn spec(address: &str, capability: Capability) -> DeviceSpec {
        DeviceSpec::new(address, capability)
    }

    fn transport() -> SimulatedTransport {
        SimulatedTransport::new(SimulatedClock::starting_at(1_000.0)).with_seed(42)
    }

    async fn collect_until(
        rx: &mut broadcast::Receiver<StateTransition>,
        done: impl Fn(&StateTransition) -> bool,
    ) -> Vec<(StateTransition, Instant)> {
        let mut seen = Vec::new();
        loop {
            let transition = rx.recv().await.unwrap();
            let finished = done(&transition);
            seen.push((transition, Instant::now()));
            if finished {
                return seen;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_keeps_connected_devices() {
        let transport = transport().with_device("hrm", SimulatedDevice::never_appears());
        let mut manager = ConnectionManager::new(transport);

        let session = manager
            .start_listening(
                [spec("trainer", Capability::Power), spec("hrm", Capability::HeartRate)],
                Duration::from_secs(5),
            )
            .unwrap();

        match session.finish().await {
            Err(ManagerError::DiscoveryTimeout {
                waited_ms,
                missing,
                connected,
            }) => {
                assert!(waited_ms >= 5_000);
                assert_eq!(missing, vec![DeviceAddress::from("hrm")]);
                assert_eq!(connected, vec![DeviceAddress::from("trainer")]);
            }
            other => panic!("expected discovery timeout, got {other:?}"),
        }

        assert_eq!(manager.status("trainer").unwrap().state, ConnectionState::Connected);
        assert_eq!(manager.status("hrm").unwrap().state, ConnectionState::Failed);

        let mut readings = manager.readings("trainer").unwrap();
        assert!(readings.next().await.is_some());

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_connected_report() {
        let mut manager = ConnectionManager::new(transport());
        let session = manager
            .start_listening(
                [spec("trainer", Capability::Power), spec("hrm", Capability::HeartRate)],
                Duration::from_secs(10),
            )
            .unwrap();

        let report = session.finish().await.unwrap();
        assert_eq!(report.connected.len(), 2);
        assert!(report.elapsed < Duration::from_secs(1));
        assert_eq!(manager.metrics().connects, 2);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_waits_for_device() {
        let transport =
            transport().with_device("hrm", SimulatedDevice::appears_after(Duration::from_secs(90)));
        let mut manager = ConnectionManager::new(transport);
        let session = manager
            .start_listening([spec("hrm", Capability::HeartRate)], Duration::MAX)
            .unwrap();

        let report = session.finish().await.unwrap();
        assert_eq!(report.connected, vec![DeviceAddress::from("hrm")]);
        assert!(report.elapsed >= Duration::from_secs(90));

        manager.stop().await;
    }

    #[test]
    fn test_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(86_400 * 365));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_reports_transitions_in_order() {
        let mut manager = ConnectionManager::new(transport());
        let mut session = manager
            .start_listening([spec("hrm", Capability::HeartRate)], Duration::from_secs(5))
            .unwrap();

        let mut states = Vec::new();
        while let Some(transition) = session.next_transition().await {
            states.push(transition.current);
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::AwaitingDevice,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_policy_attempts() {
        let transport = transport().with_device("hrm", SimulatedDevice::flaky(2, 3));
        let mut manager = ConnectionManager::new(transport);
        let mut rx = manager.subscribe_transitions();

        manager
            .start_listening([spec("hrm", Capability::HeartRate)], Duration::from_secs(5))
            .unwrap()
            .finish()
            .await
            .unwrap();

        let seen = collect_until(&mut rx, |t| t.current == ConnectionState::Failed).await;
        let sequence: Vec<_> = seen.iter().map(|(t, _)| (t.current, t.attempt)).collect();
        assert_eq!(
            sequence,
            vec![
                (ConnectionState::AwaitingDevice, None),
                (ConnectionState::Connecting, None),
                (ConnectionState::Connected, None),
                (ConnectionState::Disconnected, None),
                (ConnectionState::Connecting, Some(1)),
                (ConnectionState::Disconnected, Some(1)),
                (ConnectionState::Connecting, Some(2)),
                (ConnectionState::Disconnected, Some(2)),
                (ConnectionState::Connecting, Some(3)),
                (ConnectionState::Disconnected, Some(3)),
                (ConnectionState::Failed, None),
            ]
        );

        // Each attempt waits out the backoff first
        let lost_at = seen[3].1;
        for (i, (transition, at)) in seen.iter().enumerate().skip(4) {
            if transition.current == ConnectionState::Connecting {
                let attempt = transition.attempt.unwrap();
                assert!(*at - lost_at >= Duration::from_secs(2 * attempt as u64), "attempt {i}");
            }
        }
        assert!(seen[3].0.is_fresh_loss());
        assert_eq!(manager.metrics().failures, 1);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers_and_stream_survives() {
        let transport = transport().with_device("hrm", SimulatedDevice::flaky(2, 1));
        let mut manager = ConnectionManager::new(transport);
        let mut rx = manager.subscribe_transitions();

        manager
            .start_listening([spec("hrm", Capability::HeartRate)], Duration::from_secs(5))
            .unwrap()
            .finish()
            .await
            .unwrap();
        let mut readings = manager.readings("hrm").unwrap();

        let seen = collect_until(&mut rx, |t| {
            t.current == ConnectionState::Connected && t.attempt == Some(2)
        })
        .await;
        assert!(seen
            .iter()
            .any(|(t, _)| t.current == ConnectionState::Disconnected && t.attempt == Some(1)));
        assert_eq!(manager.transport().connect_count("hrm"), 2);

        // Two readings from the first link, then the reconnected link's
        for _ in 0..3 {
            assert!(readings.next().await.is_some());
        }

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handle_restarts_on_new_listen() {
        let transport = transport().with_device(
            "hrm",
            SimulatedDevice::appears_after(Duration::from_secs(8)),
        );
        let mut manager = ConnectionManager::new(transport);
        let hrm = spec("hrm", Capability::HeartRate);

        let first = manager
            .start_listening([hrm.clone()], Duration::from_secs(5))
            .unwrap()
            .finish()
            .await;
        assert!(matches!(first, Err(ManagerError::DiscoveryTimeout { .. })));
        assert_eq!(manager.status("hrm").unwrap().state, ConnectionState::Failed);

        let second = manager
            .start_listening([hrm], Duration::from_secs(10))
            .unwrap()
            .finish()
            .await
            .unwrap();
        assert_eq!(second.connected, vec![DeviceAddress::from("hrm")]);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_ends_streams() {
        let mut manager = ConnectionManager::new(transport());
        manager
            .start_listening([spec("hrm", Capability::HeartRate)], Duration::from_secs(5))
            .unwrap()
            .finish()
            .await
            .unwrap();
        let mut readings = manager.readings("hrm").unwrap();
        assert!(matches!(
            manager.readings("hrm"),
            Err(ManagerError::ReadingsTaken { .. })
        ));

        manager.stop().await;
        manager.stop().await;

        assert!(manager.is_stopped());
        assert_eq!(manager.status("hrm").unwrap().state, ConnectionState::Disconnected);
        while readings.next().await.is_some() {}
        assert!(matches!(
            manager.start_listening([spec("hrm", Capability::HeartRate)], Duration::from_secs(1)),
            Err(ManagerError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_readings_tags_addresses() {
        let mut manager = ConnectionManager::new(transport());
        manager
            .start_listening(
                [spec("trainer", Capability::Power), spec("hrm", Capability::HeartRate)],
                Duration::from_secs(5),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        assert_eq!(manager.merge_readings(tx), 2);

        let mut addresses = HashSet::new();
        while addresses.len() < 2 {
            let tagged = rx.recv().await.unwrap();
            addresses.insert(tagged.address.to_string());
        }
        assert!(addresses.contains("trainer") && addresses.contains("hrm"));

        manager.stop().await;
    }
}
