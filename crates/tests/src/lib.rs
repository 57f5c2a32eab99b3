//! # Integration Tests
//!
//! End-to-end scenarios across crates.
//!
//! Covers:
//! - Contract snapshots (wire format, config defaults)
//! - Connection lifecycle against the simulated transport (paused time)
//! - Aggregator -> distribution -> reconciler, in process and over WebSocket

#[cfg(test)]
mod contract_tests {
    use contracts::{MetricKey, MetricSample, RideInfo, TimeBase, WireFrame};

    #[test]
    fn test_wire_frames_snapshot() {
        let hello = WireFrame::Hello {
            ride: RideInfo {
                start_time: 1_700_000_000.0,
                duration_limit: 1800.0,
                time_base: TimeBase::Elapsed,
            },
        };
        assert_eq!(
            hello.to_json().unwrap(),
            r#"{"ride":{"start_time":1700000000.0,"duration_limit":1800.0,"time_base":"elapsed"}}"#
        );

        let sample = WireFrame::Sample(MetricSample::single(12.0, MetricKey::Power, 210.0));
        assert_eq!(sample.to_json().unwrap(), r#"{"timestamp":12.0,"power":210.0}"#);

        let marker = WireFrame::ReplayEnd { replay_end: 3 };
        assert_eq!(marker.to_json().unwrap(), r#"{"replay_end":3}"#);
    }

    #[test]
    fn test_config_defaults() {
        let blueprint = config_loader::ConfigLoader::load_from_str(
            r#"
[ride]
duration_minutes = 30

[[devices]]
address = "trainer"
capability = "power"
"#,
            config_loader::ConfigFormat::Toml,
        )
        .unwrap();
        assert_eq!(blueprint.reconnect.max_attempts, 3);
        assert_eq!(blueprint.reconnect.backoff_secs, 2.0);
        assert_eq!(blueprint.ride.time_base, TimeBase::Elapsed);
    }
}

#[cfg(test)]
mod connection_tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use connection::{ConnectionManager, ManagerError, SimulatedClock, SimulatedDevice, SimulatedTransport};
    use contracts::{Capability, ConnectionState, DeviceAddress, DeviceSpec, StateTransition};
    use telemetry::RideSession;
    use tokio::sync::{broadcast, mpsc};

    const EPOCH: f64 = 1_700_000_000.0;

    fn transport() -> SimulatedTransport {
        SimulatedTransport::new(SimulatedClock::starting_at(EPOCH)).with_seed(7)
    }

    fn drain(rx: &mut broadcast::Receiver<StateTransition>) -> Vec<StateTransition> {
        let mut seen = Vec::new();
        while let Ok(transition) = rx.try_recv() {
            seen.push(transition);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_three_devices() {
        let transport = transport().with_device("hrm", SimulatedDevice::never_appears());
        let mut manager = ConnectionManager::new(transport);

        let result = manager
            .start_listening(
                [
                    DeviceSpec::new("trainer", Capability::Power),
                    DeviceSpec::new("cadence", Capability::Cadence),
                    DeviceSpec::new("hrm", Capability::HeartRate),
                ],
                Duration::from_secs(5),
            )
            .unwrap()
            .finish()
            .await;

        let Err(ManagerError::DiscoveryTimeout {
            missing, connected, ..
        }) = result
        else {
            panic!("expected DiscoveryTimeout, got {result:?}");
        };
        assert_eq!(missing, vec![DeviceAddress::from("hrm")]);
        assert_eq!(connected.len(), 2);

        for address in ["trainer", "cadence"] {
            assert_eq!(manager.status(address).unwrap().state, ConnectionState::Connected);
        }
        assert_eq!(manager.status("hrm").unwrap().state, ConnectionState::Failed);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handle_makes_no_further_attempts() {
        let transport = transport().with_device("hrm", SimulatedDevice::flaky(3, 3));
        let mut manager = ConnectionManager::new(transport);
        let mut rx = manager.subscribe_transitions();

        manager
            .start_listening([DeviceSpec::new("hrm", Capability::HeartRate)], Duration::from_secs(5))
            .unwrap()
            .finish()
            .await
            .unwrap();

        // 3 readings, then 3 attempts 2s apart
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(manager.status("hrm").unwrap().state, ConnectionState::Failed);
        let attempts = manager.metrics().reconnect_attempts;
        assert_eq!(attempts, 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.metrics().reconnect_attempts, attempts);
        assert_eq!(manager.transport().connect_count("hrm"), 1);

        let failed = drain(&mut rx)
            .into_iter()
            .filter(|t| t.current == ConnectionState::Failed)
            .count();
        assert_eq!(failed, 1);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_handle_holds_one_state_at_a_time() {
        let transport = transport()
            .with_device("speed", SimulatedDevice::flaky(4, 1))
            .with_device("hrm", SimulatedDevice::flaky(2, 5))
            .with_device("cadence", SimulatedDevice::appears_after(Duration::from_secs(1)));
        let mut manager = ConnectionManager::new(transport);
        let mut rx = manager.subscribe_transitions();

        manager
            .start_listening(
                [
                    DeviceSpec::new("trainer", Capability::Power),
                    DeviceSpec::new("speed", Capability::Speed),
                    DeviceSpec::new("hrm", Capability::HeartRate),
                    DeviceSpec::new("cadence", Capability::Cadence),
                ],
                Duration::from_secs(5),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();
        // Off the whole-second grid every simulated event lands on
        tokio::time::sleep(Duration::from_millis(30_500)).await;

        // Every transition starts from the state the handle was last seen in
        let mut current: HashMap<DeviceAddress, ConnectionState> = HashMap::new();
        for transition in drain(&mut rx) {
            if let Some(previous) = transition.previous {
                assert_eq!(
                    current.get(&transition.address),
                    Some(&previous),
                    "{transition}"
                );
            }
            current.insert(transition.address.clone(), transition.current);
        }

        for (spec, status) in manager.states() {
            assert_eq!(current.get(&spec.address), Some(&status.state), "{}", spec.address);
        }
        assert_eq!(current.get("hrm"), Some(&ConnectionState::Failed));
        assert_eq!(current.get("trainer"), Some(&ConnectionState::Connected));
        assert!(manager.metrics().drops >= 3);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeline_is_append_only_across_handles() {
        let transport = transport()
            .with_device("trainer", SimulatedDevice::default().with_rate(4.0))
            .with_device("hrm", SimulatedDevice::flaky(5, 1).with_rate(2.0))
            .with_device("cadence", SimulatedDevice::default().with_rate(3.0));
        let clock = transport.clock();
        let mut manager = ConnectionManager::new(transport);

        let (session, aggregator) =
            RideSession::begin(clock.now(), 600.0, contracts::TimeBase::Elapsed);
        manager
            .start_listening(
                [
                    DeviceSpec::new("trainer", Capability::Power),
                    DeviceSpec::new("hrm", Capability::HeartRate),
                    DeviceSpec::new("cadence", Capability::Cadence),
                ],
                Duration::from_secs(5),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(64);
        assert_eq!(manager.merge_readings(tx), 3);
        let writer = tokio::spawn(aggregator.run(rx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let early = session.reader().snapshot();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let late = session.reader().snapshot();

        manager.stop().await;
        let stats = writer.await.unwrap();

        assert!(!early.is_empty());
        assert!(late.len() > early.len());
        assert_eq!(&late[..early.len()], &early[..]);
        assert!(late
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
        assert_eq!(stats.per_device.len(), 3);
        assert_eq!(stats.rejected(), 0);
        assert!(session.reader().is_closed());
    }
}

#[cfg(test)]
mod pipeline_tests {
    use std::sync::{Arc, Mutex};

    use contracts::{ContractError, DeviceAddress, MetricKey, TimeBase, ViewerSink, WireFrame};
    use distribution::{DistributionConfig, DistributionService, Subscription, ViewerExit, ViewerHandle};
    use reconciler::{ChartUpdate, Reconciler, ReconcilerConfig};
    use telemetry::{RideSession, TelemetryAggregator};
    use tokio::time::Instant;

    const START: f64 = 1_700_000_000.0;

    fn ride(time_base: TimeBase) -> (RideSession, TelemetryAggregator, DistributionService) {
        let (session, aggregator) = RideSession::begin(START, 600.0, time_base);
        let service = DistributionService::new(
            session.reader().clone(),
            *session.info(),
            DistributionConfig {
                time_base,
                ..Default::default()
            },
        );
        (session, aggregator, service)
    }

    /// Frames up to and including the end-of-replay marker.
    async fn replay(subscription: &mut Subscription) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = subscription.next_frame().await {
            let done = frame.is_replay_end();
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    }

    fn ingest_all(reconciler: &mut Reconciler, frames: Vec<WireFrame>) -> Vec<ChartUpdate> {
        frames
            .into_iter()
            .flat_map(|frame| reconciler.ingest(frame, Instant::now()))
            .collect()
    }

    #[tokio::test]
    async fn test_replay_then_live_ordering() {
        let (_session, mut aggregator, service) = ride(TimeBase::Elapsed);
        let trainer: DeviceAddress = "trainer".into();
        for (t, v) in [(20.0, 200.0), (5.0, 100.0), (15.0, 150.0)] {
            aggregator.observe(&trainer, MetricKey::Power, v, START + t);
        }

        let mut subscription = service.subscribe();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        let updates = ingest_all(&mut reconciler, replay(&mut subscription).await);
        assert_eq!(updates, vec![ChartUpdate::Redraw]);

        aggregator.observe(&trainer, MetricKey::Power, 250.0, START + 25.0);
        let live = subscription.next_frame().await.unwrap();
        reconciler.ingest(live, Instant::now());

        assert_eq!(
            reconciler.points(MetricKey::Power),
            vec![(5.0, 100.0), (15.0, 150.0), (20.0, 200.0), (25.0, 250.0)]
        );
    }

    #[tokio::test]
    async fn test_late_join_receives_everything_once() {
        let (_session, mut aggregator, service) = ride(TimeBase::Epoch);
        let trainer: DeviceAddress = "trainer".into();
        let hrm: DeviceAddress = "hrm".into();
        for i in 0..40u32 {
            let t = START + f64::from(i) * 1.5;
            aggregator.observe(&trainer, MetricKey::Power, 180.0 + f64::from(i), t);
            aggregator.observe(&hrm, MetricKey::HeartRate, 120.0 + f64::from(i % 7), t + 0.2);
        }

        let mut subscription = service.subscribe();
        let frames = replay(&mut subscription).await;

        let samples = frames
            .iter()
            .filter(|f| matches!(f, WireFrame::Sample(_)))
            .count();
        assert_eq!(samples, 80);
        assert_eq!(frames.last(), Some(&WireFrame::ReplayEnd { replay_end: 80 }));

        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        ingest_all(&mut reconciler, frames);

        for key in [MetricKey::Power, MetricKey::HeartRate] {
            let points = reconciler.points(key);
            assert_eq!(points.len(), 40, "{key}");
            assert!(points.windows(2).all(|p| p[1].0 - p[0].0 >= 1.0), "{key}");
        }
        // Epoch timestamps on the wire come back as elapsed
        assert_eq!(reconciler.points(MetricKey::Power)[0], (0.0, 180.0));
    }

    #[tokio::test]
    async fn test_same_sample_twice_merges() {
        let (_session, mut aggregator, service) = ride(TimeBase::Elapsed);
        let trainer: DeviceAddress = "trainer".into();
        aggregator.observe(&trainer, MetricKey::Power, 200.0, START + 10.0);

        let mut subscription = service.subscribe();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        ingest_all(&mut reconciler, replay(&mut subscription).await);

        aggregator.observe(&trainer, MetricKey::Power, 200.0, START + 10.0);
        aggregator.observe(&trainer, MetricKey::Power, 205.0, START + 10.6);
        for _ in 0..2 {
            let frame = subscription.next_frame().await.unwrap();
            reconciler.ingest(frame, Instant::now());
        }

        assert_eq!(reconciler.points(MetricKey::Power), vec![(10.0, 205.0)]);
        assert_eq!(reconciler.stats().merged, 2);
    }

    #[tokio::test]
    async fn test_out_of_window_samples_never_plotted() {
        let (session, mut aggregator) = RideSession::begin(START, 60.0, TimeBase::Elapsed);
        let service = DistributionService::new(
            session.reader().clone(),
            *session.info(),
            DistributionConfig::default(),
        );
        let trainer: DeviceAddress = "trainer".into();
        for t in [-3.0, 0.0, 30.0, 60.0, 61.0, 90.0] {
            aggregator.observe(&trainer, MetricKey::Power, 150.0, START + t);
        }
        assert_eq!(aggregator.stats().before_ride_start, 1);

        let mut subscription = service.subscribe();
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        ingest_all(&mut reconciler, replay(&mut subscription).await);

        let points = reconciler.points(MetricKey::Power);
        assert_eq!(
            points.iter().map(|p| p.0).collect::<Vec<_>>(),
            vec![0.0, 30.0, 60.0]
        );
        assert_eq!(reconciler.stats().out_of_window, 2);
    }

    #[tokio::test]
    async fn test_resubscribe_rebuilds_without_duplicates() {
        let (_session, mut aggregator, service) = ride(TimeBase::Elapsed);
        let trainer: DeviceAddress = "trainer".into();
        for t in 0..10 {
            aggregator.observe(&trainer, MetricKey::Speed, 25.0, START + f64::from(t) * 2.0);
        }

        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        let mut first = service.subscribe();
        ingest_all(&mut reconciler, replay(&mut first).await);
        drop(first);

        aggregator.observe(&trainer, MetricKey::Speed, 26.0, START + 20.0);
        let mut second = service.subscribe();
        ingest_all(&mut reconciler, replay(&mut second).await);

        assert_eq!(reconciler.points(MetricKey::Speed).len(), 11);
        assert_eq!(reconciler.stats().replays, 2);
    }

    struct RecordingSink {
        name: String,
        frames: Arc<Mutex<Vec<WireFrame>>>,
        fail_after: Option<usize>,
    }

    impl ViewerSink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&mut self, frame: &WireFrame) -> Result<(), ContractError> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.is_some_and(|n| frames.len() >= n) {
                return Err(ContractError::transport_lost(&self.name, "viewer went away"));
            }
            frames.push(frame.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ContractError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lost_viewer_does_not_affect_others() {
        let (_session, mut aggregator, service) = ride(TimeBase::Elapsed);
        let trainer: DeviceAddress = "trainer".into();
        for t in 0..5 {
            aggregator.observe(&trainer, MetricKey::Cadence, 85.0, START + f64::from(t));
        }

        let healthy_frames = Arc::new(Mutex::new(Vec::new()));
        let healthy = ViewerHandle::spawn(
            RecordingSink {
                name: "healthy".into(),
                frames: Arc::clone(&healthy_frames),
                fail_after: None,
            },
            service.subscribe(),
        );
        let flaky = ViewerHandle::spawn(
            RecordingSink {
                name: "flaky".into(),
                frames: Arc::new(Mutex::new(Vec::new())),
                fail_after: Some(2),
            },
            service.subscribe(),
        );

        assert!(matches!(flaky.join().await, ViewerExit::TransportLost(_)));

        for t in 5..8 {
            aggregator.observe(&trainer, MetricKey::Cadence, 90.0, START + f64::from(t));
        }
        drop(aggregator);

        assert_eq!(healthy.join().await, ViewerExit::RideEnded);
        let frames = healthy_frames.lock().unwrap();
        let samples = frames
            .iter()
            .filter(|f| matches!(f, WireFrame::Sample(_)))
            .count();
        assert_eq!(samples, 8);
    }
}

#[cfg(test)]
mod websocket_e2e {
    use std::sync::Arc;
    use std::time::Duration;

    use connection::{ConnectionManager, SimulatedClock, SimulatedDevice, SimulatedTransport};
    use contracts::{Capability, DeviceSpec, MetricKey, RideRecorder, TimeBase};
    use distribution::{DistributionConfig, DistributionServer, DistributionService};
    use reconciler::{ClientExit, Phase, Reconciler, ReconcilerConfig, ViewerClient};
    use telemetry::{epoch_now, JsonLinesRecorder, RideSession};
    use tokio::sync::{mpsc, watch};

    #[tokio::test]
    async fn test_simulated_ride_reaches_late_viewer() {
        let transport = SimulatedTransport::new(SimulatedClock::system())
            .with_default_profile(SimulatedDevice::default().with_rate(20.0));
        let mut manager = ConnectionManager::new(transport);
        let (session, aggregator) = RideSession::begin(epoch_now(), 600.0, TimeBase::Elapsed);

        manager
            .start_listening(
                [
                    DeviceSpec::new("trainer", Capability::Power),
                    DeviceSpec::new("hrm", Capability::HeartRate),
                ],
                Duration::from_secs(2),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(256);
        manager.merge_readings(tx);
        let writer = tokio::spawn(aggregator.run(rx));

        let (stop_tx, stop_rx) = watch::channel(false);
        let service = Arc::new(DistributionService::new(
            session.reader().clone(),
            *session.info(),
            DistributionConfig::default(),
        ));
        let server = DistributionServer::bind("127.0.0.1:0", service, stop_rx.clone())
            .await
            .unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let server_task = tokio::spawn(server.run());

        // Join late
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let viewer = tokio::spawn(async move {
            let mut reconciler = Reconciler::new(ReconcilerConfig::default());
            let exit = ViewerClient::new(url)
                .run(&mut reconciler, stop_rx, |_, _| {})
                .await;
            (exit, reconciler)
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;

        manager.stop().await;
        let stats = writer.await.unwrap();
        stop_tx.send_replace(true);
        let report = server_task.await.unwrap().unwrap();
        let (exit, reconciler) = viewer.await.unwrap();

        assert!(matches!(
            exit,
            Ok(ClientExit::Closed) | Ok(ClientExit::Shutdown)
        ));
        assert_eq!(report.accepted, 1);
        assert_eq!(reconciler.phase(), Phase::Live);
        assert_eq!(reconciler.stats().replays, 1);
        for key in [MetricKey::Power, MetricKey::Speed, MetricKey::Cadence, MetricKey::HeartRate] {
            let points = reconciler.points(key);
            assert!(!points.is_empty(), "{key}");
            assert!(points.windows(2).all(|p| p[1].0 - p[0].0 >= 1.0), "{key}");
        }

        let dir = tempfile::tempdir().unwrap();
        let completed = session.finish(epoch_now());
        assert_eq!(completed.samples.len() as u64, stats.appended);
        let path = JsonLinesRecorder::new(dir.path())
            .record(&completed)
            .await
            .unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written.lines().count(), completed.samples.len() + 1);
    }
}
