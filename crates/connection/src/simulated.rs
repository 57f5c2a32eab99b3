//! Simulated device transport
//!
//! Stands in for real sensors in tests and demo rides. Each address can be
//! scripted to appear late, never appear, lose its link after a number of
//! readings, or refuse reconnection attempts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use contracts::{
    Capability, DeviceAddress, DeviceLink, DeviceSpec, DeviceTransport, LinkError, MetricKey,
    RawReading, SimulationConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace};

/// Scripted behaviour of one simulated device
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    /// Delay (from transport creation) before the device is discoverable
    pub appear_after: Duration,

    /// Never discoverable
    pub never_appears: bool,

    /// Lose the link after this many readings, on every connection
    pub drop_after_readings: Option<u64>,

    /// Reconnect attempts refused after each loss
    pub refuse_reconnects: u32,

    /// Reading ticks per second
    pub rate_hz: f64,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            appear_after: Duration::ZERO,
            never_appears: false,
            drop_after_readings: None,
            refuse_reconnects: 0,
            rate_hz: 1.0,
        }
    }
}

impl SimulatedDevice {
    pub fn never_appears() -> Self {
        Self {
            never_appears: true,
            ..Default::default()
        }
    }

    pub fn appears_after(delay: Duration) -> Self {
        Self {
            appear_after: delay,
            ..Default::default()
        }
    }

    /// Drops after `readings`, then refuses `refusals` reconnects.
    pub fn flaky(readings: u64, refusals: u32) -> Self {
        Self {
            drop_after_readings: Some(readings),
            refuse_reconnects: refusals,
            ..Default::default()
        }
    }

    pub fn with_rate(mut self, rate_hz: f64) -> Self {
        self.rate_hz = rate_hz;
        self
    }
}

impl From<&SimulationConfig> for SimulatedDevice {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            appear_after: Duration::from_secs_f64(config.appear_after_secs),
            never_appears: config.never_appears,
            drop_after_readings: config.drop_after_readings,
            refuse_reconnects: config.refuse_reconnects,
            rate_hz: config.rate_hz.unwrap_or(1.0),
        }
    }
}

/// Epoch clock that follows tokio time, so paused-time tests stay consistent.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedClock {
    epoch_origin: f64,
    origin: Instant,
}

impl SimulatedClock {
    /// Anchored at the current wall-clock time.
    pub fn system() -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self::starting_at(epoch)
    }

    pub fn starting_at(epoch_origin: f64) -> Self {
        Self {
            epoch_origin,
            origin: Instant::now(),
        }
    }

    /// Epoch seconds now.
    pub fn now(&self) -> f64 {
        self.epoch_origin + self.origin.elapsed().as_secs_f64()
    }

    pub fn epoch_origin(&self) -> f64 {
        self.epoch_origin
    }

    fn elapsed(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    connects: u64,
    pending_refusals: u32,
    severed: bool,
}

type SharedState = Arc<Mutex<HashMap<DeviceAddress, DeviceState>>>;

fn lock(state: &SharedState) -> MutexGuard<'_, HashMap<DeviceAddress, DeviceState>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated transport
pub struct SimulatedTransport {
    profiles: HashMap<DeviceAddress, SimulatedDevice>,
    default_profile: SimulatedDevice,
    state: SharedState,
    clock: SimulatedClock,
    seed: Option<u64>,
}

impl SimulatedTransport {
    pub fn new(clock: SimulatedClock) -> Self {
        Self {
            profiles: HashMap::new(),
            default_profile: SimulatedDevice::default(),
            state: Arc::new(Mutex::new(HashMap::new())),
            clock,
            seed: None,
        }
    }

    /// Script one address; unscripted addresses use the default profile.
    pub fn with_device(mut self, address: impl Into<DeviceAddress>, device: SimulatedDevice) -> Self {
        self.profiles.insert(address.into(), device);
        self
    }

    pub fn with_default_profile(mut self, device: SimulatedDevice) -> Self {
        self.default_profile = device;
        self
    }

    /// Deterministic noise.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn clock(&self) -> SimulatedClock {
        self.clock
    }

    /// Successful connections made to `address` so far.
    pub fn connect_count(&self, address: &str) -> u64 {
        lock(&self.state).get(address).map(|s| s.connects).unwrap_or(0)
    }

    /// Cut the current link to `address` at its next tick.
    pub fn sever(&self, address: &str) {
        lock(&self.state)
            .entry(address.into())
            .or_default()
            .severed = true;
    }

    fn profile(&self, address: &str) -> SimulatedDevice {
        self.profiles
            .get(address)
            .cloned()
            .unwrap_or_else(|| self.default_profile.clone())
    }

    fn rng(&self, address: &str) -> StdRng {
        match self.seed {
            Some(seed) => {
                let salt = address.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
                StdRng::seed_from_u64(seed ^ salt)
            }
            None => StdRng::from_os_rng(),
        }
    }
}

impl DeviceTransport for SimulatedTransport {
    type Link = SimulatedLink;

    async fn discover(&self, spec: &DeviceSpec) -> Result<(), LinkError> {
        let profile = self.profile(&spec.address);
        if profile.never_appears {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep_until(self.clock.origin + profile.appear_after).await;
        trace!(address = %spec.address, "simulated device discovered");
        Ok(())
    }

    async fn connect(&self, spec: &DeviceSpec) -> Result<SimulatedLink, LinkError> {
        let profile = self.profile(&spec.address);
        if profile.never_appears {
            return Err(LinkError::NotFound);
        }

        {
            let mut devices = lock(&self.state);
            let device = devices.entry(spec.address.clone()).or_default();
            if device.pending_refusals > 0 {
                device.pending_refusals -= 1;
                debug!(address = %spec.address, remaining = device.pending_refusals, "simulated connect refused");
                return Err(LinkError::connect_failed("device refused connection"));
            }
            device.connects += 1;
            device.severed = false;
        }

        let mut ticker = interval(Duration::from_secs_f64(1.0 / profile.rate_hz.max(0.01)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(SimulatedLink {
            address: spec.address.clone(),
            keys: keys_for(spec.capability),
            remaining: profile.drop_after_readings,
            refusals_after_drop: profile.refuse_reconnects,
            ticker,
            pending: VecDeque::new(),
            rng: self.rng(&spec.address),
            clock: self.clock,
            state: self.state.clone(),
        })
    }
}

/// A trainer configured for power also reports speed and cadence.
fn keys_for(capability: Capability) -> Vec<MetricKey> {
    match capability {
        Capability::Power => vec![MetricKey::Power, MetricKey::Speed, MetricKey::Cadence],
        other => vec![other.metric_key()],
    }
}

/// Link to a simulated device
pub struct SimulatedLink {
    address: DeviceAddress,
    keys: Vec<MetricKey>,
    remaining: Option<u64>,
    refusals_after_drop: u32,
    ticker: Interval,
    pending: VecDeque<RawReading>,
    rng: StdRng,
    clock: SimulatedClock,
    state: SharedState,
}

impl SimulatedLink {
    fn lose(&mut self, reason: &str) -> LinkError {
        let mut devices = lock(&self.state);
        let device = devices.entry(self.address.clone()).or_default();
        device.pending_refusals = self.refusals_after_drop;
        device.severed = false;
        debug!(address = %self.address, reason, "simulated link lost");
        LinkError::dropped(reason.to_string())
    }

    fn is_severed(&self) -> bool {
        lock(&self.state)
            .get(&self.address)
            .map(|s| s.severed)
            .unwrap_or(false)
    }

    fn generate(&mut self) {
        let t = self.clock.elapsed();
        let now = self.clock.now();
        for key in self.keys.clone() {
            let value = sample_value(&mut self.rng, key, t);
            self.pending.push_back(RawReading::new(key, value, now));
        }
    }
}

impl DeviceLink for SimulatedLink {
    async fn next_reading(&mut self) -> Result<RawReading, LinkError> {
        loop {
            if let Some(reading) = self.pending.pop_front() {
                if let Some(remaining) = self.remaining.as_mut() {
                    if *remaining == 0 {
                        self.pending.clear();
                        return Err(self.lose("signal lost"));
                    }
                    *remaining -= 1;
                }
                return Ok(reading);
            }

            self.ticker.tick().await;
            if self.is_severed() {
                return Err(self.lose("severed"));
            }
            self.generate();
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.pending.clear();
        Ok(())
    }
}

/// Sine wave plus noise around typical riding values.
fn sample_value(rng: &mut StdRng, key: MetricKey, t: f64) -> f64 {
    match key {
        MetricKey::Power => (150.0 + (t * 0.1).sin() * 20.0 + rng.random_range(-10.0..10.0)).max(0.0),
        MetricKey::Speed => (25.0 + (t * 0.08).sin() * 5.0 + rng.random_range(-2.0..2.0)).max(0.0),
        MetricKey::Cadence => {
            (80.0 + (t * 0.12).sin() * 10.0 + rng.random_range(-5.0..5.0)).max(0.0)
        }
        MetricKey::HeartRate => {
            (130.0 + (t * 0.06).sin() * 15.0 + rng.random_range(-5.0..5.0)).max(60.0)
        }
    }
}
