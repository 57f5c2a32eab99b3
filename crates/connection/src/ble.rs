//! Bluetooth LE transport (feature `ble`)
//!
//! Devices are matched by peripheral id or advertised local name. Trainers
//! speak FTMS Indoor Bike Data, cadence sensors CSC Measurement and heart
//! rate monitors Heart Rate Measurement.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, ValueNotification};
use btleplug::platform::{Adapter, Manager, Peripheral};
use contracts::{
    Capability, DeviceLink, DeviceSpec, DeviceTransport, LinkError, MetricKey, RawReading,
};
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decode::{decode_heart_rate, decode_indoor_bike, CrankCadence, DecodeError};

const FITNESS_MACHINE_SERVICE: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);
const INDOOR_BIKE_DATA: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);
const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);
const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);
const CSC_SERVICE: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);
const CSC_MEASUREMENT: Uuid = Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

const SCAN_POLL: Duration = Duration::from_millis(500);

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn service_for(capability: Capability) -> Uuid {
    match capability {
        Capability::Power | Capability::Speed => FITNESS_MACHINE_SERVICE,
        Capability::Cadence => CSC_SERVICE,
        Capability::HeartRate => HEART_RATE_SERVICE,
    }
}

fn characteristic_for(capability: Capability) -> Uuid {
    match capability {
        Capability::Power | Capability::Speed => INDOOR_BIKE_DATA,
        Capability::Cadence => CSC_MEASUREMENT,
        Capability::HeartRate => HEART_RATE_MEASUREMENT,
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Transport over the first host Bluetooth adapter
pub struct BleTransport {
    adapter: Adapter,
}

impl BleTransport {
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::Unsupported(e.to_string()))?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| LinkError::Unsupported(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Unsupported("no bluetooth adapter".to_string()))?;

        info!("bluetooth adapter initialized");
        Ok(Self { adapter })
    }

    async fn find(&self, spec: &DeviceSpec) -> Result<Option<Peripheral>, LinkError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| LinkError::connect_failed(e.to_string()))?;

        for peripheral in peripherals {
            if peripheral.id().to_string() == spec.address.as_str() {
                return Ok(Some(peripheral));
            }
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name);
            if name.is_some_and(|n| n.eq_ignore_ascii_case(spec.address.as_str())) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

impl DeviceTransport for BleTransport {
    type Link = BleLink;

    async fn discover(&self, spec: &DeviceSpec) -> Result<(), LinkError> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service_for(spec.capability)],
            })
            .await
            .map_err(|e| LinkError::Unsupported(e.to_string()))?;

        loop {
            if self.find(spec).await?.is_some() {
                debug!(address = %spec.address, "peripheral found");
                return Ok(());
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    }

    async fn connect(&self, spec: &DeviceSpec) -> Result<BleLink, LinkError> {
        let peripheral = self.find(spec).await?.ok_or(LinkError::NotFound)?;

        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::connect_failed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::connect_failed(e.to_string()))?;

        let wanted = characteristic_for(spec.capability);
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == wanted)
            .ok_or_else(|| LinkError::Unsupported(format!("characteristic {wanted} missing")))?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| LinkError::connect_failed(e.to_string()))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| LinkError::connect_failed(e.to_string()))?;

        Ok(BleLink {
            peripheral,
            notifications,
            decoder: Decoder::for_capability(spec.capability),
            capability: spec.capability,
            pending: VecDeque::new(),
        })
    }
}

enum Decoder {
    IndoorBike,
    Crank(CrankCadence),
    HeartRate,
}

impl Decoder {
    fn for_capability(capability: Capability) -> Self {
        match capability {
            Capability::Power | Capability::Speed => Self::IndoorBike,
            Capability::Cadence => Self::Crank(CrankCadence::new()),
            Capability::HeartRate => Self::HeartRate,
        }
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<(MetricKey, f64)>, DecodeError> {
        match self {
            Self::IndoorBike => decode_indoor_bike(payload),
            Self::Crank(state) => state.decode(payload),
            Self::HeartRate => decode_heart_rate(payload),
        }
    }
}

/// Subscribed notification stream of one peripheral
pub struct BleLink {
    peripheral: Peripheral,
    notifications: NotificationStream,
    decoder: Decoder,
    capability: Capability,
    pending: VecDeque<RawReading>,
}

impl BleLink {
    /// A trainer reports everything FTMS carries; other devices their own key.
    fn wants(&self, key: MetricKey) -> bool {
        self.capability == Capability::Power || self.capability.metric_key() == key
    }
}

impl DeviceLink for BleLink {
    async fn next_reading(&mut self) -> Result<RawReading, LinkError> {
        loop {
            if let Some(reading) = self.pending.pop_front() {
                return Ok(reading);
            }

            let notification = self
                .notifications
                .next()
                .await
                .ok_or_else(|| LinkError::dropped("notification stream ended"))?;

            match self.decoder.decode(&notification.value) {
                Ok(values) => {
                    let now = epoch_now();
                    for (key, value) in values {
                        if self.wants(key) {
                            self.pending.push_back(RawReading::new(key, value, now));
                        }
                    }
                }
                Err(err) => warn!(error = %err, "undecodable notification"),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| LinkError::dropped(e.to_string()))
    }
}
