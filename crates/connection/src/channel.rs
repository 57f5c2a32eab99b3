//! Per-handle reading channel with backpressure

use std::sync::Arc;

use async_channel::{bounded, Receiver, Sender, TrySendError};
use contracts::{DeviceAddress, RawReading};
use tracing::{trace, warn};

use crate::config::{ConnectionMetrics, DropPolicy, ReadingChannelConfig};

/// Producer side of one handle's reading stream.
///
/// Keeps a receiver clone so a full channel can evict its oldest reading
/// instead of stalling the device task.
#[derive(Clone)]
pub(crate) struct ReadingSender {
    tx: Sender<RawReading>,
    evict: Receiver<RawReading>,
    drop_policy: DropPolicy,
}

impl ReadingSender {
    pub(crate) fn channel(config: &ReadingChannelConfig) -> (Self, Receiver<RawReading>) {
        let (tx, rx) = bounded(config.capacity.max(1));
        let sender = Self {
            tx,
            evict: rx.clone(),
            drop_policy: config.drop_policy,
        };
        (sender, rx)
    }

    /// Send a reading, applying the drop policy when full. Never suspends.
    #[inline]
    pub(crate) fn send(
        &self,
        reading: RawReading,
        metrics: &Arc<ConnectionMetrics>,
        address: &DeviceAddress,
    ) {
        match self.tx.try_send(reading) {
            Ok(()) => {
                trace!(address = %address, key = %reading.key, value = reading.value, "reading queued");
            }
            Err(TrySendError::Full(reading)) => {
                metrics.record_dropped();
                observability::record_reading_dropped(address);
                match self.drop_policy {
                    DropPolicy::DropNewest => {
                        trace!(address = %address, "reading dropped (newest)");
                    }
                    DropPolicy::DropOldest => {
                        let _ = self.evict.try_recv();
                        if self.tx.try_send(reading).is_err() {
                            trace!(address = %address, "reading dropped (channel contended)");
                        } else {
                            trace!(address = %address, "reading dropped (oldest)");
                        }
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!(address = %address, "reading channel closed");
            }
        }
    }
}
