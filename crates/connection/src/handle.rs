//! Per-handle task: discovery, connection, reading pump and reconnection.
//!
//! ```text
//! AwaitingDevice -> Connecting -> Connected
//!        ^              |            |
//!        +--(error)-----+            | link lost
//!                                    v
//!            Connected <- Connecting <- Disconnected  (up to N attempts, backoff apart)
//!                              |
//!                              +-> Disconnected -> ... -> Failed
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use contracts::{
    ConnectionState, DeviceLink, DeviceSpec, DeviceTransport, LinkError, StateTransition,
};
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::channel::ReadingSender;
use crate::config::{ConnectionMetrics, ReconnectPolicy};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Current state of a handle plus the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleStatus {
    pub state: ConnectionState,
    pub previous: Option<ConnectionState>,
    /// Reconnection attempt the state belongs to, if any
    pub attempt: Option<u32>,
}

impl HandleStatus {
    pub(crate) fn initial() -> Self {
        Self {
            state: ConnectionState::AwaitingDevice,
            previous: None,
            attempt: None,
        }
    }

    pub(crate) fn restarted(from: ConnectionState) -> Self {
        Self {
            state: ConnectionState::AwaitingDevice,
            previous: Some(from),
            attempt: None,
        }
    }
}

/// Shared pieces every handle task needs.
pub(crate) struct HandleContext<T> {
    pub transport: Arc<T>,
    pub policy: ReconnectPolicy,
    pub transitions: broadcast::Sender<StateTransition>,
    pub shutdown: watch::Receiver<bool>,
    pub metrics: Arc<ConnectionMetrics>,
}

impl<T> Clone for HandleContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            policy: self.policy,
            transitions: self.transitions.clone(),
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

enum Interrupt {
    Shutdown,
    Deadline,
}

enum PumpExit {
    Shutdown,
    Dropped(LinkError),
}

/// Resolves once stop is requested or the manager is gone.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Suspend on `fut`, giving up on shutdown or once `deadline` passes.
async fn guarded<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, Interrupt> {
    let expiry = async {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = stop_requested(shutdown) => Err(Interrupt::Shutdown),
        _ = expiry => Err(Interrupt::Deadline),
        out = fut => Ok(out),
    }
}

pub(crate) struct HandleTask<T: DeviceTransport> {
    spec: DeviceSpec,
    ctx: HandleContext<T>,
    status: Arc<watch::Sender<HandleStatus>>,
    readings: ReadingSender,
    connect_deadline: Instant,
}

impl<T> HandleTask<T>
where
    T: DeviceTransport + Sync + 'static,
{
    pub(crate) fn new(
        spec: DeviceSpec,
        ctx: HandleContext<T>,
        status: Arc<watch::Sender<HandleStatus>>,
        readings: ReadingSender,
        connect_deadline: Instant,
    ) -> Self {
        Self {
            spec,
            ctx,
            status,
            readings,
            connect_deadline,
        }
    }

    #[instrument(
        name = "device_handle",
        skip(self),
        fields(address = %self.spec.address, capability = %self.spec.capability)
    )]
    pub(crate) async fn run(mut self) {
        self.announce();

        let Some(mut link) = self.establish().await else {
            return;
        };

        loop {
            match self.pump(&mut link).await {
                PumpExit::Shutdown => {
                    self.release(&mut link).await;
                    self.mark_stopped();
                    return;
                }
                PumpExit::Dropped(err) => {
                    self.ctx.metrics.record_drop();
                    self.release(&mut link).await;
                    self.transition(ConnectionState::Disconnected, None, Some(err.to_string()));

                    match self.reconnect().await {
                        Some(next) => link = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Initial discovery and connection, retried until the listen deadline.
    async fn establish(&mut self) -> Option<T::Link> {
        let deadline = Some(self.connect_deadline);

        loop {
            let found = match guarded(
                &mut self.ctx.shutdown,
                deadline,
                self.ctx.transport.discover(&self.spec),
            )
            .await
            {
                Ok(found) => found,
                Err(interrupt) => return self.interrupted(interrupt),
            };

            if let Err(err) = found {
                debug!(error = %err, "device not discoverable yet");
                if let Err(interrupt) =
                    guarded(&mut self.ctx.shutdown, deadline, sleep(self.ctx.policy.backoff)).await
                {
                    return self.interrupted(interrupt);
                }
                continue;
            }

            self.transition(ConnectionState::Connecting, None, None);

            let connected = match guarded(
                &mut self.ctx.shutdown,
                deadline,
                self.ctx.transport.connect(&self.spec),
            )
            .await
            {
                Ok(connected) => connected,
                Err(interrupt) => return self.interrupted(interrupt),
            };

            match connected {
                Ok(link) => {
                    self.ctx.metrics.record_connect();
                    self.transition(ConnectionState::Connected, None, None);
                    return Some(link);
                }
                Err(err) => {
                    self.transition(
                        ConnectionState::AwaitingDevice,
                        None,
                        Some(err.to_string()),
                    );
                    if let Err(interrupt) =
                        guarded(&mut self.ctx.shutdown, deadline, sleep(self.ctx.policy.backoff))
                            .await
                    {
                        return self.interrupted(interrupt);
                    }
                }
            }
        }
    }

    fn interrupted(&mut self, interrupt: Interrupt) -> Option<T::Link> {
        match interrupt {
            Interrupt::Shutdown => self.mark_stopped(),
            Interrupt::Deadline => {
                self.ctx.metrics.record_failure();
                self.transition(
                    ConnectionState::Failed,
                    None,
                    Some("discovery timeout".to_string()),
                );
            }
        }
        None
    }

    /// Forward readings until the link drops or the manager stops.
    async fn pump(&mut self, link: &mut T::Link) -> PumpExit {
        loop {
            match guarded(&mut self.ctx.shutdown, None, link.next_reading()).await {
                Err(_) => return PumpExit::Shutdown,
                Ok(Err(err)) => return PumpExit::Dropped(err),
                Ok(Ok(reading)) => {
                    self.ctx.metrics.record_received();
                    observability::record_reading_received(&self.spec.address, reading.key);
                    self.readings
                        .send(reading, &self.ctx.metrics, &self.spec.address);
                }
            }
        }
    }

    /// Bounded retries after a drop. `None` means failed or stopped.
    async fn reconnect(&mut self) -> Option<T::Link> {
        let policy = self.ctx.policy;

        for attempt in 1..=policy.max_attempts {
            if guarded(&mut self.ctx.shutdown, None, sleep(policy.backoff))
                .await
                .is_err()
            {
                self.mark_stopped();
                return None;
            }

            self.ctx.metrics.record_reconnect_attempt();
            self.transition(ConnectionState::Connecting, Some(attempt), None);

            match guarded(
                &mut self.ctx.shutdown,
                None,
                self.ctx.transport.connect(&self.spec),
            )
            .await
            {
                Err(_) => {
                    self.mark_stopped();
                    return None;
                }
                Ok(Ok(link)) => {
                    self.ctx.metrics.record_connect();
                    self.transition(ConnectionState::Connected, Some(attempt), None);
                    return Some(link);
                }
                Ok(Err(err)) => {
                    self.transition(
                        ConnectionState::Disconnected,
                        Some(attempt),
                        Some(err.to_string()),
                    );
                }
            }
        }

        self.ctx.metrics.record_failure();
        self.transition(
            ConnectionState::Failed,
            None,
            Some(format!(
                "reconnect failed after {} attempts",
                policy.max_attempts
            )),
        );
        None
    }

    async fn release(&self, link: &mut T::Link) {
        match tokio::time::timeout(DISCONNECT_GRACE, link.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "disconnect reported an error"),
            Err(_) => warn!("disconnect timed out"),
        }
    }

    /// Publish the state the handle starts in.
    fn announce(&self) {
        let status = *self.status.borrow();
        self.publish(StateTransition {
            address: self.spec.address.clone(),
            capability: self.spec.capability,
            previous: status.previous,
            current: status.state,
            attempt: None,
            reason: None,
        });
    }

    fn transition(&self, next: ConnectionState, attempt: Option<u32>, reason: Option<String>) {
        let previous = self.status.borrow().state;
        let transition = StateTransition {
            address: self.spec.address.clone(),
            capability: self.spec.capability,
            previous: Some(previous),
            current: next,
            attempt,
            reason,
        };

        match next {
            ConnectionState::Connected => {
                info!(attempt = ?attempt, "device connected");
            }
            ConnectionState::Failed => {
                error!(reason = ?transition.reason, "device failed");
            }
            ConnectionState::Disconnected if transition.is_fresh_loss() => {
                warn!(reason = ?transition.reason, "device connection lost, reconnecting");
            }
            ConnectionState::Disconnected => {
                warn!(attempt = ?attempt, reason = ?transition.reason, "reconnect attempt failed");
            }
            _ => {
                debug!(from = %previous, to = %next, attempt = ?attempt, "state transition");
            }
        }

        observability::record_connection_transition(&transition);
        // Broadcast before the status update: a listener that sees the new
        // status is guaranteed to find the event already queued.
        self.publish(transition);
        self.status.send_replace(HandleStatus {
            state: next,
            previous: Some(previous),
            attempt,
        });
    }

    fn publish(&self, transition: StateTransition) {
        // No subscribers is fine.
        let _ = self.ctx.transitions.send(transition);
    }

    /// Quietly leave the handle `Disconnected` after a requested stop.
    fn mark_stopped(&self) {
        self.status.send_modify(|status| {
            if status.state != ConnectionState::Failed {
                *status = HandleStatus {
                    state: ConnectionState::Disconnected,
                    previous: Some(status.state),
                    attempt: None,
                };
            }
        });
        debug!("handle stopped");
    }
}
