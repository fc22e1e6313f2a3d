//! Connection lifecycle: connect, exponential backoff, cooldown and teardown.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_channel::mpsc::UnboundedReceiver;
use futures_util::StreamExt;
use relaychat_shared::ClientCommand;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::connection::{
    CloseReason, ConnectionState, ConnectionStatus, Connector, LinkEvent, TransportEvent, WsHandle,
};
use crate::config::{Credentials, ReconnectConfig};
use crate::error::SyncError;
use crate::timer::TimerHandle;

/// Result of a [`ConnectionManager::connect`] call. Transient failures are not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// Already connected or an attempt is in progress.
    AlreadyActive,
    /// Called again within the minimum inter-attempt interval.
    Throttled,
    /// Refused until the cooldown window elapses.
    CoolingDown,
    /// The attempt failed; a retry or cooldown has been scheduled.
    Failed,
    /// Superseded by a disconnect or a newer attempt while in flight.
    Abandoned,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Caller,
    Retry,
}

struct ConnInner {
    status: ConnectionStatus,
    credentials: Option<Credentials>,
    handle: Option<WsHandle>,
    /// Bumped on every attempt and on disconnect so stale results are dropped.
    generation: u64,
    intentional: bool,
    /// The server asked us to go away; the following close must not reconnect.
    server_requested: bool,
    retry_timer: TimerHandle,
    cooldown_timer: TimerHandle,
}

struct Shared {
    inner: Mutex<ConnInner>,
    config: ReconnectConfig,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<TransportEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
}

/// Owns the transport connection and its state machine.
///
/// Cheap to clone; clones share the same connection. The state is behind a
/// mutex because the retry timer and explicit callers both drive it.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: ReconnectConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(ConnInner {
                    status: ConnectionStatus::default(),
                    credentials: None,
                    handle: None,
                    generation: 0,
                    intentional: false,
                    server_requested: false,
                    retry_timer: TimerHandle::default(),
                    cooldown_timer: TimerHandle::default(),
                }),
                config,
                connector,
                events,
                status_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnInner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().status.state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Connectivity flag for callers; updated on every transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Whether a retry is currently scheduled.
    pub fn retry_pending(&self) -> bool {
        self.lock().retry_timer.is_armed()
    }

    /// Open the transport unless already connected, throttled or cooling down.
    ///
    /// Only a missing tenant identifier is an error; it aborts before any
    /// attempt is counted.
    pub async fn connect(&self, credentials: Credentials) -> Result<ConnectOutcome, SyncError> {
        if credentials.tenant().is_none() {
            tracing::error!("cannot connect: no company identifier configured");
            return Err(SyncError::MissingTenant);
        }
        Ok(self.attempt(Some(credentials), Trigger::Caller).await)
    }

    async fn attempt(&self, credentials: Option<Credentials>, trigger: Trigger) -> ConnectOutcome {
        let (generation, credentials) = {
            let mut inner = self.lock();
            let now = Instant::now();

            match inner.status.state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    return ConnectOutcome::AlreadyActive;
                }
                ConnectionState::CoolingDown => match inner.status.cooldown_until {
                    Some(until) if now < until => {
                        tracing::debug!("connect refused: cooling down");
                        return ConnectOutcome::CoolingDown;
                    }
                    _ => {
                        inner.cooldown_timer.cancel();
                        inner.status.cooldown_until = None;
                    }
                },
                ConnectionState::Disconnected => {}
            }

            if trigger == Trigger::Caller {
                if let Some(last) = inner.status.last_attempt_at {
                    if now.duration_since(last) < self.shared.config.min_attempt_interval {
                        tracing::debug!("connect ignored: within minimum attempt interval");
                        return ConnectOutcome::Throttled;
                    }
                }
                // An explicit attempt replaces any scheduled retry.
                inner.retry_timer.cancel();
            }

            if let Some(credentials) = credentials {
                inner.credentials = Some(credentials);
            }
            let Some(credentials) = inner.credentials.clone() else {
                return ConnectOutcome::Abandoned;
            };

            inner.intentional = false;
            inner.server_requested = false;
            inner.generation += 1;
            inner.status.state = ConnectionState::Connecting;
            inner.status.last_attempt_at = Some(now);
            self.publish(&inner);
            (inner.generation, credentials)
        };

        tracing::info!(
            "connecting to {} (attempt {})",
            credentials.ws_url,
            self.status().reconnect_attempts + 1
        );

        match self.shared.connector.open(&credentials).await {
            Ok(link) => {
                let handle = WsHandle::new(link.outbound);
                {
                    let mut inner = self.lock();
                    if inner.generation != generation || inner.intentional {
                        handle.close();
                        return ConnectOutcome::Abandoned;
                    }
                    inner.handle = Some(handle);
                    inner.status.state = ConnectionState::Connected;
                    inner.status.reconnect_attempts = 0;
                    self.publish(&inner);
                }
                tracing::info!("connected to {}", credentials.ws_url);
                self.spawn_pump(link.inbound, generation);
                self.emit(TransportEvent::Connected);
                ConnectOutcome::Connected
            }
            Err(e) => {
                tracing::warn!("connection attempt failed: {}", e);
                let mut inner = self.lock();
                if inner.generation != generation || inner.intentional {
                    return ConnectOutcome::Abandoned;
                }
                inner.handle = None;
                inner.status.state = ConnectionState::Disconnected;
                self.record_failure(&mut inner);
                ConnectOutcome::Failed
            }
        }
    }

    /// Count a failure, then schedule a retry or enter cooldown.
    fn record_failure(&self, inner: &mut ConnInner) {
        let config = &self.shared.config;
        inner.status.reconnect_attempts += 1;

        if inner.status.reconnect_attempts >= config.max_attempts {
            let until = Instant::now() + config.cooldown;
            tracing::warn!(
                "{} consecutive connection failures, cooling down for {:?}",
                inner.status.reconnect_attempts,
                config.cooldown
            );
            inner.retry_timer.cancel();
            inner.status.reconnect_attempts = 0;
            inner.status.state = ConnectionState::CoolingDown;
            inner.status.cooldown_until = Some(until);

            let this = self.clone();
            inner.cooldown_timer = TimerHandle::after(config.cooldown, async move {
                this.end_cooldown();
            });
        } else {
            self.schedule_retry(inner);
        }
        self.publish(inner);
    }

    fn schedule_retry(&self, inner: &mut ConnInner) {
        if inner.retry_timer.is_armed() {
            tracing::debug!("retry already scheduled");
            return;
        }
        let delay = self
            .shared
            .config
            .delay_for_attempt(inner.status.reconnect_attempts);
        tracing::info!(
            "reconnecting in {:?} (attempt {})",
            delay,
            inner.status.reconnect_attempts + 1
        );
        let this = self.clone();
        inner.retry_timer = TimerHandle::after(delay, async move {
            this.lock().retry_timer.disarm();
            this.attempt(None, Trigger::Retry).await;
        });
    }

    fn end_cooldown(&self) {
        let mut inner = self.lock();
        inner.cooldown_timer.disarm();
        if inner.status.state == ConnectionState::CoolingDown {
            tracing::info!("cooldown elapsed");
            inner.status.state = ConnectionState::Disconnected;
            inner.status.cooldown_until = None;
            self.publish(&inner);
        }
    }

    /// Close the connection on purpose. Cancels pending retries and cooldown.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        inner.intentional = true;
        inner.generation += 1;
        inner.retry_timer.cancel();
        inner.cooldown_timer.cancel();
        if let Some(handle) = inner.handle.take() {
            handle.close();
        }
        inner.status.state = ConnectionState::Disconnected;
        inner.status.reconnect_attempts = 0;
        inner.status.cooldown_until = None;
        self.publish(&inner);
        tracing::info!("disconnected by caller");
    }

    /// Remember that the server announced a deliberate disconnect.
    pub fn note_server_disconnect(&self) {
        self.lock().server_requested = true;
    }

    /// Send a command over the live link.
    pub fn send(&self, cmd: ClientCommand) -> Result<(), SyncError> {
        let handle = {
            let inner = self.lock();
            if !inner.status.state.is_connected() {
                return Err(SyncError::NotConnected);
            }
            inner.handle.clone().ok_or(SyncError::NotConnected)?
        };
        handle.send(cmd)
    }

    /// Send with a correlation id, e.g. the temp id of a provisional message.
    pub fn send_correlated(&self, cmd: ClientCommand, correlation_id: String) -> Result<(), SyncError> {
        let handle = {
            let inner = self.lock();
            if !inner.status.state.is_connected() {
                return Err(SyncError::NotConnected);
            }
            inner.handle.clone().ok_or(SyncError::NotConnected)?
        };
        handle.send_with_correlation(cmd, correlation_id)
    }

    fn spawn_pump(&self, mut inbound: UnboundedReceiver<LinkEvent>, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                match inbound.next().await {
                    Some(LinkEvent::Event(envelope)) => {
                        if this.lock().generation != generation {
                            return;
                        }
                        if envelope.payload.is_server_disconnect() {
                            this.note_server_disconnect();
                        }
                        this.emit(TransportEvent::Event(envelope));
                    }
                    Some(LinkEvent::Closed(reason)) => break reason,
                    None => break CloseReason::Transport("link dropped".to_string()),
                }
            };
            this.handle_close(generation, reason);
        });
    }

    /// React to a link closing. Only unexpected drops trigger reconnection.
    fn handle_close(&self, generation: u64, reason: CloseReason) {
        let reason = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.handle = None;
            inner.status.state = ConnectionState::Disconnected;

            let reason = if inner.server_requested {
                CloseReason::ServerRequested
            } else {
                reason
            };

            match &reason {
                _ if inner.intentional => {
                    tracing::info!("link closed after intentional disconnect");
                    self.publish(&inner);
                }
                CloseReason::ServerRequested | CloseReason::ClientRequested => {
                    tracing::info!("link closed ({:?}); not reconnecting", reason);
                    self.publish(&inner);
                }
                CloseReason::Transport(cause) => {
                    tracing::warn!("connection dropped: {}", cause);
                    self.record_failure(&mut inner);
                }
            }
            reason
        };
        self.emit(TransportEvent::Closed(reason));
    }

    fn emit(&self, event: TransportEvent) {
        if self.shared.events.send(event).is_err() {
            tracing::debug!("engine event loop is gone");
        }
    }

    fn publish(&self, inner: &ConnInner) {
        self.shared.status_tx.send_replace(inner.status.clone());
    }
}
