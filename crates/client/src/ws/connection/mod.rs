//! Transport link types shared by the connection manager and the connectors.
//!
//! A [`Connector`] opens one [`Link`] per connection attempt. The platform
//! implementation is included conditionally at the bottom of this module.

use async_trait::async_trait;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use relaychat_shared::{ClientCommand, ServerEvent, WsEnvelope};
use tokio::time::Instant;

use crate::config::Credentials;
use crate::error::SyncError;

/// Connection state for the real-time transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    CoolingDown,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Snapshot of the connection manager, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub cooldown_until: Option<Instant>,
    pub last_attempt_at: Option<Instant>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            cooldown_until: None,
            last_attempt_at: None,
        }
    }
}

/// Why a link stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server ended the session on purpose. No auto-reconnect.
    ServerRequested,
    /// The local side closed the link.
    ClientRequested,
    /// Network or protocol failure.
    Transport(String),
}

/// Inbound traffic on a link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Event(WsEnvelope<ServerEvent>),
    Closed(CloseReason),
}

/// An open transport connection.
pub struct Link {
    pub outbound: UnboundedSender<WsEnvelope<ClientCommand>>,
    pub inbound: UnboundedReceiver<LinkEvent>,
}

/// What the connection manager forwards to the engine's event loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Event(WsEnvelope<ServerEvent>),
    Closed(CloseReason),
}

/// Opens transport links. Implemented over websockets for production and by
/// in-memory fakes in tests.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, credentials: &Credentials) -> Result<Link, SyncError>;
}

/// Handle for sending commands through an open link
#[derive(Clone)]
pub struct WsHandle {
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
}

impl WsHandle {
    pub(crate) fn new(sender: UnboundedSender<WsEnvelope<ClientCommand>>) -> Self {
        Self { sender }
    }

    /// Send a command to the server
    pub fn send(&self, cmd: ClientCommand) -> Result<(), SyncError> {
        tracing::debug!("sending {:?}", cmd);
        self.send_envelope(WsEnvelope::new(cmd))
    }

    /// Send a command with a correlation ID for tracking responses
    pub fn send_with_correlation(
        &self,
        cmd: ClientCommand,
        correlation_id: String,
    ) -> Result<(), SyncError> {
        self.send_envelope(WsEnvelope::new(cmd).with_correlation(correlation_id))
    }

    fn send_envelope(&self, envelope: WsEnvelope<ClientCommand>) -> Result<(), SyncError> {
        self.sender
            .unbounded_send(envelope)
            .map_err(|e| SyncError::Transport(format!("Failed to send: {}", e)))
    }

    /// Close the outbound half, which makes the writer task shut the socket.
    pub fn close(&self) {
        self.sender.close_channel();
    }
}

mod connection_native;
pub use connection_native::WsConnector;
