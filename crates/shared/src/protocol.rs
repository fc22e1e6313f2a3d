//! Real-time transport protocol: envelopes, client commands and server events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageStatus};

/// Disconnect reason the server uses when it closes the session on purpose.
/// Clients must not auto-reconnect after it.
pub const SERVER_DISCONNECT_REASON: &str = "io server disconnect";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    /// Wrap a payload with a fresh envelope id and the current time.
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Intents the client emits. Every command carries the tenant identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    JoinRoom {
        room_id: String,
        company_id: String,
    },
    LeaveRoom {
        room_id: String,
        company_id: String,
    },
    /// Text-only send. Attachments always go through the REST API.
    SendMessage {
        room_id: String,
        content: String,
        company_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    MarkAsRead {
        room_id: String,
        company_id: String,
    },
}

impl ClientCommand {
    pub fn room_id(&self) -> &str {
        match self {
            ClientCommand::JoinRoom { room_id, .. }
            | ClientCommand::LeaveRoom { room_id, .. }
            | ClientCommand::SendMessage { room_id, .. }
            | ClientCommand::MarkAsRead { room_id, .. } => room_id,
        }
    }
}

/// Events the server pushes over the real-time transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    ChatConnected,
    Disconnect {
        reason: String,
    },
    NewMessage {
        message: Message,
        timestamp: DateTime<Utc>,
        /// Queued while this client was offline.
        #[serde(default)]
        is_pending: bool,
    },
    MessageSent {
        message_id: String,
        timestamp: DateTime<Utc>,
    },
    MessagesRead {
        room_id: String,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    MessageStatusUpdate {
        message_id: String,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    },
    MessageEdited {
        room_id: String,
        original_message_id: String,
        new_message: Message,
        timestamp: DateTime<Utc>,
    },
    MessageDeleted {
        room_id: String,
        message_id: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted_by: Option<String>,
    },
    RoomJoined {
        room_id: String,
        timestamp: DateTime<Utc>,
    },
    RoomLeft {
        room_id: String,
        timestamp: DateTime<Utc>,
    },
    ParticipantAdded {
        room_id: String,
        user_id: String,
        user_name: String,
        #[serde(default)]
        is_admin: bool,
        timestamp: DateTime<Utc>,
    },
    ParticipantLeft {
        room_id: String,
        user_id: String,
        user_name: String,
        timestamp: DateTime<Utc>,
    },
    ParticipantRemoved {
        room_id: String,
        user_id: String,
        user_name: String,
        timestamp: DateTime<Utc>,
    },
    ParticipantPromoted {
        room_id: String,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    RoomUpdated {
        room_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        image_url: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

/// Discriminant of [`ServerEvent`], used as the dispatcher's registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ChatConnected,
    Disconnect,
    NewMessage,
    MessageSent,
    MessagesRead,
    MessageStatusUpdate,
    MessageEdited,
    MessageDeleted,
    RoomJoined,
    RoomLeft,
    ParticipantAdded,
    ParticipantLeft,
    ParticipantRemoved,
    ParticipantPromoted,
    RoomUpdated,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 16] = [
        EventKind::ChatConnected,
        EventKind::Disconnect,
        EventKind::NewMessage,
        EventKind::MessageSent,
        EventKind::MessagesRead,
        EventKind::MessageStatusUpdate,
        EventKind::MessageEdited,
        EventKind::MessageDeleted,
        EventKind::RoomJoined,
        EventKind::RoomLeft,
        EventKind::ParticipantAdded,
        EventKind::ParticipantLeft,
        EventKind::ParticipantRemoved,
        EventKind::ParticipantPromoted,
        EventKind::RoomUpdated,
        EventKind::Error,
    ];

    /// Wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ChatConnected => "chat_connected",
            EventKind::Disconnect => "disconnect",
            EventKind::NewMessage => "new_message",
            EventKind::MessageSent => "message_sent",
            EventKind::MessagesRead => "messages_read",
            EventKind::MessageStatusUpdate => "message_status_update",
            EventKind::MessageEdited => "message_edited",
            EventKind::MessageDeleted => "message_deleted",
            EventKind::RoomJoined => "room_joined",
            EventKind::RoomLeft => "room_left",
            EventKind::ParticipantAdded => "participant_added",
            EventKind::ParticipantLeft => "participant_left",
            EventKind::ParticipantRemoved => "participant_removed",
            EventKind::ParticipantPromoted => "participant_promoted",
            EventKind::RoomUpdated => "room_updated",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::ChatConnected => EventKind::ChatConnected,
            ServerEvent::Disconnect { .. } => EventKind::Disconnect,
            ServerEvent::NewMessage { .. } => EventKind::NewMessage,
            ServerEvent::MessageSent { .. } => EventKind::MessageSent,
            ServerEvent::MessagesRead { .. } => EventKind::MessagesRead,
            ServerEvent::MessageStatusUpdate { .. } => EventKind::MessageStatusUpdate,
            ServerEvent::MessageEdited { .. } => EventKind::MessageEdited,
            ServerEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
            ServerEvent::RoomJoined { .. } => EventKind::RoomJoined,
            ServerEvent::RoomLeft { .. } => EventKind::RoomLeft,
            ServerEvent::ParticipantAdded { .. } => EventKind::ParticipantAdded,
            ServerEvent::ParticipantLeft { .. } => EventKind::ParticipantLeft,
            ServerEvent::ParticipantRemoved { .. } => EventKind::ParticipantRemoved,
            ServerEvent::ParticipantPromoted { .. } => EventKind::ParticipantPromoted,
            ServerEvent::RoomUpdated { .. } => EventKind::RoomUpdated,
            ServerEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Whether this is the server announcing it closed the session on purpose.
    pub fn is_server_disconnect(&self) -> bool {
        matches!(self, ServerEvent::Disconnect { reason } if reason == SERVER_DISCONNECT_REASON)
    }
}
