//! Mark-as-read emission with a per-room in-flight guard.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relaychat_shared::ClientCommand;

use crate::api_client::ChatApi;
use crate::ws::ConnectionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkReadOutcome {
    /// Nothing in the room was unread; nothing transmitted.
    NothingUnread,
    /// Another call for the room is still in flight or cooling down.
    AlreadyInFlight,
    /// Transmitted over the live connection.
    SentLive,
    /// Transmitted through the REST API.
    SentRest,
    /// The REST call failed. Logged, not retried.
    Failed,
}

/// Decides when to emit "mark as read" and suppresses redundant calls.
///
/// The server's `messages_read` echo is what flips message statuses; this type
/// only transmits.
pub struct ReadReceiptCoordinator {
    connection: ConnectionManager,
    api: Arc<dyn ChatApi>,
    company_id: String,
    release_after: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ReadReceiptCoordinator {
    pub fn new(
        connection: ConnectionManager,
        api: Arc<dyn ChatApi>,
        company_id: impl Into<String>,
        release_after: Duration,
    ) -> Self {
        Self {
            connection,
            api,
            company_id: company_id.into(),
            release_after,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn try_begin(&self, room_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(room_id.to_string())
    }

    /// Keep the room blocked for the release cooldown, then let it go.
    fn release_later(&self, room_id: &str) {
        let in_flight = self.in_flight.clone();
        let room_id = room_id.to_string();
        let delay = self.release_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&room_id);
        });
    }

    pub fn is_in_flight(&self, room_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(room_id)
    }

    /// Emit "mark as read" for `room_id` if anything is unread and no call is
    /// already in flight. Uses the live connection, falling back to REST.
    pub async fn mark_as_read(&self, room_id: &str, has_unread: bool) -> MarkReadOutcome {
        if !has_unread {
            return MarkReadOutcome::NothingUnread;
        }
        if !self.try_begin(room_id) {
            tracing::debug!("mark-as-read for {} already in flight", room_id);
            return MarkReadOutcome::AlreadyInFlight;
        }

        let cmd = ClientCommand::MarkAsRead {
            room_id: room_id.to_string(),
            company_id: self.company_id.clone(),
        };
        let outcome = match self.connection.send(cmd) {
            Ok(()) => MarkReadOutcome::SentLive,
            Err(e) => {
                tracing::debug!("mark-as-read for {} via REST ({})", room_id, e);
                match self.api.mark_as_read(room_id).await {
                    Ok(()) => MarkReadOutcome::SentRest,
                    Err(e) => {
                        tracing::warn!("mark-as-read for {} failed: {}", room_id, e);
                        MarkReadOutcome::Failed
                    }
                }
            }
        };

        self.release_later(room_id);
        outcome
    }

    pub fn clear(&self) {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}
