//! Room membership intent that survives reconnects.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use relaychat_shared::ClientCommand;

use crate::ws::ConnectionManager;

/// Per-room diagnostics; acknowledgements never affect correctness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub joins_sent: u32,
    pub last_ack_at: Option<DateTime<Utc>>,
}

/// Tracks which rooms the local client wants to be joined to.
pub struct RoomSubscriptionTracker {
    connection: ConnectionManager,
    company_id: String,
    rooms: Mutex<BTreeMap<String, SubscriptionInfo>>,
}

impl RoomSubscriptionTracker {
    pub fn new(connection: ConnectionManager, company_id: impl Into<String>) -> Self {
        Self {
            connection,
            company_id: company_id.into(),
            rooms: Mutex::new(BTreeMap::new()),
        }
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SubscriptionInfo>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record intent to be in `room_id` and transmit a join if connected.
    /// Returns whether a join was transmitted.
    pub fn join(&self, room_id: &str) -> bool {
        self.rooms().entry(room_id.to_string()).or_default();
        self.transmit_join(room_id)
    }

    /// Transmit a leave and forget the room.
    pub fn leave(&self, room_id: &str) {
        self.rooms().remove(room_id);
        let cmd = ClientCommand::LeaveRoom {
            room_id: room_id.to_string(),
            company_id: self.company_id.clone(),
        };
        if let Err(e) = self.connection.send(cmd) {
            tracing::debug!("leave for {} not transmitted: {}", room_id, e);
        }
    }

    /// Re-transmit joins for every recorded room. Called on the connected transition.
    pub fn rejoin_all(&self) -> usize {
        let room_ids: Vec<String> = self.rooms().keys().cloned().collect();
        let sent = room_ids
            .iter()
            .filter(|room_id| self.transmit_join(room_id))
            .count();
        tracing::info!("re-joined {} of {} rooms", sent, room_ids.len());
        sent
    }

    fn transmit_join(&self, room_id: &str) -> bool {
        if !self.connection.is_connected() {
            return false;
        }
        let cmd = ClientCommand::JoinRoom {
            room_id: room_id.to_string(),
            company_id: self.company_id.clone(),
        };
        match self.connection.send(cmd) {
            Ok(()) => {
                if let Some(info) = self.rooms().get_mut(room_id) {
                    info.joins_sent += 1;
                }
                true
            }
            Err(e) => {
                tracing::warn!("join for {} failed: {}", room_id, e);
                false
            }
        }
    }

    /// Record a `room_joined`/`room_left` acknowledgement.
    pub fn acknowledge(&self, room_id: &str, at: DateTime<Utc>) {
        match self.rooms().get_mut(room_id) {
            Some(info) => info.last_ack_at = Some(at),
            None => tracing::debug!("ack for untracked room {}", room_id),
        }
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        self.rooms().contains_key(room_id)
    }

    pub fn info(&self, room_id: &str) -> Option<SubscriptionInfo> {
        self.rooms().get(room_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, ReconnectConfig};
    use crate::error::SyncError;
    use crate::ws::{Connector, Link};
    use async_trait::async_trait;
    use futures_channel::mpsc::{unbounded, UnboundedReceiver};
    use relaychat_shared::WsEnvelope;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct LoopbackConnector {
        sent: Mutex<Option<UnboundedReceiver<WsEnvelope<ClientCommand>>>>,
        keep: Mutex<Vec<futures_channel::mpsc::UnboundedSender<crate::ws::LinkEvent>>>,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn open(&self, _credentials: &Credentials) -> Result<Link, SyncError> {
            let (outbound, outbound_rx) = unbounded();
            let (inbound_tx, inbound) = unbounded();
            *self.sent.lock().unwrap() = Some(outbound_rx);
            self.keep.lock().unwrap().push(inbound_tx);
            Ok(Link { outbound, inbound })
        }
    }

    fn drain(connector: &LoopbackConnector) -> Vec<ClientCommand> {
        let mut guard = connector.sent.lock().unwrap();
        let rx = guard.as_mut().unwrap();
        let mut out = Vec::new();
        while let Ok(Some(envelope)) = rx.try_next() {
            out.push(envelope.payload);
        }
        out
    }

    fn setup() -> (Arc<LoopbackConnector>, ConnectionManager) {
        let connector = Arc::new(LoopbackConnector {
            sent: Mutex::new(None),
            keep: Mutex::new(Vec::new()),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(ReconnectConfig::default(), connector.clone(), tx);
        (connector, manager)
    }

    fn creds() -> Credentials {
        Credentials {
            company_id: Some("acme".to_string()),
            ..Credentials::default()
        }
    }

    #[tokio::test]
    async fn join_records_intent_while_offline() {
        let (_connector, manager) = setup();
        let tracker = RoomSubscriptionTracker::new(manager, "acme");

        assert!(!tracker.join("R1"));
        assert!(tracker.is_joined("R1"));
        assert_eq!(tracker.info("R1").unwrap().joins_sent, 0);
    }

    #[tokio::test]
    async fn rejoin_all_transmits_every_recorded_room() {
        let (connector, manager) = setup();
        let tracker = RoomSubscriptionTracker::new(manager.clone(), "acme");
        tracker.join("R1");
        tracker.join("R2");

        manager.connect(creds()).await.unwrap();
        assert_eq!(tracker.rejoin_all(), 2);

        let sent = drain(&connector);
        let rooms: Vec<&str> = sent.iter().map(ClientCommand::room_id).collect();
        assert_eq!(rooms, vec!["R1", "R2"]);
        assert!(sent
            .iter()
            .all(|cmd| matches!(cmd, ClientCommand::JoinRoom { company_id, .. } if company_id == "acme")));
    }

    #[tokio::test]
    async fn leave_forgets_room_and_transmits() {
        let (connector, manager) = setup();
        let tracker = RoomSubscriptionTracker::new(manager.clone(), "acme");
        manager.connect(creds()).await.unwrap();

        assert!(tracker.join("R1"));
        tracker.leave("R1");
        assert!(!tracker.is_joined("R1"));
        assert_eq!(tracker.rejoin_all(), 0);

        let sent = drain(&connector);
        assert!(matches!(sent.last(), Some(ClientCommand::LeaveRoom { room_id, .. }) if room_id == "R1"));
    }

    #[tokio::test]
    async fn acks_only_update_diagnostics() {
        let (_connector, manager) = setup();
        let tracker = RoomSubscriptionTracker::new(manager, "acme");
        tracker.join("R1");
        let at = Utc::now();

        tracker.acknowledge("R1", at);
        tracker.acknowledge("R9", at);

        assert_eq!(tracker.info("R1").unwrap().last_ack_at, Some(at));
        assert!(!tracker.is_joined("R9"));
    }
}
