//! The engine: wires the connection, subscriptions, store and receipts
//! together and owns the single inbound event loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use relaychat_shared::validation::{validate_attachment, validate_message_content};
use relaychat_shared::{Attachment, ClientCommand, EventKind, Message, MessageStatus, Room, ServerEvent};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::api_client::{ApiClient, ChatApi, OutgoingAttachment};
use crate::config::{Credentials, EngineConfig};
use crate::dispatcher::EventDispatcher;
use crate::error::SyncError;
use crate::observer::{EngineObserver, FocusOracle, NeverFocused, NoopObserver};
use crate::receipts::{MarkReadOutcome, ReadReceiptCoordinator};
use crate::stores::{MessageStore, RoomsCache, StoredMessage};
use crate::subscriptions::RoomSubscriptionTracker;
use crate::timer::TimerHandle;
use crate::ws::{
    CloseReason, ConnectOutcome, ConnectionManager, ConnectionStatus, Connector, TransportEvent,
    WsConnector,
};

/// Assembles a [`ChatEngine`]. Every collaborator except the credentials and
/// the local user id has a default.
pub struct ChatEngineBuilder {
    config: EngineConfig,
    credentials: Credentials,
    self_user_id: String,
    connector: Option<Arc<dyn Connector>>,
    api: Option<Arc<dyn ChatApi>>,
    rooms_cache: Option<Arc<RoomsCache>>,
    focus: Arc<dyn FocusOracle>,
    observer: Arc<dyn EngineObserver>,
}

impl ChatEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn api(mut self, api: Arc<dyn ChatApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Share a rooms cache with other engines or views.
    pub fn rooms_cache(mut self, cache: Arc<RoomsCache>) -> Self {
        self.rooms_cache = Some(cache);
        self
    }

    pub fn focus(mut self, focus: Arc<dyn FocusOracle>) -> Self {
        self.focus = focus;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> ChatEngine {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new()));
        let api = self
            .api
            .unwrap_or_else(|| Arc::new(ApiClient::from_credentials(&self.credentials)));
        let rooms_cache = self
            .rooms_cache
            .unwrap_or_else(|| Arc::new(RoomsCache::new(self.config.rooms_cache_ttl)));
        let company_id = self.credentials.tenant().unwrap_or_default().to_string();

        let connection = ConnectionManager::new(self.config.reconnect.clone(), connector, events_tx);
        let subscriptions = RoomSubscriptionTracker::new(connection.clone(), company_id.clone());
        let receipts = ReadReceiptCoordinator::new(
            connection.clone(),
            api.clone(),
            company_id.clone(),
            self.config.read_release_cooldown,
        );
        let store = MessageStore::new(self.self_user_id.clone(), self.config.send_deadline);

        ChatEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                credentials: self.credentials,
                company_id,
                self_user_id: self.self_user_id,
                connection,
                subscriptions,
                receipts,
                dispatcher: EventDispatcher::new(),
                store: Mutex::new(store),
                rooms_cache,
                api,
                focus: self.focus,
                observer: self.observer,
                rooms_in_fetch: Mutex::new(HashSet::new()),
                backlog_notified: Mutex::new(HashSet::new()),
                events: Mutex::new(Some(events_rx)),
            }),
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    credentials: Credentials,
    company_id: String,
    self_user_id: String,
    connection: ConnectionManager,
    subscriptions: RoomSubscriptionTracker,
    receipts: ReadReceiptCoordinator,
    dispatcher: EventDispatcher<ChatEngine>,
    store: Mutex<MessageStore>,
    rooms_cache: Arc<RoomsCache>,
    api: Arc<dyn ChatApi>,
    focus: Arc<dyn FocusOracle>,
    observer: Arc<dyn EngineObserver>,
    /// Rooms being fetched because a message arrived for them first.
    rooms_in_fetch: Mutex<HashSet<String>>,
    /// Rooms already notified for the current offline backlog.
    backlog_notified: Mutex<HashSet<String>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

/// Client-side chat synchronization engine.
///
/// Cheap to clone. Caller intents and the inbound loop are the only writers to
/// the store, and the store lock is never held across an `.await`.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    pub fn builder(self_user_id: impl Into<String>, credentials: Credentials) -> ChatEngineBuilder {
        ChatEngineBuilder {
            config: EngineConfig::default(),
            credentials,
            self_user_id: self_user_id.into(),
            connector: None,
            api: None,
            rooms_cache: None,
            focus: Arc::new(NeverFocused),
            observer: Arc::new(NoopObserver),
        }
    }

    fn store(&self) -> MutexGuard<'_, MessageStore> {
        self.inner.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    fn changed(&self, room_id: &str) {
        self.inner.observer.on_store_changed(room_id);
    }

    // --- Connection ---

    /// Register event handlers and open the connection.
    pub async fn connect(&self) -> Result<ConnectOutcome, SyncError> {
        self.register_handlers();
        let outcome = self
            .inner
            .connection
            .connect(self.inner.credentials.clone())
            .await?;
        tracing::info!("connect: {:?}", outcome);
        Ok(outcome)
    }

    /// Close the connection and drop every event handler.
    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
        self.inner.dispatcher.clear();
        self.inner.receipts.clear();
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.watch()
    }

    /// One handler per kind; calling this again replaces rather than stacks.
    fn register_handlers(&self) {
        for kind in EventKind::ALL {
            self.inner.dispatcher.on(kind, ChatEngine::apply_event);
        }
    }

    /// Drive the inbound event loop. Returns once the loop's receiver is gone
    /// or was already taken by another `run`.
    pub async fn run(&self) {
        let receiver = self
            .inner
            .events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(mut events) = receiver else {
            tracing::warn!("event loop is already running");
            return;
        };
        while let Some(event) = events.recv().await {
            self.handle_transport(event);
        }
        tracing::debug!("event loop stopped");
    }

    pub fn handle_transport(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.backlog_notified().clear();
                self.inner.subscriptions.rejoin_all();
            }
            TransportEvent::Event(envelope) => {
                self.inner.dispatcher.dispatch(self, envelope.payload);
            }
            TransportEvent::Closed(CloseReason::Transport(cause)) => {
                tracing::info!("transport closed: {}", cause);
            }
            TransportEvent::Closed(reason) => {
                tracing::info!("transport closed: {:?}", reason);
            }
        }
    }

    // --- Inbound events ---

    fn apply_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ChatConnected => tracing::info!("chat session established"),
            ServerEvent::Disconnect { reason } => tracing::info!("server disconnect: {}", reason),
            ServerEvent::NewMessage {
                message, is_pending, ..
            } => self.on_new_message(message, is_pending),
            ServerEvent::MessageSent { message_id, .. } => {
                self.store().apply_status(&message_id, MessageStatus::Sent);
            }
            ServerEvent::MessagesRead {
                room_id,
                user_id,
                timestamp,
            } => {
                let changed = self.store().apply_read(&room_id, &user_id, timestamp);
                tracing::debug!("{} read {} messages in {}", user_id, changed, room_id);
                self.changed(&room_id);
            }
            ServerEvent::MessageStatusUpdate {
                message_id, status, ..
            } => {
                self.store().apply_status(&message_id, status);
            }
            ServerEvent::MessageEdited {
                room_id,
                original_message_id,
                new_message,
                ..
            } => {
                if self
                    .store()
                    .apply_edit(&room_id, &original_message_id, new_message)
                {
                    self.changed(&room_id);
                }
            }
            ServerEvent::MessageDeleted {
                room_id, message_id, ..
            } => {
                if self.store().remove_message(&room_id, &message_id).is_some() {
                    self.changed(&room_id);
                }
            }
            ServerEvent::RoomJoined { room_id, timestamp }
            | ServerEvent::RoomLeft { room_id, timestamp } => {
                self.inner.subscriptions.acknowledge(&room_id, timestamp);
            }
            ServerEvent::ParticipantAdded {
                room_id,
                user_id,
                user_name,
                is_admin,
                timestamp,
            } => {
                self.store()
                    .participant_added(&room_id, &user_id, &user_name, is_admin, timestamp);
                self.sync_cached_room(&room_id);
            }
            ServerEvent::ParticipantLeft {
                room_id,
                user_id,
                timestamp,
                ..
            }
            | ServerEvent::ParticipantRemoved {
                room_id,
                user_id,
                timestamp,
                ..
            } => {
                self.store()
                    .participant_departed(&room_id, &user_id, timestamp);
                if user_id == self.inner.self_user_id {
                    self.inner.subscriptions.leave(&room_id);
                }
                self.sync_cached_room(&room_id);
            }
            ServerEvent::ParticipantPromoted { room_id, user_id, .. } => {
                self.store().participant_promoted(&room_id, &user_id);
                self.sync_cached_room(&room_id);
            }
            ServerEvent::RoomUpdated {
                room_id,
                name,
                image_url,
                ..
            } => {
                self.store().update_room(&room_id, name, image_url);
                self.sync_cached_room(&room_id);
            }
            ServerEvent::Error { message } => {
                tracing::warn!("server error: {}", message);
                self.inner.observer.on_error(&message);
            }
        }
    }

    fn on_new_message(&self, message: Message, is_pending: bool) {
        let room_id = message.room_id.clone();
        let from_self = message.sender_id == self.inner.self_user_id;

        let applied = self.store().apply_incoming(message, is_pending);
        tracing::debug!("new message in {}: {:?}", room_id, applied.outcome);

        if !applied.room_known {
            self.fetch_unknown_room(&room_id);
        }

        if applied.is_new() && !from_self {
            if self.inner.focus.is_room_foreground(&room_id) {
                let engine = self.clone();
                let room_id = room_id.clone();
                tokio::spawn(async move {
                    engine.mark_as_read(&room_id).await;
                });
            } else {
                self.store().bump_unread(&room_id);
                if self.should_notify(&room_id, is_pending) {
                    self.inner
                        .observer
                        .on_inbound_message_for_unopened_room(&room_id);
                }
            }
        }
        self.changed(&room_id);
    }

    fn backlog_notified(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .backlog_notified
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Live messages always notify. Backlog delivered after a reconnect
    /// notifies once per room until the room is read or a live message lands.
    fn should_notify(&self, room_id: &str, is_pending: bool) -> bool {
        let mut notified = self.backlog_notified();
        if is_pending {
            notified.insert(room_id.to_string())
        } else {
            notified.remove(room_id);
            true
        }
    }

    /// A message named a room the store has never seen: fetch it, then join.
    fn fetch_unknown_room(&self, room_id: &str) {
        let first = self
            .inner
            .rooms_in_fetch
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(room_id.to_string());
        if !first {
            return;
        }

        let engine = self.clone();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            match engine.inner.api.fetch_room(&room_id).await {
                Ok(room) => {
                    tracing::info!("discovered room {}", room.id);
                    engine.inner.rooms_cache.update_room(&room);
                    engine.store().upsert_room(room);
                    engine.inner.subscriptions.join(&room_id);
                    engine.changed(&room_id);
                }
                Err(e) => tracing::warn!("failed to fetch room {}: {}", room_id, e),
            }
            engine
                .inner
                .rooms_in_fetch
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&room_id);
        });
    }

    fn sync_cached_room(&self, room_id: &str) {
        let room = self.store().room(room_id).cloned();
        if let Some(room) = room {
            self.inner.rooms_cache.update_room(&room);
            self.changed(room_id);
        }
    }

    // --- Rooms ---

    pub fn join_room(&self, room_id: &str) -> bool {
        self.inner.subscriptions.join(room_id)
    }

    pub fn leave_room(&self, room_id: &str) {
        self.inner.subscriptions.leave(room_id);
    }

    /// Load the rooms list, from the cache unless `force` or stale, and join
    /// every room.
    pub async fn load_rooms(&self, force: bool) -> Result<Vec<Room>, SyncError> {
        if force {
            self.inner.rooms_cache.invalidate();
        }
        let cached = self.inner.rooms_cache.get();
        let rooms = match cached {
            Some(rooms) => rooms,
            None => {
                let rooms = self.inner.api.fetch_rooms().await?;
                self.inner.rooms_cache.put(rooms.clone());
                rooms
            }
        };

        {
            let mut store = self.store();
            for room in &rooms {
                store.upsert_room(room.clone());
            }
        }
        for room in &rooms {
            self.inner.subscriptions.join(&room.id);
        }
        tracing::info!("loaded {} rooms", rooms.len());
        Ok(self.store().rooms())
    }

    /// Fetch history page `page` (0-based) for `room_id` and merge it.
    /// Returns how many messages were new.
    pub async fn load_history(&self, room_id: &str, page: u32) -> Result<usize, SyncError> {
        let limit = self.inner.config.history_page_size;
        let page_data = self
            .inner
            .api
            .fetch_messages(room_id, limit, page.saturating_mul(limit))
            .await?;
        let added = self.store().merge_history(room_id, page_data);
        tracing::debug!("history page {} for {}: {} new", page, room_id, added);
        self.changed(room_id);
        Ok(added)
    }

    pub async fn rename_room(&self, room_id: &str, name: &str) -> Result<Room, SyncError> {
        let room = self.inner.api.rename_room(room_id, name).await?;
        self.adopt_room(&room);
        Ok(room)
    }

    pub async fn update_room_image(&self, room_id: &str, image_url: &str) -> Result<Room, SyncError> {
        let room = self.inner.api.update_room_image(room_id, image_url).await?;
        self.adopt_room(&room);
        Ok(room)
    }

    pub async fn add_participants(&self, room_id: &str, user_ids: &[String]) -> Result<Room, SyncError> {
        let room = self.inner.api.add_participants(room_id, user_ids).await?;
        self.adopt_room(&room);
        Ok(room)
    }

    pub async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), SyncError> {
        self.inner.api.remove_participant(room_id, user_id).await?;
        self.store().participant_departed(room_id, user_id, Utc::now());
        self.sync_cached_room(room_id);
        Ok(())
    }

    fn adopt_room(&self, room: &Room) {
        self.store().upsert_room(room.clone());
        self.sync_cached_room(&room.id);
    }

    // --- Messages ---

    /// Send a message optimistically.
    ///
    /// The provisional record is in the store before this first awaits.
    /// Text goes over the live connection when it is up; attachments, and
    /// text while offline, go through REST. Returns the record as it stands
    /// when the call completes: still provisional after a live send, or
    /// confirmed after REST.
    pub async fn send_message(
        &self,
        room_id: &str,
        content: &str,
        mut attachment: Option<OutgoingAttachment>,
    ) -> Result<StoredMessage, SyncError> {
        validate_message_content(content, attachment.is_some())?;
        if let Some(file) = &attachment {
            validate_attachment(&file.mime, file.size())?;
        }

        let preview = attachment.as_mut().and_then(|file| file.preview.take());
        let local_attachment = attachment.as_ref().map(|file| Attachment {
            url: preview
                .as_ref()
                .map(|p| p.id().to_string())
                .unwrap_or_else(|| format!("local://{}", file.file_name)),
            name: file.file_name.clone(),
            mime: file.mime.clone(),
            size: file.size(),
        });

        let record = {
            let mut store = self.store();
            let record = store.create_provisional(room_id, content, local_attachment, preview);
            let temp_id = record.key.temp_id().unwrap_or_default().to_string();
            let deadline = store
                .send_deadline(&temp_id)
                .unwrap_or_else(|| Instant::now() + self.inner.config.send_deadline);
            store.arm_deadline(&temp_id, self.deadline_timer(room_id, &temp_id, deadline));
            record
        };
        let temp_id = record.key.temp_id().unwrap_or_default().to_string();
        self.changed(room_id);

        if attachment.is_none() && self.inner.connection.is_connected() {
            let cmd = ClientCommand::SendMessage {
                room_id: room_id.to_string(),
                content: content.to_string(),
                company_id: self.inner.company_id.clone(),
                temp_id: Some(temp_id.clone()),
            };
            match self.inner.connection.send_correlated(cmd, temp_id.clone()) {
                Ok(()) => return Ok(record),
                Err(e) => tracing::debug!("live send failed ({}); using REST", e),
            }
        }

        // On the REST path the round trip itself enforces the deadline.
        let Some(deadline) = self.store().detach_deadline(&temp_id) else {
            return Err(SyncError::SendTimeout);
        };
        let request = self
            .inner
            .api
            .send_message(room_id, content, attachment.as_ref());
        let Ok(response) = tokio::time::timeout_at(deadline, request).await else {
            self.fail_send(room_id, &temp_id, &SyncError::SendTimeout);
            return Err(SyncError::SendTimeout);
        };
        match response {
            Ok(message) => {
                let confirmed = StoredMessage::from_wire(message.clone(), false);
                self.store().confirm_provisional(&temp_id, message);
                self.changed(room_id);
                Ok(confirmed)
            }
            Err(e) => {
                let error = SyncError::Api(e);
                self.fail_send(room_id, &temp_id, &error);
                Err(error)
            }
        }
    }

    fn deadline_timer(&self, room_id: &str, temp_id: &str, deadline: Instant) -> TimerHandle {
        let engine = self.downgrade();
        let room_id = room_id.to_string();
        let temp_id = temp_id.to_string();
        TimerHandle::at(deadline, async move {
            if let Some(inner) = engine.upgrade() {
                ChatEngine { inner }.expire_send(&room_id, &temp_id);
            }
        })
    }

    fn expire_send(&self, room_id: &str, temp_id: &str) {
        if self.store().expire(temp_id).is_some() {
            self.inner
                .observer
                .on_send_failed(room_id, temp_id, &SyncError::SendTimeout);
            self.changed(room_id);
        }
    }

    fn fail_send(&self, room_id: &str, temp_id: &str, error: &SyncError) {
        tracing::warn!("send {} in {} failed: {}", temp_id, room_id, error);
        if self.store().rollback(temp_id).is_some() {
            self.inner.observer.on_send_failed(room_id, temp_id, error);
            self.changed(room_id);
        }
    }

    /// Edit a message: applied locally at once, reverted if the server refuses.
    pub async fn edit_message(&self, room_id: &str, message_id: &str, content: &str) -> Result<(), SyncError> {
        validate_message_content(content, false)?;
        let previous = self
            .store()
            .edit_local(room_id, message_id, content)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        self.changed(room_id);

        match self.inner.api.edit_message(message_id, content).await {
            Ok(message) => {
                self.store().apply_edit(room_id, message_id, message);
                self.changed(room_id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("edit of {} failed: {}", message_id, e);
                self.store().restore(previous);
                self.changed(room_id);
                Err(e.into())
            }
        }
    }

    /// Delete a message: removed locally at once, restored if the server refuses.
    pub async fn delete_message(&self, room_id: &str, message_id: &str) -> Result<(), SyncError> {
        let removed = self
            .store()
            .remove_message(room_id, message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        self.changed(room_id);

        match self.inner.api.delete_message(message_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("delete of {} failed: {}", message_id, e);
                self.store().restore(removed);
                self.changed(room_id);
                Err(e.into())
            }
        }
    }

    pub async fn mark_as_read(&self, room_id: &str) -> MarkReadOutcome {
        let has_unread = {
            let store = self.store();
            store.has_unread(room_id) || store.room(room_id).is_some_and(|r| r.unread_count > 0)
        };
        self.backlog_notified().remove(room_id);
        self.inner.receipts.mark_as_read(room_id, has_unread).await
    }

    // --- Snapshots ---

    pub fn messages(&self, room_id: &str) -> Vec<StoredMessage> {
        self.store().messages(room_id).to_vec()
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.store().room(room_id).cloned()
    }

    /// Rooms ordered by most recent activity.
    pub fn rooms(&self) -> Vec<Room> {
        self.store().rooms()
    }

    pub fn has_unread(&self, room_id: &str) -> bool {
        self.store().has_unread(room_id)
    }

    pub fn pending_count(&self) -> usize {
        self.store().pending_count()
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        self.inner.subscriptions.is_joined(room_id)
    }

    pub fn self_user_id(&self) -> &str {
        &self.inner.self_user_id
    }
}
