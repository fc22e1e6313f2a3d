//! In-memory transport and REST fakes for engine tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use relaychat_client::ws::{CloseReason, Connector, Link, LinkEvent};
use relaychat_client::{
    ChatApi, ChatEngine, Credentials, EngineConfig, EngineObserver, FocusOracle, OutgoingAttachment,
    SyncError,
};
use relaychat_shared::{
    ApiError, Attachment, ClientCommand, Message, MessageStatus, MessagesPage, Room, RoomType,
    ServerEvent, WsEnvelope,
};

pub const ME: &str = "self";
pub const PEER: &str = "u2";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn message(id: &str, room_id: &str, sender: &str, content: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        room_id: room_id.to_string(),
        sender_id: sender.to_string(),
        sender_name: None,
        content: content.to_string(),
        attachment: None,
        status: MessageStatus::Sent,
        created_at: at(secs),
        is_system_message: false,
        edited_at: None,
    }
}

pub fn room(id: &str, unread: u32) -> Room {
    Room {
        id: id.to_string(),
        room_type: RoomType::Group,
        name: Some(format!("room {id}")),
        image_url: None,
        last_message: None,
        last_message_at: None,
        unread_count: unread,
        participants: vec![],
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        ws_url: "ws://test/ws".to_string(),
        api_url: "http://test/api".to_string(),
        token: "token".to_string(),
        company_id: Some("acme".to_string()),
    }
}

/// A server reachable through an in-memory link.
#[derive(Default)]
pub struct MemoryServer {
    inbound: Mutex<Option<UnboundedSender<LinkEvent>>>,
    outbound: Mutex<Option<UnboundedReceiver<WsEnvelope<ClientCommand>>>>,
    received: Mutex<Vec<ClientCommand>>,
    pub opens: AtomicUsize,
    pub refuse: AtomicBool,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: ServerEvent) {
        let guard = self.inbound.lock().unwrap();
        let tx = guard.as_ref().expect("no open link");
        tx.unbounded_send(LinkEvent::Event(WsEnvelope::new(event)))
            .expect("link closed");
    }

    /// Drop the link as if the network went away.
    pub fn drop_link(&self) {
        if let Some(tx) = self.inbound.lock().unwrap().take() {
            let _ = tx.unbounded_send(LinkEvent::Closed(CloseReason::Transport("reset".to_string())));
        }
    }

    /// Every command received so far.
    pub fn received(&self) -> Vec<ClientCommand> {
        let mut received = self.received.lock().unwrap();
        if let Some(rx) = self.outbound.lock().unwrap().as_mut() {
            while let Ok(Some(envelope)) = rx.try_next() {
                received.push(envelope.payload);
            }
        }
        received.clone()
    }
}

#[async_trait]
impl Connector for MemoryServer {
    async fn open(&self, _credentials: &Credentials) -> Result<Link, SyncError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("refused".to_string()));
        }
        // Keep what the previous link delivered.
        self.received();

        let (outbound, outbound_rx) = unbounded();
        let (inbound_tx, inbound) = unbounded();
        *self.outbound.lock().unwrap() = Some(outbound_rx);
        *self.inbound.lock().unwrap() = Some(inbound_tx);
        Ok(Link { outbound, inbound })
    }
}

/// REST API backed by in-memory maps.
#[derive(Default)]
pub struct MemoryApi {
    pub rooms: Mutex<Vec<Room>>,
    pub history: Mutex<HashMap<String, Vec<Message>>>,
    pub sends: Mutex<Vec<(String, String, Option<String>)>>,
    pub mark_read_calls: AtomicUsize,
    pub fetch_rooms_calls: AtomicUsize,
    pub fail_writes: AtomicBool,
    /// How long `send_message` takes to answer.
    pub send_latency: Mutex<Option<Duration>>,
    next_id: AtomicUsize,
}

impl MemoryApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_rooms(rooms: Vec<Room>) -> Arc<Self> {
        let api = Self::default();
        *api.rooms.lock().unwrap() = rooms;
        Arc::new(api)
    }

    fn check_write(&self) -> Result<(), ApiError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(ApiError::Http {
                status: 503,
                body: r#"{"detail":"try again later"}"#.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn find_room(&self, room_id: &str) -> Result<Room, ApiError> {
        self.rooms
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == room_id)
            .cloned()
            .ok_or(ApiError::Http {
                status: 404,
                body: String::new(),
            })
    }
}

#[async_trait]
impl ChatApi for MemoryApi {
    async fn fetch_rooms(&self) -> Result<Vec<Room>, ApiError> {
        self.fetch_rooms_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.rooms.lock().unwrap().clone())
    }

    async fn fetch_room(&self, room_id: &str) -> Result<Room, ApiError> {
        self.find_room(room_id)
    }

    async fn fetch_messages(&self, room_id: &str, limit: u32, offset: u32) -> Result<MessagesPage, ApiError> {
        let history = self.history.lock().unwrap();
        let all = history.get(room_id).cloned().unwrap_or_default();
        let items: Vec<Message> = all
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        let has_more = (offset + limit) < all.len() as u32;
        Ok(MessagesPage { items, has_more })
    }

    async fn send_message(
        &self,
        room_id: &str,
        content: &str,
        attachment: Option<&OutgoingAttachment>,
    ) -> Result<Message, ApiError> {
        self.check_write()?;
        let latency = *self.send_latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.sends.lock().unwrap().push((
            room_id.to_string(),
            content.to_string(),
            attachment.map(|a| a.file_name.clone()),
        ));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Message {
            id: format!("srv-{n}"),
            room_id: room_id.to_string(),
            sender_id: ME.to_string(),
            sender_name: None,
            content: content.to_string(),
            attachment: attachment.map(|a| Attachment {
                url: format!("https://cdn.test/{}", a.file_name),
                name: a.file_name.clone(),
                mime: a.mime.clone(),
                size: a.size(),
            }),
            status: MessageStatus::Sent,
            created_at: Utc::now(),
            is_system_message: false,
            edited_at: None,
        })
    }

    async fn mark_as_read(&self, _room_id: &str) -> Result<(), ApiError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<Message, ApiError> {
        self.check_write()?;
        let mut edited = message(message_id, "R1", ME, content, 0);
        edited.edited_at = Some(Utc::now());
        Ok(edited)
    }

    async fn delete_message(&self, _message_id: &str) -> Result<(), ApiError> {
        self.check_write()
    }

    async fn rename_room(&self, room_id: &str, name: &str) -> Result<Room, ApiError> {
        self.check_write()?;
        let mut room = self.find_room(room_id)?;
        room.name = Some(name.to_string());
        Ok(room)
    }

    async fn update_room_image(&self, room_id: &str, image_url: &str) -> Result<Room, ApiError> {
        self.check_write()?;
        let mut room = self.find_room(room_id)?;
        room.image_url = Some(image_url.to_string());
        Ok(room)
    }

    async fn add_participants(&self, room_id: &str, _user_ids: &[String]) -> Result<Room, ApiError> {
        self.check_write()?;
        self.find_room(room_id)
    }

    async fn remove_participant(&self, _room_id: &str, _user_id: &str) -> Result<(), ApiError> {
        self.check_write()
    }
}

/// Records observer callbacks.
#[derive(Default)]
pub struct Recorder {
    pub unopened: Mutex<Vec<String>>,
    pub failures: Mutex<Vec<(String, SyncError)>>,
    pub errors: Mutex<Vec<String>>,
}

impl EngineObserver for Recorder {
    fn on_inbound_message_for_unopened_room(&self, room_id: &str) {
        self.unopened.lock().unwrap().push(room_id.to_string());
    }

    fn on_send_failed(&self, _room_id: &str, temp_id: &str, error: &SyncError) {
        self.failures
            .lock()
            .unwrap()
            .push((temp_id.to_string(), error.clone()));
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

/// The user is looking at one fixed room.
pub struct Focused(pub &'static str);

impl FocusOracle for Focused {
    fn is_room_foreground(&self, room_id: &str) -> bool {
        room_id == self.0
    }
}

pub struct Harness {
    pub engine: ChatEngine,
    pub server: Arc<MemoryServer>,
    pub api: Arc<MemoryApi>,
    pub recorder: Arc<Recorder>,
}

pub fn harness(api: Arc<MemoryApi>) -> Harness {
    harness_with_focus(api, None)
}

pub fn harness_with_focus(api: Arc<MemoryApi>, focus: Option<Arc<dyn FocusOracle>>) -> Harness {
    let server = MemoryServer::new();
    let recorder = Arc::new(Recorder::default());
    let mut builder = ChatEngine::builder(ME, credentials())
        .config(EngineConfig::default())
        .connector(server.clone())
        .api(api.clone())
        .observer(recorder.clone());
    if let Some(focus) = focus {
        builder = builder.focus(focus);
    }
    let engine = builder.build();

    let runner = engine.clone();
    tokio::spawn(async move { runner.run().await });

    Harness {
        engine,
        server,
        api,
        recorder,
    }
}

/// Yield until `condition` holds, failing the test if it never does.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
