//! Message store: the reconciliation core.
//!
//! This store is the single source of truth for rooms and their messages.
//! History pages, live events, REST responses and optimistic sends all end up
//! here, and every path goes through the same dedup and ordering rules:
//!
//! - one record per confirmed message id per room
//! - a provisional record and its confirmed counterpart never coexist
//! - offline-queued (pending) messages are placed chronologically, live ones appended
//! - a room's last message only ever moves forward in time

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relaychat_shared::{Attachment, Message, MessageStatus, MessagesPage, Participant, Room};
use tokio::time::Instant;

use crate::optimistic::{LocalPreviewHandle, OptimisticMessageTracker};
use crate::timer::TimerHandle;

/// Identity of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Server-assigned, stable id.
    Confirmed(String),
    /// Client-assigned temp id; exists only until confirmation or rollback.
    Provisional(String),
}

impl MessageKey {
    pub fn id(&self) -> Option<&str> {
        match self {
            MessageKey::Confirmed(id) => Some(id),
            MessageKey::Provisional(_) => None,
        }
    }

    pub fn temp_id(&self) -> Option<&str> {
        match self {
            MessageKey::Provisional(temp_id) => Some(temp_id),
            MessageKey::Confirmed(_) => None,
        }
    }
}

/// A message stored in the message store.
/// This is a unified format for REST, websocket and optimistic messages.
#[derive(Clone, PartialEq, Debug)]
pub struct StoredMessage {
    pub key: MessageKey,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub is_system_message: bool,
    /// Delivered while this client was offline. Affects notifications only.
    pub is_pending: bool,
    pub edited_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    pub fn from_wire(message: Message, is_pending: bool) -> Self {
        Self {
            key: MessageKey::Confirmed(message.id),
            room_id: message.room_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            content: message.content,
            attachment: message.attachment,
            status: message.status,
            created_at: message.created_at,
            is_system_message: message.is_system_message,
            is_pending,
            edited_at: message.edited_at,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.key.id()
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.key, MessageKey::Provisional(_))
    }

    /// Wire form of a confirmed record.
    pub fn to_wire(&self) -> Option<Message> {
        Some(Message {
            id: self.key.id()?.to_string(),
            room_id: self.room_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            content: self.content.clone(),
            attachment: self.attachment.clone(),
            status: self.status,
            created_at: self.created_at,
            is_system_message: self.is_system_message,
            edited_at: self.edited_at,
        })
    }

    /// Heuristic used to pair a confirmed message from the local user with the
    /// provisional record it confirms: same text, or both carry an attachment.
    fn matches_confirmation(&self, message: &Message) -> bool {
        self.is_provisional()
            && (self.content == message.content
                || (self.attachment.is_some() && message.attachment.is_some()))
    }
}

/// Messages for a single room.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoomMessages {
    /// Records in display order.
    pub messages: Vec<StoredMessage>,
    /// Whether at least one history page has been fetched from the REST API.
    pub is_loaded: bool,
    pub has_more: bool,
}

impl RoomMessages {
    fn position_of(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == Some(id))
    }

    fn position_of_temp(&self, temp_id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.key.temp_id() == Some(temp_id))
    }

    /// Index after every record created at or before `at`.
    fn chronological_slot(&self, at: DateTime<Utc>) -> usize {
        self.messages.partition_point(|m| m.created_at <= at)
    }

    fn latest_confirmed(&self) -> Option<&StoredMessage> {
        self.messages
            .iter()
            .filter(|m| !m.is_provisional())
            .max_by_key(|m| m.created_at)
    }
}

/// What [`MessageStore::apply_incoming`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Already present. `status_refreshed` tells whether the status moved forward.
    Duplicate { status_refreshed: bool },
    /// Replaced the provisional record `temp_id` in place.
    Promoted { temp_id: String },
    /// Offline-queued message placed at its chronological position.
    Inserted { index: usize },
    Appended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub outcome: ApplyOutcome,
    /// False when the message names a room the store has never seen; the
    /// caller should fetch it.
    pub room_known: bool,
}

impl Applied {
    pub fn is_new(&self) -> bool {
        matches!(
            self.outcome,
            ApplyOutcome::Inserted { .. } | ApplyOutcome::Appended
        )
    }
}

/// Rooms and their message sequences.
#[derive(Debug)]
pub struct MessageStore {
    self_user_id: String,
    rooms: HashMap<String, Room>,
    channels: HashMap<String, RoomMessages>,
    optimistic: OptimisticMessageTracker,
}

impl MessageStore {
    pub fn new(self_user_id: impl Into<String>, send_deadline: Duration) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            rooms: HashMap::new(),
            channels: HashMap::new(),
            optimistic: OptimisticMessageTracker::new(send_deadline),
        }
    }

    pub fn self_user_id(&self) -> &str {
        &self.self_user_id
    }

    // --- Queries ---

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// All rooms, most recent activity first.
    pub fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        rooms
    }

    pub fn messages(&self, room_id: &str) -> &[StoredMessage] {
        self.channels
            .get(room_id)
            .map(|channel| channel.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn channel(&self, room_id: &str) -> Option<&RoomMessages> {
        self.channels.get(room_id)
    }

    /// Whether anyone else's message in the room is not yet read.
    pub fn has_unread(&self, room_id: &str) -> bool {
        self.messages(room_id)
            .iter()
            .any(|m| !m.is_provisional() && m.sender_id != self.self_user_id && m.status < MessageStatus::Read)
    }

    pub fn pending_count(&self) -> usize {
        self.optimistic.len()
    }

    pub fn is_send_pending(&self, temp_id: &str) -> bool {
        self.optimistic.is_pending(temp_id)
    }

    // --- Rooms ---

    /// Insert or refresh a room. The local last message wins when it is newer.
    /// Returns true if the room was new.
    pub fn upsert_room(&mut self, mut room: Room) -> bool {
        let room_id = room.id.clone();
        let previous = self.rooms.remove(&room_id);
        let is_new = previous.is_none();

        if let Some(previous) = previous {
            if let (Some(last), Some(at)) = (previous.last_message, previous.last_message_at) {
                if room.last_message_at.map_or(true, |incoming| at > incoming) {
                    room.last_message_at = Some(at);
                    room.last_message = Some(last);
                }
            }
            room.unread_count = room.unread_count.max(previous.unread_count);
        }

        // Messages may have arrived before the room itself was known.
        if let Some(latest) = self
            .channels
            .get(&room_id)
            .and_then(RoomMessages::latest_confirmed)
            .and_then(StoredMessage::to_wire)
        {
            room.offer_last_message(&latest);
        }

        self.rooms.insert(room_id, room);
        is_new
    }

    pub fn update_room(&mut self, room_id: &str, name: Option<String>, image_url: Option<String>) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if name.is_some() {
            room.name = name;
        }
        if image_url.is_some() {
            room.image_url = image_url;
        }
        true
    }

    pub fn bump_unread(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.unread_count += 1;
        }
    }

    /// Add a participant, or reactivate one who left. Participants are never removed.
    pub fn participant_added(
        &mut self,
        room_id: &str,
        user_id: &str,
        user_name: &str,
        is_admin: bool,
        at: DateTime<Utc>,
    ) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        match room.participant_mut(user_id) {
            Some(participant) => {
                participant.is_active = true;
                participant.left_at = None;
                participant.user_name = user_name.to_string();
                participant.is_admin |= is_admin;
            }
            None => room.participants.push(Participant {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                is_active: true,
                is_admin,
                joined_at: at,
                left_at: None,
            }),
        }
        true
    }

    /// Mark a participant inactive (left or removed). History keeps the record.
    pub fn participant_departed(&mut self, room_id: &str, user_id: &str, at: DateTime<Utc>) -> bool {
        let Some(participant) = self
            .rooms
            .get_mut(room_id)
            .and_then(|room| room.participant_mut(user_id))
        else {
            return false;
        };
        if participant.is_active {
            participant.is_active = false;
            participant.left_at = Some(at);
        }
        true
    }

    pub fn participant_promoted(&mut self, room_id: &str, user_id: &str) -> bool {
        match self
            .rooms
            .get_mut(room_id)
            .and_then(|room| room.participant_mut(user_id))
        {
            Some(participant) => {
                participant.is_admin = true;
                true
            }
            None => false,
        }
    }

    // --- Incoming messages ---

    /// Reconcile one confirmed message from the server (event or REST).
    pub fn apply_incoming(&mut self, message: Message, is_pending: bool) -> Applied {
        let room_known = self.rooms.contains_key(&message.room_id);
        let channel = self.channels.entry(message.room_id.clone()).or_default();

        // 1. Idempotent dedup; only the status may move forward.
        if let Some(index) = channel.position_of(&message.id) {
            let existing = &mut channel.messages[index];
            let refreshed = existing.status.advance(message.status);
            let status_refreshed = refreshed != existing.status;
            existing.status = refreshed;
            return Applied {
                outcome: ApplyOutcome::Duplicate { status_refreshed },
                room_known,
            };
        }

        // 2. Our own message confirming a provisional record.
        if message.sender_id == self.self_user_id {
            if let Some(index) = channel
                .messages
                .iter()
                .position(|m| m.matches_confirmation(&message))
            {
                let temp_id = channel.messages[index]
                    .key
                    .temp_id()
                    .map(str::to_string)
                    .unwrap_or_default();
                self.optimistic.confirm(&temp_id);
                tracing::debug!("promoted {} to {}", temp_id, message.id);

                self.offer_last_message(&message);
                let channel = self.channels.entry(message.room_id.clone()).or_default();
                channel.messages[index] = StoredMessage::from_wire(message, is_pending);
                return Applied {
                    outcome: ApplyOutcome::Promoted { temp_id },
                    room_known,
                };
            }
        }

        // 3. Offline-queued messages go to their chronological slot; live ones are appended.
        let outcome = if is_pending {
            let index = channel.chronological_slot(message.created_at);
            channel
                .messages
                .insert(index, StoredMessage::from_wire(message.clone(), true));
            ApplyOutcome::Inserted { index }
        } else {
            channel
                .messages
                .push(StoredMessage::from_wire(message.clone(), false));
            ApplyOutcome::Appended
        };

        // 4. Room summary only moves forward in time.
        self.offer_last_message(&message);

        Applied { outcome, room_known }
    }

    fn offer_last_message(&mut self, message: &Message) {
        if let Some(room) = self.rooms.get_mut(&message.room_id) {
            room.offer_last_message(message);
        }
    }

    /// Merge a history page: union on confirmed id, then stable-sort by creation time.
    /// Returns how many records were new.
    pub fn merge_history(&mut self, room_id: &str, page: MessagesPage) -> usize {
        let channel = self.channels.entry(room_id.to_string()).or_default();
        let mut index: HashMap<String, usize> = channel
            .messages
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.id().map(|id| (id.to_string(), i)))
            .collect();

        let mut added = 0;
        let mut newest: Option<Message> = None;
        for message in page.items {
            if newest
                .as_ref()
                .map_or(true, |n| message.created_at > n.created_at)
            {
                newest = Some(message.clone());
            }
            match index.get(&message.id) {
                Some(&i) => {
                    let existing = &mut channel.messages[i];
                    existing.status = existing.status.advance(message.status);
                }
                None => {
                    index.insert(message.id.clone(), channel.messages.len());
                    channel.messages.push(StoredMessage::from_wire(message, false));
                    added += 1;
                }
            }
        }

        channel.messages.sort_by_key(|m| m.created_at);
        channel.is_loaded = true;
        channel.has_more = page.has_more;

        if let Some(newest) = newest {
            self.offer_last_message(&newest);
        }
        added
    }

    // --- Optimistic sends ---

    /// Create and append a provisional record from the local user.
    pub fn create_provisional(
        &mut self,
        room_id: &str,
        content: &str,
        attachment: Option<Attachment>,
        preview: Option<LocalPreviewHandle>,
    ) -> StoredMessage {
        let record = self.optimistic.create_pending(
            room_id,
            &self.self_user_id,
            content,
            attachment,
            preview,
        );
        self.channels
            .entry(room_id.to_string())
            .or_default()
            .messages
            .push(record.clone());
        record
    }

    pub fn arm_deadline(&mut self, temp_id: &str, timer: TimerHandle) {
        self.optimistic.arm(temp_id, timer);
    }

    pub fn send_deadline(&self, temp_id: &str) -> Option<Instant> {
        self.optimistic.deadline_of(temp_id)
    }

    /// Cancel the deadline timer of a still-pending send and return its
    /// deadline. `None` once the send was confirmed or rolled back.
    pub fn detach_deadline(&mut self, temp_id: &str) -> Option<Instant> {
        self.optimistic.detach_deadline(temp_id)
    }

    /// Substitute the provisional record `temp_id` with the message the REST
    /// API returned. Falls back to normal reconciliation if the provisional
    /// record is already gone.
    pub fn confirm_provisional(&mut self, temp_id: &str, message: Message) -> ApplyOutcome {
        self.optimistic.confirm(temp_id);

        let room_id = message.room_id.clone();
        let Some(channel) = self.channels.get_mut(&room_id) else {
            return self.apply_incoming(message, false).outcome;
        };
        let Some(index) = channel.position_of_temp(temp_id) else {
            return self.apply_incoming(message, false).outcome;
        };

        // The live event may have delivered the confirmed record first.
        if channel.position_of(&message.id).is_some() {
            channel.messages.remove(index);
            return ApplyOutcome::Duplicate {
                status_refreshed: false,
            };
        }

        channel.messages[index] = StoredMessage::from_wire(message.clone(), false);
        self.offer_last_message(&message);
        ApplyOutcome::Promoted {
            temp_id: temp_id.to_string(),
        }
    }

    /// Remove a provisional record after a failed send, releasing what it owned.
    pub fn rollback(&mut self, temp_id: &str) -> Option<StoredMessage> {
        let pending = self.optimistic.discard(temp_id)?;
        let removed = self.remove_provisional(&pending.room_id, temp_id);
        pending.release();
        removed
    }

    /// The confirmation deadline for `temp_id` elapsed. Returns the removed
    /// record, or `None` if it was confirmed in the meantime.
    pub fn expire(&mut self, temp_id: &str) -> Option<StoredMessage> {
        let pending = self.optimistic.on_deadline(temp_id)?;
        tracing::warn!("send {} in {} was not confirmed in time", temp_id, pending.room_id);
        let removed = self.remove_provisional(&pending.room_id, temp_id);
        pending.release();
        removed
    }

    fn remove_provisional(&mut self, room_id: &str, temp_id: &str) -> Option<StoredMessage> {
        let channel = self.channels.get_mut(room_id)?;
        let index = channel.position_of_temp(temp_id)?;
        Some(channel.messages.remove(index))
    }

    // --- Edits and deletions ---

    /// Replace the record `original_id` in place with `new_message`.
    /// Idempotent: re-applying the same edit, or applying it over a local
    /// pre-update, leaves one record.
    pub fn apply_edit(&mut self, room_id: &str, original_id: &str, new_message: Message) -> bool {
        let Some(channel) = self.channels.get_mut(room_id) else {
            return false;
        };

        let applied = match channel.position_of(original_id) {
            Some(index) => {
                if new_message.id != original_id {
                    if let Some(dup) = channel.position_of(&new_message.id) {
                        channel.messages.remove(dup);
                    }
                }
                let index = channel.position_of(original_id).unwrap_or(index);
                let is_pending = channel.messages[index].is_pending;
                let status = channel.messages[index].status;
                let mut record = StoredMessage::from_wire(new_message.clone(), is_pending);
                record.status = status.advance(record.status);
                channel.messages[index] = record;
                true
            }
            None => match channel.position_of(&new_message.id) {
                Some(index) => {
                    let existing = &mut channel.messages[index];
                    existing.content = new_message.content.clone();
                    existing.attachment = new_message.attachment.clone();
                    existing.edited_at = new_message.edited_at;
                    true
                }
                None => false,
            },
        };

        if applied {
            if let Some(room) = self.rooms.get_mut(room_id) {
                let shows_original = room
                    .last_message
                    .as_ref()
                    .is_some_and(|m| m.id == original_id || m.id == new_message.id);
                if shows_original {
                    room.last_message = Some(new_message);
                }
            }
        }
        applied
    }

    /// Optimistically change the text of a confirmed message. Returns the
    /// previous record so the caller can restore it if the server refuses.
    pub fn edit_local(&mut self, room_id: &str, message_id: &str, content: &str) -> Option<StoredMessage> {
        let channel = self.channels.get_mut(room_id)?;
        let index = channel.position_of(message_id)?;
        let previous = channel.messages[index].clone();
        let record = &mut channel.messages[index];
        record.content = content.to_string();
        record.edited_at = Some(Utc::now());
        Some(previous)
    }

    /// Put back a record captured by [`edit_local`](Self::edit_local) or
    /// removed by [`remove_message`](Self::remove_message).
    pub fn restore(&mut self, record: StoredMessage) {
        let Some(wire) = record.to_wire() else {
            return;
        };
        let id = wire.id.clone();
        self.offer_last_message(&wire);
        let channel = self.channels.entry(record.room_id.clone()).or_default();
        match channel.position_of(&id) {
            Some(index) => channel.messages[index] = record,
            None => {
                let index = channel.chronological_slot(record.created_at);
                channel.messages.insert(index, record);
            }
        }
    }

    /// Remove a confirmed message. Idempotent; returns the removed record.
    pub fn remove_message(&mut self, room_id: &str, message_id: &str) -> Option<StoredMessage> {
        let channel = self.channels.get_mut(room_id)?;
        let index = channel.position_of(message_id)?;
        let removed = channel.messages.remove(index);
        let replacement = channel.latest_confirmed().and_then(StoredMessage::to_wire);

        if let Some(room) = self.rooms.get_mut(room_id) {
            if room.last_message.as_ref().is_some_and(|m| m.id == message_id) {
                room.last_message_at = replacement.as_ref().map(|m| m.created_at);
                room.last_message = replacement;
            }
        }
        Some(removed)
    }

    // --- Statuses ---

    /// Flip to `read` every message created at or before `at` that `reader_id`
    /// did not send. A local reader reads everyone else's messages; a remote
    /// reader reads ours. Returns how many records changed.
    pub fn apply_read(&mut self, room_id: &str, reader_id: &str, at: DateTime<Utc>) -> usize {
        let reader_is_self = reader_id == self.self_user_id;
        let mut changed = 0;

        if let Some(channel) = self.channels.get_mut(room_id) {
            for message in channel.messages.iter_mut() {
                if message.is_provisional() || message.created_at > at {
                    continue;
                }
                let eligible = if reader_is_self {
                    message.sender_id != self.self_user_id
                } else {
                    message.sender_id == self.self_user_id
                };
                if eligible && message.status < MessageStatus::Read {
                    message.status = MessageStatus::Read;
                    changed += 1;
                }
            }
        }

        if reader_is_self {
            if let Some(room) = self.rooms.get_mut(room_id) {
                room.unread_count = 0;
            }
        }
        changed
    }

    /// Refresh the status of a confirmed message wherever it lives.
    pub fn apply_status(&mut self, message_id: &str, status: MessageStatus) -> bool {
        for channel in self.channels.values_mut() {
            if let Some(index) = channel.position_of(message_id) {
                let record = &mut channel.messages[index];
                let refreshed = record.status.advance(status);
                let changed = refreshed != record.status;
                record.status = refreshed;
                return changed;
            }
        }
        false
    }
}
