//! Local state: messages, rooms and the rooms list cache.

pub mod messages;
pub mod rooms;

pub use messages::{Applied, ApplyOutcome, MessageKey, MessageStore, RoomMessages, StoredMessage};
pub use rooms::RoomsCache;
