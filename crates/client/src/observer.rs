//! Hooks the engine calls into the embedding application.

use crate::error::SyncError;

/// Tells the engine which room the user is looking at.
pub trait FocusOracle: Send + Sync + 'static {
    fn is_room_foreground(&self, room_id: &str) -> bool;
}

/// No room is ever in the foreground.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverFocused;

impl FocusOracle for NeverFocused {
    fn is_room_foreground(&self, _room_id: &str) -> bool {
        false
    }
}

/// Notifications out of the engine. Every method defaults to doing nothing.
pub trait EngineObserver: Send + Sync + 'static {
    /// Someone else wrote in a room the user does not have open.
    fn on_inbound_message_for_unopened_room(&self, _room_id: &str) {}

    /// A send was rolled back.
    fn on_send_failed(&self, _room_id: &str, _temp_id: &str, _error: &SyncError) {}

    /// The server reported an error event.
    fn on_error(&self, _message: &str) {}

    /// The store changed for `room_id`; take a new snapshot.
    fn on_store_changed(&self, _room_id: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl EngineObserver for NoopObserver {}
