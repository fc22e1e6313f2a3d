//! Provisional messages that exist locally until the server confirms them.
//!
//! Every provisional record has a [`PendingSend`] with a deadline. Confirming
//! cancels the deadline timer before anything else happens, so a rollback can
//! never run after confirmation has begun.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use relaychat_shared::{Attachment, MessageStatus};
use tokio::time::Instant;

use crate::stores::{MessageKey, StoredMessage};
use crate::timer::TimerHandle;

/// A local resource backing an optimistic attachment preview (for example a
/// temporary file or an object URL held by the UI).
///
/// Released exactly once: explicitly through [`release`](Self::release), or on
/// drop if nobody did.
pub struct LocalPreviewHandle {
    id: String,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LocalPreviewHandle {
    pub fn new(id: impl Into<String>, on_release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            tracing::debug!("releasing local preview {}", self.id);
            on_release();
        }
    }
}

impl Drop for LocalPreviewHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for LocalPreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPreviewHandle")
            .field("id", &self.id)
            .field("released", &self.on_release.is_none())
            .finish()
    }
}

/// Bookkeeping for one unconfirmed send.
#[derive(Debug)]
pub struct PendingSend {
    pub temp_id: String,
    pub room_id: String,
    pub deadline: Instant,
    preview: Option<LocalPreviewHandle>,
    timer: TimerHandle,
}

impl PendingSend {
    /// Release what the provisional record owned. Called on rollback.
    pub fn release(self) {
        self.finish();
    }

    fn finish(mut self) {
        self.timer.cancel();
        if let Some(preview) = self.preview.take() {
            preview.release();
        }
    }
}

/// Creates provisional records and decides when they must be rolled back.
#[derive(Debug)]
pub struct OptimisticMessageTracker {
    deadline: Duration,
    pending: HashMap<String, PendingSend>,
}

impl OptimisticMessageTracker {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            pending: HashMap::new(),
        }
    }

    /// Allocate a temp id and build the provisional record with status `sending`.
    pub fn create_pending(
        &mut self,
        room_id: &str,
        sender_id: &str,
        content: &str,
        attachment: Option<Attachment>,
        preview: Option<LocalPreviewHandle>,
    ) -> StoredMessage {
        let temp_id = format!("temp-{}", uuid::Uuid::new_v4());
        self.pending.insert(
            temp_id.clone(),
            PendingSend {
                temp_id: temp_id.clone(),
                room_id: room_id.to_string(),
                deadline: Instant::now() + self.deadline,
                preview,
                timer: TimerHandle::default(),
            },
        );

        StoredMessage {
            key: MessageKey::Provisional(temp_id),
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: None,
            content: content.to_string(),
            attachment,
            status: MessageStatus::Sending,
            created_at: Utc::now(),
            is_system_message: false,
            is_pending: false,
            edited_at: None,
        }
    }

    /// Attach the deadline timer for `temp_id`. Dropped straight away if the
    /// send is no longer pending.
    pub fn arm(&mut self, temp_id: &str, mut timer: TimerHandle) {
        match self.pending.get_mut(temp_id) {
            Some(pending) => {
                pending.timer.cancel();
                pending.timer = timer;
            }
            None => {
                timer.cancel();
            }
        }
    }

    /// Server confirmed the send. Cancels the timer, then releases the preview.
    /// Returns false if the send was not pending (already confirmed or rolled back).
    pub fn confirm(&mut self, temp_id: &str) -> bool {
        match self.pending.remove(temp_id) {
            Some(pending) => {
                pending.finish();
                true
            }
            None => false,
        }
    }

    /// The deadline for `temp_id` elapsed. Returns the pending send if it still
    /// needs rolling back; `None` once confirmed.
    pub fn on_deadline(&mut self, temp_id: &str) -> Option<PendingSend> {
        let mut pending = self.pending.remove(temp_id)?;
        pending.timer.disarm();
        Some(pending)
    }

    /// Drop a pending send for any other reason (send failure, explicit removal).
    pub fn discard(&mut self, temp_id: &str) -> Option<PendingSend> {
        let mut pending = self.pending.remove(temp_id)?;
        pending.timer.cancel();
        Some(pending)
    }

    pub fn deadline_of(&self, temp_id: &str) -> Option<Instant> {
        self.pending.get(temp_id).map(|pending| pending.deadline)
    }

    /// Stop the deadline timer for `temp_id` and hand its deadline to the
    /// caller, who becomes responsible for enforcing it.
    pub fn detach_deadline(&mut self, temp_id: &str) -> Option<Instant> {
        let pending = self.pending.get_mut(temp_id)?;
        pending.timer.cancel();
        Some(pending.deadline)
    }

    pub fn is_pending(&self, temp_id: &str) -> bool {
        self.pending.contains_key(temp_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
