//! Routes inbound server events to one handler per event kind.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use relaychat_shared::{EventKind, ServerEvent};

type Handler<C> = Arc<dyn Fn(&C, ServerEvent) + Send + Sync>;

/// Publish/subscribe registry keyed by [`EventKind`].
///
/// Registering a kind again replaces the previous handler, so re-registering
/// on every reconnect never stacks duplicates.
pub struct EventDispatcher<C> {
    handlers: RwLock<HashMap<EventKind, Handler<C>>>,
}

impl<C> Default for EventDispatcher<C> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<C> EventDispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any existing one.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&C, ServerEvent) + Send + Sync + 'static,
    {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(kind, Arc::new(handler))
            .is_some();
        if replaced {
            tracing::debug!("replaced handler for {}", kind);
        }
    }

    pub fn off(&self, kind: EventKind) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&kind)
            .is_some()
    }

    pub fn clear(&self) {
        self.handlers.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route `event` to its handler. Returns false if none is registered.
    pub fn dispatch(&self, ctx: &C, event: ServerEvent) -> bool {
        let kind = event.kind();
        // Clone the handler out so it can re-enter the registry.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .cloned();
        match handler {
            Some(handler) => {
                tracing::debug!("dispatching {}", kind);
                handler(ctx, event);
                true
            }
            None => {
                tracing::debug!("no handler for {}", kind);
                false
            }
        }
    }
}
