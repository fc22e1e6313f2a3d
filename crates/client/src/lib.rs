//! relaychat client - chat synchronization engine
//!
//! Keeps a local view of rooms and messages consistent with the server over a
//! reconnecting websocket, with optimistic sends, deduplication, ordered
//! reconciliation and read receipts. REST is used for history, attachments and
//! as a fallback transport.

pub mod api_client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod observer;
pub mod optimistic;
pub mod receipts;
pub mod stores;
pub mod subscriptions;
pub mod timer;
pub mod ws;

pub use api_client::{ApiClient, ChatApi, OutgoingAttachment};
pub use config::{Credentials, EngineConfig, ReconnectConfig};
pub use engine::{ChatEngine, ChatEngineBuilder};
pub use error::SyncError;
pub use observer::{EngineObserver, FocusOracle, NeverFocused, NoopObserver};
pub use optimistic::LocalPreviewHandle;
pub use receipts::MarkReadOutcome;
pub use stores::{MessageKey, RoomsCache, StoredMessage};
pub use ws::{ConnectOutcome, ConnectionState, ConnectionStatus};
