//! Real-time transport: the link abstraction, the websocket connector and the
//! connection manager.
//!
//! ```text
//!   ChatEngine ──intents──▶ ConnectionManager ──▶ Connector::open ──▶ Link
//!       ▲                         │ (backoff, cooldown, generation)     │
//!       └──── TransportEvent ◀────┴────────── pump ◀── LinkEvent ◀──────┘
//! ```

mod connection;
mod manager;

pub use connection::{
    CloseReason, ConnectionState, ConnectionStatus, Connector, Link, LinkEvent, TransportEvent,
    WsConnector, WsHandle,
};
pub use manager::{ConnectOutcome, ConnectionManager};
