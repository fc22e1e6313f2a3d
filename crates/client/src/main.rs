//! relaychat - tail a chat server from the command line
//!
//! Connects with credentials from `RELAYCHAT_*` environment variables, loads
//! the rooms list, joins every room and logs activity until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use relaychat_client::{ChatEngine, Credentials, EngineConfig, EngineObserver, SyncError};
use tracing_subscriber::EnvFilter;

struct LogObserver;

impl EngineObserver for LogObserver {
    fn on_inbound_message_for_unopened_room(&self, room_id: &str) {
        tracing::info!("new message in {}", room_id);
    }

    fn on_send_failed(&self, room_id: &str, temp_id: &str, error: &SyncError) {
        tracing::warn!("send {} in {} failed: {}", temp_id, room_id, error.user_message());
    }

    fn on_error(&self, message: &str) {
        tracing::error!("server: {}", message);
    }
}

/// The binary logs under its own target, the engine under the library's.
const DEFAULT_LOG_FILTER: &str = "relaychat=debug,relaychat_client=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = EngineConfig::from_env();
    let credentials = Credentials::from_env();
    let user_id = std::env::var("RELAYCHAT_USER_ID").context("RELAYCHAT_USER_ID is not set")?;

    let engine = ChatEngine::builder(user_id, credentials)
        .config(config)
        .observer(Arc::new(LogObserver))
        .build();

    let outcome = engine.connect().await.context("connect")?;
    tracing::info!("connection: {:?}", outcome);

    match engine.load_rooms(false).await {
        Ok(rooms) => {
            for room in &rooms {
                tracing::info!(
                    "{} {} ({} unread)",
                    room.id,
                    room.name.as_deref().unwrap_or("-"),
                    room.unread_count
                );
            }
        }
        Err(e) => tracing::warn!("could not load rooms: {}", e.user_message()),
    }

    tokio::select! {
        _ = engine.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    engine.disconnect();
    Ok(())
}
