//! Websocket connector using tokio-tungstenite.

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use relaychat_shared::{ServerEvent, WsEnvelope};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{CloseReason, Connector, Link, LinkEvent};
use crate::config::Credentials;
use crate::error::SyncError;

/// Opens JSON-over-websocket links. Credentials travel in the query string.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }

    fn build_url(credentials: &Credentials) -> Result<Url, SyncError> {
        let company_id = credentials.tenant().ok_or(SyncError::MissingTenant)?;
        let mut url = Url::parse(&credentials.ws_url)
            .map_err(|e| SyncError::Transport(format!("invalid websocket url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("token", &credentials.token)
            .append_pair("companyId", company_id);
        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, credentials: &Credentials) -> Result<Link, SyncError> {
        let url = Self::build_url(credentials)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        tracing::info!("websocket connected to {}", host);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = unbounded();
        let (inbound_tx, inbound_rx) = unbounded();

        // Read task
        let host_for_read = host.clone();
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsEnvelope<ServerEvent>>(&text) {
                            Ok(event) => forward(&inbound_tx, LinkEvent::Event(event)),
                            Err(e) => tracing::error!("failed to parse event: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("websocket to {} received close frame", host_for_read);
                        break CloseReason::ServerRequested;
                    }
                    // Pong is handled automatically by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("websocket read error: {}", e);
                        break CloseReason::Transport(e.to_string());
                    }
                    None => break CloseReason::Transport("stream ended".to_string()),
                }
            };
            forward(&inbound_tx, LinkEvent::Closed(reason));
        });

        // Write task
        tokio::spawn(async move {
            while let Some(cmd) = outbound_rx.next().await {
                match serde_json::to_string(&cmd) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            tracing::warn!("send to {} failed: {}", host, e);
                            break;
                        }
                    }
                    Err(e) => tracing::error!("serialize failed: {}", e),
                }
            }
            // Sender dropped or closed: shut the socket so the read task ends too.
            let _ = write.close().await;
            tracing::debug!("write task for {} stopped", host);
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn forward(tx: &UnboundedSender<LinkEvent>, event: LinkEvent) {
    if tx.unbounded_send(event).is_err() {
        tracing::debug!("link receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_token_and_tenant() {
        let creds = Credentials {
            ws_url: "wss://chat.example.com/ws".to_string(),
            token: "t0k".to_string(),
            company_id: Some("acme".to_string()),
            ..Credentials::default()
        };
        let url = WsConnector::build_url(&creds).unwrap();
        assert_eq!(url.host_str(), Some("chat.example.com"));
        assert_eq!(url.query(), Some("token=t0k&companyId=acme"));
    }

    #[test]
    fn url_requires_tenant() {
        let creds = Credentials {
            ws_url: "wss://chat.example.com/ws".to_string(),
            ..Credentials::default()
        };
        assert_eq!(
            WsConnector::build_url(&creds).unwrap_err(),
            SyncError::MissingTenant
        );
    }
}
