//! REST client for the chat API.

use async_trait::async_trait;
use relaychat_shared::{
    AddParticipantsRequest, ApiError, CreateMessageRequest, EditMessageRequest, Message,
    MessagesPage, Room, UpdateRoomRequest,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::config::Credentials;
use crate::optimistic::LocalPreviewHandle;

/// A file the user is about to send.
#[derive(Debug)]
pub struct OutgoingAttachment {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    /// Local preview shown while the upload is in flight.
    pub preview: Option<LocalPreviewHandle>,
}

impl OutgoingAttachment {
    pub fn new(file_name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime: mime.into(),
            bytes,
            preview: None,
        }
    }

    pub fn with_preview(mut self, preview: LocalPreviewHandle) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// The REST operations the engine depends on.
#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    async fn fetch_rooms(&self) -> Result<Vec<Room>, ApiError>;
    async fn fetch_room(&self, room_id: &str) -> Result<Room, ApiError>;
    async fn fetch_messages(&self, room_id: &str, limit: u32, offset: u32) -> Result<MessagesPage, ApiError>;
    async fn send_message(
        &self,
        room_id: &str,
        content: &str,
        attachment: Option<&OutgoingAttachment>,
    ) -> Result<Message, ApiError>;
    async fn mark_as_read(&self, room_id: &str) -> Result<(), ApiError>;
    async fn edit_message(&self, message_id: &str, content: &str) -> Result<Message, ApiError>;
    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError>;
    async fn rename_room(&self, room_id: &str, name: &str) -> Result<Room, ApiError>;
    async fn update_room_image(&self, room_id: &str, image_url: &str) -> Result<Room, ApiError>;
    async fn add_participants(&self, room_id: &str, user_ids: &[String]) -> Result<Room, ApiError>;
    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), ApiError>;
}

/// HTTP client carrying the bearer token and tenant header on every request.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    company_id: Option<String>,
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
            token: None,
            company_id: None,
        }
    }

    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self::new()
            .with_base_url(credentials.api_url.clone())
            .with_auth(Some(credentials.token.clone()), credentials.tenant().map(str::to_string))
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_auth(mut self, token: Option<String>, company_id: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self.company_id = company_id;
        self
    }

    /// The base URL with `segments` appended, each one percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ApiError::Network(format!("invalid base url {:?}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Network(format!("base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, mut rb: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            rb = rb.bearer_auth(token);
        }
        if let Some(company_id) = &self.company_id {
            rb = rb.header("X-Company-Id", company_id);
        }
        rb
    }

    async fn execute(&self, rb: RequestBuilder) -> Result<String, ApiError> {
        let resp = self
            .authorize(rb)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            tracing::warn!("request failed with status {}", status);
            return Err(ApiError::Http { status, body: text });
        }
        Ok(text)
    }

    fn decode<TRes: DeserializeOwned>(text: &str) -> Result<TRes, ApiError> {
        let text = if text.is_empty() { "null" } else { text };
        serde_json::from_str(text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    pub async fn get_json<TRes: DeserializeOwned>(&self, url: Url) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.get(url)).await?;
        Self::decode(&text)
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        url: Url,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.post(url).json(body)).await?;
        Self::decode(&text)
    }

    pub async fn patch_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        url: Url,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.patch(url).json(body)).await?;
        Self::decode(&text)
    }

    pub async fn post_multipart<TRes: DeserializeOwned>(
        &self,
        url: Url,
        form: reqwest::multipart::Form,
    ) -> Result<TRes, ApiError> {
        let text = self.execute(self.client.post(url).multipart(form)).await?;
        Self::decode(&text)
    }

    pub async fn delete(&self, url: Url) -> Result<(), ApiError> {
        self.execute(self.client.delete(url)).await?;
        Ok(())
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn fetch_rooms(&self) -> Result<Vec<Room>, ApiError> {
        self.get_json(self.endpoint(&["chat", "rooms"])?).await
    }

    async fn fetch_room(&self, room_id: &str) -> Result<Room, ApiError> {
        self.get_json(self.endpoint(&["chat", "rooms", room_id])?).await
    }

    async fn fetch_messages(&self, room_id: &str, limit: u32, offset: u32) -> Result<MessagesPage, ApiError> {
        let mut url = self.endpoint(&["chat", "rooms", room_id, "messages"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        self.get_json(url).await
    }

    async fn send_message(
        &self,
        room_id: &str,
        content: &str,
        attachment: Option<&OutgoingAttachment>,
    ) -> Result<Message, ApiError> {
        let url = self.endpoint(&["chat", "rooms", room_id, "messages"])?;
        match attachment {
            None => {
                let body = CreateMessageRequest {
                    content: content.to_string(),
                };
                self.post_json(url, &body).await
            }
            Some(attachment) => {
                let part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                    .file_name(attachment.file_name.clone())
                    .mime_str(&attachment.mime)
                    .map_err(|e| ApiError::Network(e.to_string()))?;
                let form = reqwest::multipart::Form::new()
                    .text("content", content.to_string())
                    .part("file", part);
                self.post_multipart(url, form).await
            }
        }
    }

    async fn mark_as_read(&self, room_id: &str) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .post_json(
                self.endpoint(&["chat", "rooms", room_id, "read"])?,
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }

    async fn edit_message(&self, message_id: &str, content: &str) -> Result<Message, ApiError> {
        let body = EditMessageRequest {
            content: content.to_string(),
        };
        self.patch_json(self.endpoint(&["chat", "messages", message_id])?, &body)
            .await
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        self.delete(self.endpoint(&["chat", "messages", message_id])?)
            .await
    }

    async fn rename_room(&self, room_id: &str, name: &str) -> Result<Room, ApiError> {
        let body = UpdateRoomRequest {
            name: Some(name.to_string()),
            ..UpdateRoomRequest::default()
        };
        self.patch_json(self.endpoint(&["chat", "rooms", room_id])?, &body)
            .await
    }

    async fn update_room_image(&self, room_id: &str, image_url: &str) -> Result<Room, ApiError> {
        let body = UpdateRoomRequest {
            image_url: Some(image_url.to_string()),
            ..UpdateRoomRequest::default()
        };
        self.patch_json(self.endpoint(&["chat", "rooms", room_id])?, &body)
            .await
    }

    async fn add_participants(&self, room_id: &str, user_ids: &[String]) -> Result<Room, ApiError> {
        let body = AddParticipantsRequest {
            user_ids: user_ids.to_vec(),
        };
        self.post_json(self.endpoint(&["chat", "rooms", room_id, "participants"])?, &body)
            .await
    }

    async fn remove_participant(&self, room_id: &str, user_id: &str) -> Result<(), ApiError> {
        self.delete(self.endpoint(&["chat", "rooms", room_id, "participants", user_id])?)
            .await
    }
}
