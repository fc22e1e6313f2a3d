//! Shared error types including RFC7807 Problem Details.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RFC7807 Problem Details (application/problem+json)
///
/// The chat API reports failures with this envelope; clients surface `detail`
/// instead of the raw body when it is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    #[serde(rename = "type", default)]
    pub type_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Attempt to parse an RFC7807 (or RFC7807-ish) JSON body into a user-facing message.
/// Prefers `detail`, falls back to `title`.
pub fn try_problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    if let Some(detail) = parsed.detail {
        if !detail.trim().is_empty() {
            return Some(detail);
        }
    }
    if !parsed.title.trim().is_empty() {
        return Some(parsed.title);
    }
    None
}

/// REST collaborator failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// Human-readable message, using the problem detail of HTTP failures when available.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Http { body, status } => {
                try_problem_detail(body).unwrap_or_else(|| format!("Request failed ({status})"))
            }
            other => other.to_string(),
        }
    }
}

/// Rejection by one of the pure message validators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("message is {length} characters long, the limit is {max}")]
    MessageTooLong { length: usize, max: usize },
    #[error("attachment type `{0}` is not allowed")]
    UnsupportedAttachmentType(String),
    #[error("attachment is {size} bytes, the limit is {max}")]
    AttachmentTooLarge { size: u64, max: u64 },
}
