//! Engine error type.

use relaychat_shared::{ApiError, ValidationError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// No tenant identifier configured. Nothing is attempted until it is supplied.
    #[error("missing company identifier")]
    MissingTenant,
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("message was not confirmed in time")]
    SendTimeout,
    #[error("unknown message `{0}`")]
    UnknownMessage(String),
}

impl SyncError {
    /// Text suitable for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Api(err) => err.user_message(),
            other => other.to_string(),
        }
    }
}
