//! Pure validators shared by the engine and the UI layer.

use crate::error::ValidationError;

/// Maximum message length in characters.
pub const MAX_MESSAGE_LENGTH: usize = 5000;

/// Maximum attachment size in bytes (10 MiB).
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

pub const ALLOWED_ATTACHMENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
    "text/plain",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// Validate message text. Empty text is only allowed alongside an attachment.
pub fn validate_message_content(content: &str, has_attachment: bool) -> Result<(), ValidationError> {
    if content.trim().is_empty() && !has_attachment {
        return Err(ValidationError::EmptyMessage);
    }
    let length = content.chars().count();
    if length > MAX_MESSAGE_LENGTH {
        return Err(ValidationError::MessageTooLong {
            length,
            max: MAX_MESSAGE_LENGTH,
        });
    }
    Ok(())
}

pub fn validate_attachment(mime: &str, size: u64) -> Result<(), ValidationError> {
    if !ALLOWED_ATTACHMENT_TYPES.contains(&mime) {
        return Err(ValidationError::UnsupportedAttachmentType(mime.to_string()));
    }
    if size > MAX_ATTACHMENT_BYTES {
        return Err(ValidationError::AttachmentTooLarge {
            size,
            max: MAX_ATTACHMENT_BYTES,
        });
    }
    Ok(())
}
