// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Message validation module.

use okean_common::ClientMessage;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

// Common validation constants
const MAX_IDENTIFIER_LENGTH: usize = 64;
const MAX_USER_ID_LENGTH: usize = 128;
/// Longest chat or private message body accepted
pub const MAX_CONTENT_LENGTH: usize = 2000;

/// Prefix of groups that clients join directly
pub const CHANNEL_PREFIX: &str = "channel:";
/// Prefix of groups backing multi-party call rooms
pub const ROOM_PREFIX: &str = "room:";

// Regex patterns for validation
static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
static GROUP_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(channel|room):[A-Za-z0-9_-]{1,64}$").unwrap());
static USER_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._@-]+$").unwrap());

/// Possible validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid group name: {0}")]
    InvalidGroupName(String),

    #[error("Invalid room ID: {0}")]
    InvalidRoomId(String),

    #[error("Invalid user ID: {0}")]
    InvalidUserId(String),

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate any group name (`channel:<id>` or `room:<id>`)
pub fn validate_group_name(group: &str) -> ValidationResult<&str> {
    if !GROUP_NAME_REGEX.is_match(group) {
        return Err(ValidationError::InvalidGroupName(format!(
            "'{group}' must look like channel:<id> or room:<id> with at most {MAX_IDENTIFIER_LENGTH} id characters"
        )));
    }
    Ok(group)
}

/// Validate a group a client may join directly. Room groups are only
/// entered through `JoinRoom`.
pub fn validate_channel_group(group: &str) -> ValidationResult<&str> {
    validate_group_name(group)?;
    if !group.starts_with(CHANNEL_PREFIX) {
        return Err(ValidationError::InvalidGroupName(format!(
            "'{group}' is not a channel group"
        )));
    }
    Ok(group)
}

/// Validate a call room identifier
pub fn validate_room_id(room_id: &str) -> ValidationResult<&str> {
    if !IDENTIFIER_REGEX.is_match(room_id) {
        return Err(ValidationError::InvalidRoomId(format!(
            "Room ID must be 1-{MAX_IDENTIFIER_LENGTH} alphanumeric, '-' or '_' characters"
        )));
    }
    Ok(room_id)
}

/// Broadcast group backing a call room
pub fn room_group(room_id: &str) -> String {
    format!("{ROOM_PREFIX}{room_id}")
}

/// Validate a user identifier
pub fn validate_user_id(user_id: &str) -> ValidationResult<&str> {
    if user_id.is_empty() || user_id.len() > MAX_USER_ID_LENGTH {
        return Err(ValidationError::InvalidUserId(format!(
            "User ID must be between 1 and {MAX_USER_ID_LENGTH} characters"
        )));
    }
    if !USER_ID_REGEX.is_match(user_id) {
        return Err(ValidationError::InvalidUserId(format!(
            "'{user_id}' contains unsupported characters"
        )));
    }
    Ok(user_id)
}

/// Validate a chat message body, returning it trimmed
pub fn validate_content(content: &str) -> ValidationResult<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidContent(
            "Message must not be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_CONTENT_LENGTH {
        return Err(ValidationError::InvalidContent(format!(
            "Message must be at most {MAX_CONTENT_LENGTH} characters"
        )));
    }
    Ok(trimmed)
}

/// Signaling payloads are opaque; only their size is checked
pub fn validate_payload(payload: &str, max_bytes: usize) -> ValidationResult<()> {
    if payload.len() > max_bytes {
        return Err(ValidationError::InvalidPayload(format!(
            "Payload of {} bytes exceeds the {max_bytes} byte limit",
            payload.len()
        )));
    }
    Ok(())
}

/// Validates a client message before it reaches the relay
pub fn validate_client_message(message: &ClientMessage, max_payload_bytes: usize) -> ValidationResult<()> {
    match message {
        ClientMessage::JoinGroup { group } | ClientMessage::LeaveGroup { group } => {
            validate_channel_group(group)?;
        },
        ClientMessage::SendToGroup { group, content } => {
            validate_group_name(group)?;
            validate_content(content)?;
        },
        ClientMessage::StartTyping { group } | ClientMessage::StopTyping { group } => {
            validate_group_name(group)?;
        },
        ClientMessage::SendPrivateMessage {
            target_user_id,
            content,
        } => {
            validate_user_id(target_user_id)?;
            validate_content(content)?;
        },
        ClientMessage::MarkMessagesRead { from_user_id } => {
            validate_user_id(from_user_id)?;
        },
        ClientMessage::InitiateCall { target_user_id, .. }
        | ClientMessage::HangUp { target_user_id } => {
            validate_user_id(target_user_id)?;
        },
        ClientMessage::SendOffer {
            target_user_id,
            payload,
            room_id,
            ..
        }
        | ClientMessage::SendAnswer {
            target_user_id,
            payload,
            room_id,
            ..
        }
        | ClientMessage::SendIceCandidate {
            target_user_id,
            payload,
            room_id,
            ..
        } => {
            validate_user_id(target_user_id)?;
            validate_payload(payload, max_payload_bytes)?;
            if let Some(room_id) = room_id {
                validate_room_id(room_id)?;
            }
        },
        ClientMessage::JoinRoom { room_id, .. }
        | ClientMessage::LeaveRoom { room_id }
        | ClientMessage::GetRoomUsers { room_id }
        | ClientMessage::SetMediaState { room_id, .. } => {
            validate_room_id(room_id)?;
        },
        ClientMessage::AcceptCall { .. }
        | ClientMessage::RejectCall { .. }
        | ClientMessage::CancelCall { .. }
        | ClientMessage::EndCall { .. }
        | ClientMessage::GetOnlineUsers => {},
    }

    Ok(())
}
