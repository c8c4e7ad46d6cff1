//! Chat service — room-scoped messages alongside the canvas.
//!
//! A pub's chat shares its canvas room, so membership and fan-out reuse the
//! gateway. Messages are broadcast only, never stored.

use tracing::debug;
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame, now_ms};
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("connection is not a member of room {0}")]
    NotAMember(String),
    #[error("connection has not joined a room")]
    NoRoom,
    #[error("message must not be empty")]
    Empty,
    #[error("message exceeds {0} characters")]
    TooLong(usize),
}

impl ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAMember(_) | Self::NoRoom => "E_NOT_A_MEMBER",
            Self::Empty | Self::TooLong(_) => "E_INVALID_REQUEST",
        }
    }
}

/// Broadcast a chat message to the sender's room, sender included.
///
/// `room_id` defaults to the connection's current room. Returns the room the
/// message went to.
///
/// # Errors
///
/// `E_INVALID_REQUEST` for an empty or oversized message, `E_NOT_A_MEMBER`
/// when the sender is not in the room.
pub fn send_message(
    state: &AppState,
    connection_id: Uuid,
    username: &str,
    room_id: Option<&str>,
    content: &str,
) -> Result<String, ChatError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::Empty);
    }
    let max = state.limits.max_chat_length;
    if content.chars().count() > max {
        return Err(ChatError::TooLong(max));
    }

    let room_id = match room_id {
        Some(room_id) => room_id.to_owned(),
        None => state.gateway.room_of(connection_id).ok_or(ChatError::NoRoom)?,
    };
    if !state.gateway.is_member(connection_id, &room_id) {
        return Err(ChatError::NotAMember(room_id));
    }

    let mut data = Data::new();
    data.insert("username".into(), serde_json::json!(username));
    data.insert("content".into(), serde_json::json!(content));
    data.insert("timestamp".into(), serde_json::json!(now_ms()));
    let frame = Frame::request("new_message", data)
        .with_canvas_id(room_id.as_str())
        .with_from(username);
    let delivered = state.gateway.broadcast(&room_id, &frame, None);
    debug!(%room_id, %connection_id, delivered, "chat message broadcast");
    Ok(room_id)
}
