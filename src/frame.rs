//! Frame — the universal message type on the pixel websocket.
//!
//! ARCHITECTURE
//! ============
//! Every realtime exchange is a Frame. Clients send request frames named by
//! `event` (`place_pixel`, `join_canvas`, ...), the dispatch table in
//! `routes::ws` routes them to a service, and the server answers with
//! `done`/`error` replies or pushes `request` frames to rooms.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`.
//! - Replies correlate to requests via `parent_id`.
//! - `id`, `ts` and `status` default on inbound frames so browser clients can
//!   send `{"event": "...", "data": {...}}` without bookkeeping.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Frame data key for the retryable flag on error frames.
pub const FRAME_RETRYABLE: &str = "retryable";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// Lifecycle position of a frame.
///
/// Client requests and server pushes are `request`; replies are `done` or
/// `error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Request,
    Done,
    Error,
}

/// The universal message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    #[serde(default = "now_ms")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    pub event: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame. Used for client requests and server pushes.
    pub fn request(event: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            canvas_id: None,
            from: None,
            event: event.into(),
            status: Status::Request,
            data,
        }
    }

    /// Create a done reply carrying `data`. Terminal.
    #[must_use]
    pub fn done_with(&self, data: Data) -> Self {
        self.reply(self.event.clone(), Status::Done, data)
    }

    /// Create an empty done reply. Terminal.
    #[must_use]
    pub fn done(&self) -> Self {
        self.done_with(Data::new())
    }

    /// Create a done reply under a different event name, e.g. the
    /// `history_response` answering a `request_history`.
    #[must_use]
    pub fn respond_as(&self, event: impl Into<String>, data: Data) -> Self {
        self.reply(event.into(), Status::Done, data)
    }

    /// Create a structured error response from a typed error. Terminal.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FRAME_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FRAME_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FRAME_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.reply(self.event.clone(), Status::Error, data)
    }

    /// Build a reply frame. Inherits `parent_id` and `canvas_id`.
    fn reply(&self, event: String, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            canvas_id: self.canvas_id.clone(),
            from: None,
            event,
            status,
            data,
        }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_canvas_id(mut self, canvas_id: impl Into<String>) -> Self {
        self.canvas_id = Some(canvas_id.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// FIELD ACCESS
// =============================================================================

impl Frame {
    /// Read a string field from `data`.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }

    /// Read an integer field from `data`.
    #[must_use]
    pub fn i64_field(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(serde_json::Value::as_i64)
    }

    /// Canvas targeted by this frame: `data[key]` first, then the envelope.
    #[must_use]
    pub fn target_canvas(&self, key: &str) -> Option<String> {
        self.str_field(key)
            .map(str::to_owned)
            .or_else(|| self.canvas_id.clone())
            .filter(|id| !id.trim().is_empty())
    }
}

// =============================================================================
// TESTS
// =============================================================================
