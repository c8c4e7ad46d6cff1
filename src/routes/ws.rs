//! WebSocket handler — frame relay between a client and the canvas services.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection ID, registers the connection's outbound
//! channel with the gateway, and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by event name
//! - Room broadcasts and unicasts from the gateway → forward to client
//!
//! Handlers call into the services and return an `Outcome`; the dispatch
//! layer turns it (or a typed error) into the reply for the sender. Room
//! fan-out happens inside the services, under the canvas lock.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `connection_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (reply / nothing)
//! 4. Close → drop channel and room membership, announce `member_left`
//!
//! The loop also ends when the gateway drops the outbound channel (lagging
//! peer eviction or server shutdown) or when any write to the socket fails.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, FRAME_CODE, FRAME_MESSAGE, Frame, Status};
use crate::services;
use crate::state::AppState;

/// Identity used when the upstream auth layer supplies none.
pub const GUEST_USERNAME: &str = "__GUEST__";

// =============================================================================
// TYPES
// =============================================================================

/// Result returned by handler functions.
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Send empty done to sender.
    Done,
    /// No direct reply: the sender hears back through a broadcast or unicast.
    Silent,
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) connection_id: Uuid,
    pub(crate) username: String,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RequestError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("{0} required")]
    Missing(&'static str),
    #[error("join a canvas first")]
    NoCanvas,
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

impl ErrorCode for RequestError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) | Self::Missing(_) => "E_INVALID_REQUEST",
            Self::NoCanvas => "E_NOT_A_MEMBER",
            Self::UnknownEvent(_) => "E_UNKNOWN_EVENT",
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let username = resolve_username(params.get("username").map(String::as_str));
    ws.on_upgrade(move |socket| run_ws(socket, state, username))
}

fn resolve_username(raw: Option<&str>) -> String {
    raw.map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(GUEST_USERNAME)
        .to_owned()
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, username: String) {
    let session = Session { connection_id: Uuid::new_v4(), username };
    let connection_id = session.connection_id;

    // Per-connection channel for room broadcasts and unicast replies.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.client_channel_capacity);
    state.gateway.connect(connection_id, client_tx);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("connection_id", connection_id.to_string())
        .with_data("username", session.username.as_str());
    if send_frame(&mut socket, &welcome).await.is_ok() {
        info!(%connection_id, username = %session.username, "ws: client connected");

        loop {
            tokio::select! {
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break };
                    match msg {
                        Message::Text(text) => {
                            let replies = process_inbound_text(&state, &session, text.as_str()).await;
                            if send_frames(&mut socket, &replies).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                frame = client_rx.recv() => {
                    let Some(frame) = frame else {
                        debug!(%connection_id, "ws: gateway closed outbound channel");
                        break;
                    };
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    services::canvas::disconnect(&state, connection_id, &session.username);
    info!(%connection_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Transport concerns stay in `run_ws`, so tests can drive dispatch with
/// plain channels.
pub(crate) async fn process_inbound_text(state: &AppState, session: &Session, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(connection_id = %session.connection_id, error = %e, "ws: invalid inbound frame");
            return vec![gateway_error(&RequestError::InvalidJson(e.to_string()))];
        }
    };

    // Identity comes from the connection, never from the client.
    req.from = Some(session.username.clone());
    debug!(connection_id = %session.connection_id, id = %req.id, event = %req.event, "ws: recv frame");

    let result = match req.event.as_str() {
        "join_canvas" => handle_join_canvas(state, session, &req).await,
        "join_pub" => handle_join_pub(state, session, &req).await,
        "leave_canvas" => Ok(handle_leave_canvas(state, session)),
        "place_pixel" => handle_place_pixel(state, session, &req).await,
        "request_history" => handle_request_history(state, session, &req).await,
        "log_pixel_history" => handle_log_pixel_history(state, session, &req).await,
        "save_canvas_state" => handle_save_canvas_state(state, session, &req).await,
        "send_message" => handle_send_message(state, session, &req),
        other => Err(req.error_from(&RequestError::UnknownEvent(other.to_owned()))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

/// Error frame for input that never became a request.
fn gateway_error(err: &RequestError) -> Frame {
    let mut frame = Frame::request("gateway:error", Data::new())
        .with_data(FRAME_CODE, err.error_code())
        .with_data(FRAME_MESSAGE, err.to_string());
    frame.status = Status::Error;
    frame
}

// =============================================================================
// FIELD HELPERS
// =============================================================================

/// Canvas named by the request, falling back to the connection's room.
fn resolve_canvas(state: &AppState, session: &Session, req: &Frame, key: &str) -> Result<String, Frame> {
    req.target_canvas(key)
        .or_else(|| state.gateway.room_of(session.connection_id))
        .ok_or_else(|| req.error_from(&RequestError::NoCanvas))
}

fn required_i64(req: &Frame, key: &'static str) -> Result<i64, Frame> {
    req.i64_field(key)
        .ok_or_else(|| req.error_from(&RequestError::Missing(key)))
}

fn required_str<'a>(req: &'a Frame, key: &'static str) -> Result<&'a str, Frame> {
    req.str_field(key)
        .ok_or_else(|| req.error_from(&RequestError::Missing(key)))
}

fn meta_to_data(meta: &crate::repo::CanvasMeta) -> Data {
    let mut data = Data::new();
    data.insert("canvas_id".into(), serde_json::json!(meta.id));
    data.insert("name".into(), serde_json::json!(meta.name));
    data.insert("width".into(), serde_json::json!(meta.width));
    data.insert("height".into(), serde_json::json!(meta.height));
    data.insert("is_private".into(), serde_json::json!(meta.is_private));
    data
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_join_canvas(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let Some(canvas_id) = req.target_canvas("canvas_id") else {
        return Err(req.error_from(&RequestError::Missing("canvas_id")));
    };
    match services::canvas::join_canvas(state, session.connection_id, &session.username, &canvas_id).await {
        Ok(meta) => Ok(Outcome::Reply(meta_to_data(&meta))),
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_join_pub(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let Some(pub_id) = req.target_canvas("pub_id") else {
        return Err(req.error_from(&RequestError::Missing("pub_id")));
    };
    match services::canvas::join_pub(state, session.connection_id, &session.username, &pub_id).await {
        Ok(meta) => Ok(Outcome::Reply(meta_to_data(&meta))),
        Err(e) => Err(req.error_from(&e)),
    }
}

fn handle_leave_canvas(state: &AppState, session: &Session) -> Outcome {
    let left = services::canvas::leave_canvas(state, session.connection_id, &session.username);
    let mut data = Data::new();
    data.insert("canvas_id".into(), serde_json::json!(left));
    Outcome::Reply(data)
}

// =============================================================================
// CANVAS HANDLERS
// =============================================================================

async fn handle_place_pixel(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let canvas_id = resolve_canvas(state, session, req, "canvas_id")?;
    let x = required_i64(req, "x")?;
    let y = required_i64(req, "y")?;
    let color = required_str(req, "color")?;

    // Success is observed through the `pixel_placed` broadcast.
    match services::placement::place_pixel(state, session.connection_id, &session.username, &canvas_id, x, y, color)
        .await
    {
        Ok(_) => Ok(Outcome::Silent),
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_request_history(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let canvas_id = resolve_canvas(state, session, req, "canvas_id")?;
    let x = required_i64(req, "x")?;
    let y = required_i64(req, "y")?;

    match services::placement::query_history(state, session.connection_id, &canvas_id, x, y, req).await {
        Ok(delivered) => {
            if !delivered {
                warn!(connection_id = %session.connection_id, %canvas_id, "ws: history response dropped");
            }
            Ok(Outcome::Silent)
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_log_pixel_history(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let canvas_id = resolve_canvas(state, session, req, "canvas_id")?;
    let Some(pixels) = req.data.get("pixels").and_then(serde_json::Value::as_array) else {
        return Err(req.error_from(&RequestError::Missing("pixels")));
    };

    match services::placement::log_history_batch(state, session.connection_id, &session.username, &canvas_id, pixels)
        .await
    {
        Ok(outcome) => {
            let mut data = Data::new();
            data.insert("recorded".into(), serde_json::json!(outcome.recorded));
            data.insert("rejected".into(), serde_json::json!(outcome.rejected));
            Ok(Outcome::Reply(data))
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

async fn handle_save_canvas_state(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let canvas_id = resolve_canvas(state, session, req, "canvas_id")?;
    let Some(canvas_data) = req.data.get("canvas_data").cloned() else {
        return Err(req.error_from(&RequestError::Missing("canvas_data")));
    };

    match services::placement::save_canvas_state(state, session.connection_id, &session.username, &canvas_id, canvas_data)
        .await
    {
        Ok(()) => Ok(Outcome::Done),
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// CHAT HANDLER
// =============================================================================

fn handle_send_message(state: &AppState, session: &Session, req: &Frame) -> Result<Outcome, Frame> {
    let content = required_str(req, "content")?;
    let room_id = req.target_canvas("pub_id");

    match services::chat::send_message(state, session.connection_id, &session.username, room_id.as_deref(), content) {
        Ok(_) => Ok(Outcome::Done),
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Write replies in order, stopping at the first failed write.
async fn send_frames<S>(socket: &mut S, frames: &[Frame]) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    for frame in frames {
        send_frame(socket, frame).await?;
    }
    Ok(())
}

async fn send_frame<S>(socket: &mut S, frame: &Frame) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.str_field(FRAME_CODE).unwrap_or("-");
        let message = frame.str_field(FRAME_MESSAGE).unwrap_or("-");
        warn!(id = %frame.id, event = %frame.event, code, message, "ws: send frame status=Error");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
