//! Placement coordinator — the single write path into a canvas.
//!
//! DESIGN
//! ======
//! Every operation that changes a canvas or its ledger runs under that
//! canvas's mutex: validate, apply to the grid, record attribution, then
//! broadcast, all before the lock is released. Two placements on the same
//! canvas therefore never interleave, and the order in which the room sees
//! `pixel_placed` frames is the order in which they were committed.
//! Different canvases have different mutexes and never contend.
//!
//! ERROR HANDLING
//! ==============
//! Validation failures return a `PlacementError` to the caller (which turns
//! it into an error reply to the originator) and never reach the room.

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame, now_ms};
use crate::grid::{Applied, Color, GridError, GridSnapshot};
use crate::ledger::{Attribution, PixelEdit};
use crate::services::canvas::{self, CanvasError};
use crate::services::persistence;
use crate::state::{AppState, LiveCanvas};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("connection is not a member of canvas {0}")]
    NotAMember(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl ErrorCode for PlacementError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Canvas(e) => e.error_code(),
            Self::Grid(e) => e.error_code(),
            Self::NotAMember(_) => "E_NOT_A_MEMBER",
            Self::Forbidden(_) => "E_FORBIDDEN",
            Self::InvalidRequest(_) => "E_INVALID_REQUEST",
            Self::InvalidSnapshot(_) => "E_INVALID_SNAPSHOT",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Canvas(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Outcome of a `log_pixel_history` batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub recorded: usize,
    pub rejected: usize,
}

// =============================================================================
// HELPERS
// =============================================================================

/// Lock a canvas the connection is allowed to act on.
///
/// Membership is checked with the canvas lock held, so once a connection is
/// removed from the room no later write of its can commit.
async fn lock_member_canvas(
    state: &AppState,
    connection_id: Uuid,
    canvas_id: &str,
) -> Result<OwnedMutexGuard<LiveCanvas>, PlacementError> {
    let handle = canvas::load_canvas(state, canvas_id).await?;
    let canvas = handle.lock_owned().await;
    if !state.gateway.is_member(connection_id, canvas_id) {
        return Err(PlacementError::NotAMember(canvas_id.to_owned()));
    }
    Ok(canvas)
}

// =============================================================================
// PLACE PIXEL
// =============================================================================

/// Paint one cell and fan the result out to the canvas room.
///
/// A same-color repaint is still recorded and broadcast; the returned
/// `Applied` says whether the grid actually changed.
///
/// # Errors
///
/// `E_INVALID_COLOR`, `E_UNKNOWN_CANVAS`, `E_NOT_A_MEMBER` or
/// `E_OUT_OF_BOUNDS`. On error nothing is recorded or broadcast.
pub async fn place_pixel(
    state: &AppState,
    connection_id: Uuid,
    username: &str,
    canvas_id: &str,
    x: i64,
    y: i64,
    color: &str,
) -> Result<Applied, PlacementError> {
    let color = Color::parse(color)?;
    let mut canvas = lock_member_canvas(state, connection_id, canvas_id).await?;
    let (cx, cy) = canvas.grid.check_bounds(x, y)?;
    let applied = canvas.grid.apply_pixel(x, y, &color)?;

    let attribution = Attribution { username: username.to_owned(), timestamp: now_ms(), color: color.clone() };
    canvas.ledger.record(cx, cy, attribution.clone());
    if applied == Applied::Changed {
        canvas.mark_dirty();
    }
    persistence::enqueue_history(state, PixelEdit { canvas_id: canvas_id.to_owned(), x: cx, y: cy, attribution });

    let mut data = Data::new();
    data.insert("x".into(), serde_json::json!(cx));
    data.insert("y".into(), serde_json::json!(cy));
    data.insert("color".into(), serde_json::json!(color));
    data.insert("username".into(), serde_json::json!(username));
    let frame = Frame::request("pixel_placed", data)
        .with_canvas_id(canvas_id)
        .with_from(username);
    // Still under the canvas lock: room order matches commit order.
    let delivered = state.gateway.broadcast(canvas_id, &frame, None);
    drop(canvas);

    debug!(%canvas_id, %connection_id, x = cx, y = cy, ?applied, delivered, "pixel placed");
    Ok(applied)
}

// =============================================================================
// HISTORY
// =============================================================================

/// Answer a `request_history` for one cell, to the requester only.
///
/// The reply always carries `x` and `y`; `username`, `timestamp` and `color`
/// are present only when the cell has an attribution.
///
/// # Errors
///
/// `E_UNKNOWN_CANVAS`, `E_NOT_A_MEMBER` or `E_OUT_OF_BOUNDS`.
pub async fn query_history(
    state: &AppState,
    connection_id: Uuid,
    canvas_id: &str,
    x: i64,
    y: i64,
    request: &Frame,
) -> Result<bool, PlacementError> {
    let data = {
        let canvas = lock_member_canvas(state, connection_id, canvas_id).await?;
        let (cx, cy) = canvas.grid.check_bounds(x, y)?;
        let mut data = Data::new();
        data.insert("x".into(), serde_json::json!(cx));
        data.insert("y".into(), serde_json::json!(cy));
        if let Some(attribution) = canvas.ledger.lookup(cx, cy) {
            data.insert("username".into(), serde_json::json!(attribution.username));
            data.insert("timestamp".into(), serde_json::json!(attribution.timestamp));
            data.insert("color".into(), serde_json::json!(attribution.color));
        }
        data
    };

    let reply = request
        .respond_as("history_response", data)
        .with_canvas_id(canvas_id);
    Ok(state.gateway.unicast(connection_id, reply))
}

/// Record attribution for a batch of brush-stroke pixels.
///
/// Entries share one timestamp. Out-of-bounds or malformed entries are
/// skipped and counted as rejected. The grid is not touched.
///
/// # Errors
///
/// `E_INVALID_REQUEST` when the batch exceeds the configured maximum, plus
/// `E_UNKNOWN_CANVAS` or `E_NOT_A_MEMBER`.
pub async fn log_history_batch(
    state: &AppState,
    connection_id: Uuid,
    username: &str,
    canvas_id: &str,
    pixels: &[serde_json::Value],
) -> Result<BatchOutcome, PlacementError> {
    let max = state.limits.max_history_batch;
    if pixels.len() > max {
        return Err(PlacementError::InvalidRequest(format!(
            "batch of {} pixels exceeds the limit of {max}",
            pixels.len()
        )));
    }
    let mut canvas = lock_member_canvas(state, connection_id, canvas_id).await?;

    let timestamp = now_ms();
    let mut outcome = BatchOutcome { recorded: 0, rejected: 0 };
    for pixel in pixels {
        let x = pixel.get("x").and_then(serde_json::Value::as_i64);
        let y = pixel.get("y").and_then(serde_json::Value::as_i64);
        let color = pixel
            .get("color")
            .and_then(serde_json::Value::as_str)
            .and_then(|raw| Color::parse(raw).ok());
        let (Some(x), Some(y), Some(color)) = (x, y, color) else {
            outcome.rejected += 1;
            continue;
        };
        let Ok((cx, cy)) = canvas.grid.check_bounds(x, y) else {
            outcome.rejected += 1;
            continue;
        };

        let attribution = Attribution { username: username.to_owned(), timestamp, color };
        canvas.ledger.record(cx, cy, attribution.clone());
        persistence::enqueue_history(state, PixelEdit { canvas_id: canvas_id.to_owned(), x: cx, y: cy, attribution });
        outcome.recorded += 1;
    }
    drop(canvas);

    debug!(%canvas_id, %connection_id, recorded = outcome.recorded, rejected = outcome.rejected, "history batch logged");
    Ok(outcome)
}

// =============================================================================
// SAVE CANVAS STATE
// =============================================================================

/// Replace a private canvas's whole grid and persist it right away.
///
/// The new grid is broadcast to the room as `canvas_replaced`. The ledger
/// is left as is.
///
/// # Errors
///
/// `E_FORBIDDEN` for community canvases, `E_INVALID_SNAPSHOT` for a blob
/// that does not parse or does not match the canvas dimensions, plus
/// `E_UNKNOWN_CANVAS` or `E_NOT_A_MEMBER`.
pub async fn save_canvas_state(
    state: &AppState,
    connection_id: Uuid,
    username: &str,
    canvas_id: &str,
    canvas_data: serde_json::Value,
) -> Result<(), PlacementError> {
    {
        let mut canvas = lock_member_canvas(state, connection_id, canvas_id).await?;
        if !canvas.meta.is_private {
            return Err(PlacementError::Forbidden(format!("canvas {canvas_id} is a community canvas")));
        }
        let snapshot: GridSnapshot =
            serde_json::from_value(canvas_data).map_err(|e| PlacementError::InvalidSnapshot(e.to_string()))?;
        canvas.grid.load_snapshot(snapshot)?;
        canvas.mark_dirty();

        let mut data = Data::new();
        data.insert("canvas_data".into(), serde_json::json!(canvas.grid.export_snapshot()));
        data.insert("username".into(), serde_json::json!(username));
        let frame = Frame::request("canvas_replaced", data)
            .with_canvas_id(canvas_id)
            .with_from(username);
        state.gateway.broadcast(canvas_id, &frame, None);
    }
    info!(%canvas_id, %connection_id, "canvas state replaced");

    let state = state.clone();
    let canvas_id = canvas_id.to_owned();
    tokio::spawn(async move {
        if let Err(e) = persistence::flush_canvas(&state, &canvas_id).await {
            error!(error = %e, %canvas_id, "saved canvas snapshot write failed; will retry on next flush");
        }
    });
    Ok(())
}

#[cfg(test)]
#[path = "placement_test.rs"]
mod tests;
