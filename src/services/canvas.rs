//! Canvas service — catalog, hydration, and room join/leave.
//!
//! DESIGN
//! ======
//! Canvases are created explicitly (REST) or seeded at startup, never
//! auto-created by a join. A canvas is hydrated from the repository on
//! first use and then stays in memory; the in-memory copy is authoritative
//! and the persistence task writes it back.
//!
//! Room membership lives in the gateway. Joining moves a connection out of
//! its previous room atomically and announces the move to both rooms.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame};
use crate::grid::{Grid, GridError, GridSnapshot};
use crate::ledger::Ledger;
use crate::repo::{CanvasMeta, RepoError, StoredCanvas};
use crate::state::{AppState, CanvasHandle, LiveCanvas};

/// Community pubs created on first start: `(id, name, width, height)`.
pub const COMMUNITY_PUBS: [(&str, &str, u32, u32); 4] = [
    ("guest-pub", "The Guest Pub", 128, 128),
    ("8-bit-bar", "The 8-Bit Bar", 48, 48),
    ("doodle-den", "The Doodle Den", 64, 32),
    ("canvas-corner", "The Canvas Corner", 128, 128),
];

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("unknown canvas: {0}")]
    UnknownCanvas(String),
    #[error("canvas {0} is not a community pub")]
    NotAPub(String),
    #[error("invalid canvas: {0}")]
    Invalid(String),
    #[error("connection is closed")]
    Closed,
    #[error("stored canvas does not match its dimensions: {0}")]
    Grid(#[from] GridError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl ErrorCode for CanvasError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownCanvas(_) => "E_UNKNOWN_CANVAS",
            Self::NotAPub(_) => "E_NOT_A_PUB",
            Self::Invalid(_) => "E_INVALID_REQUEST",
            Self::Closed => "E_NOT_A_MEMBER",
            Self::Grid(_) => "E_PERSISTENCE",
            Self::Repo(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Repo(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Full canvas state for page-load bootstrap.
#[derive(Debug, Clone, Serialize)]
pub struct CanvasView {
    #[serde(flatten)]
    pub meta: CanvasMeta,
    pub canvas_data: GridSnapshot,
}

// =============================================================================
// CATALOG
// =============================================================================

/// Return the live handle for `canvas_id`, hydrating it from the repository
/// if it is not in memory yet.
///
/// # Errors
///
/// Returns `UnknownCanvas` if the repository has no such canvas, or a
/// repository/grid error if hydration fails.
pub async fn load_canvas(state: &AppState, canvas_id: &str) -> Result<CanvasHandle, CanvasError> {
    if let Some(handle) = state.live_canvas(canvas_id).await {
        return Ok(handle);
    }

    // Fetch outside the map lock; a concurrent hydration may win the insert.
    let stored = state
        .repo
        .load_canvas(canvas_id)
        .await?
        .ok_or_else(|| CanvasError::UnknownCanvas(canvas_id.to_owned()))?;
    let history = state.repo.load_history(canvas_id).await?;
    let live = LiveCanvas::hydrate(stored, history)?;
    let attributed = live.ledger.len();

    let mut canvases = state.canvases.write().await;
    let handle = canvases
        .entry(canvas_id.to_owned())
        .or_insert_with(|| {
            info!(%canvas_id, width = live.grid.width(), height = live.grid.height(), attributed, "hydrated canvas from repository");
            Arc::new(Mutex::new(live))
        })
        .clone();
    Ok(handle)
}

/// Create a new all-white canvas.
///
/// Private canvases always use the configured fixed size; community canvases
/// need explicit dimensions within `1..=max_canvas_dim`.
///
/// # Errors
///
/// Returns `Invalid` for a bad name or dimensions, or a repository error.
pub async fn create_canvas(
    state: &AppState,
    name: &str,
    is_private: bool,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<CanvasMeta, CanvasError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CanvasError::Invalid("name required".into()));
    }

    let (width, height) = if is_private {
        let side = state.limits.private_canvas_size;
        (side, side)
    } else {
        let (Some(width), Some(height)) = (width, height) else {
            return Err(CanvasError::Invalid("width and height required for a community canvas".into()));
        };
        let max = state.limits.max_canvas_dim;
        if !(1..=max).contains(&width) || !(1..=max).contains(&height) {
            return Err(CanvasError::Invalid(format!("dimensions must be within 1..={max}")));
        }
        (width, height)
    };

    let meta = CanvasMeta { id: Uuid::new_v4().to_string(), name: name.to_owned(), width, height, is_private };
    insert_canvas(state, meta.clone()).await?;
    info!(canvas_id = %meta.id, width, height, is_private, "created canvas");
    Ok(meta)
}

async fn insert_canvas(state: &AppState, meta: CanvasMeta) -> Result<(), CanvasError> {
    let grid = Grid::new(meta.width, meta.height)?;
    state
        .repo
        .insert_canvas(&StoredCanvas { meta: meta.clone(), snapshot: grid.export_snapshot() })
        .await?;

    let live = LiveCanvas::new(meta, grid, Ledger::new());
    let id = live.meta.id.clone();
    state
        .canvases
        .write()
        .await
        .insert(id, Arc::new(Mutex::new(live)));
    Ok(())
}

/// Create any missing community pub. Returns how many were created.
///
/// # Errors
///
/// Returns a repository error if a lookup or insert fails.
pub async fn seed_community_pubs(state: &AppState) -> Result<usize, CanvasError> {
    let mut created = 0;
    for (id, name, width, height) in COMMUNITY_PUBS {
        if state.repo.load_canvas(id).await?.is_some() {
            continue;
        }
        info!(canvas_id = id, name, "creating community pub");
        let meta = CanvasMeta { id: id.to_owned(), name: name.to_owned(), width, height, is_private: false };
        insert_canvas(state, meta).await?;
        created += 1;
    }
    Ok(created)
}

/// List community pubs.
///
/// # Errors
///
/// Returns a repository error if the listing fails.
pub async fn list_pubs(state: &AppState) -> Result<Vec<CanvasMeta>, CanvasError> {
    Ok(state.repo.list_community().await?)
}

/// Current full state of a canvas.
///
/// # Errors
///
/// Same as [`load_canvas`].
pub async fn canvas_view(state: &AppState, canvas_id: &str) -> Result<CanvasView, CanvasError> {
    let handle = load_canvas(state, canvas_id).await?;
    let canvas = handle.lock().await;
    Ok(CanvasView { meta: canvas.meta.clone(), canvas_data: canvas.grid.export_snapshot() })
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Put a connection in a canvas room. Any previous room is left first.
///
/// # Errors
///
/// Returns `UnknownCanvas` (membership unchanged) if the canvas does not
/// exist.
pub async fn join_canvas(
    state: &AppState,
    connection_id: Uuid,
    username: &str,
    canvas_id: &str,
) -> Result<CanvasMeta, CanvasError> {
    let handle = load_canvas(state, canvas_id).await?;
    let meta = handle.lock().await.meta.clone();
    enter_room(state, connection_id, username, canvas_id)?;
    Ok(meta)
}

/// Join the room of a community pub.
///
/// # Errors
///
/// Returns `NotAPub` for private canvases, otherwise as [`join_canvas`].
pub async fn join_pub(
    state: &AppState,
    connection_id: Uuid,
    username: &str,
    pub_id: &str,
) -> Result<CanvasMeta, CanvasError> {
    let handle = load_canvas(state, pub_id).await?;
    let meta = handle.lock().await.meta.clone();
    if meta.is_private {
        return Err(CanvasError::NotAPub(pub_id.to_owned()));
    }
    enter_room(state, connection_id, username, pub_id)?;
    Ok(meta)
}

fn enter_room(state: &AppState, connection_id: Uuid, username: &str, room_id: &str) -> Result<(), CanvasError> {
    let previous = state.gateway.join_room(connection_id, room_id);
    if !state.gateway.is_member(connection_id, room_id) {
        return Err(CanvasError::Closed);
    }
    if let Some(previous) = previous {
        announce(state, "member_left", &previous, connection_id, username);
    }
    announce(state, "member_joined", room_id, connection_id, username);
    info!(%connection_id, canvas_id = %room_id, members = state.gateway.member_count(room_id), "joined canvas room");
    Ok(())
}

/// Leave the connection's current room, if any. Returns the room left.
pub fn leave_canvas(state: &AppState, connection_id: Uuid, username: &str) -> Option<String> {
    let room_id = state.gateway.room_of(connection_id)?;
    if !state.gateway.leave_room(connection_id, &room_id) {
        return None;
    }
    announce(state, "member_left", &room_id, connection_id, username);
    info!(%connection_id, canvas_id = %room_id, "left canvas room");
    Some(room_id)
}

/// Tear down a connection: drop its channel and membership together.
pub fn disconnect(state: &AppState, connection_id: Uuid, username: &str) {
    if let Some(room_id) = state.gateway.disconnect(connection_id) {
        announce(state, "member_left", &room_id, connection_id, username);
    }
}

fn announce(state: &AppState, event: &str, room_id: &str, connection_id: Uuid, username: &str) {
    let mut data = Data::new();
    data.insert("connection_id".into(), serde_json::json!(connection_id));
    data.insert("username".into(), serde_json::json!(username));
    let frame = Frame::request(event, data).with_canvas_id(room_id);
    state.gateway.broadcast(room_id, &frame, Some(connection_id));
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
