//! Canvas repository — durable storage behind the live canvases.
//!
//! DESIGN
//! ======
//! Live state is authoritative; the repository only loads and saves grid
//! blobs and appends history rows. It is a provider-neutral async trait so
//! the server can run against Postgres (`postgres::PgCanvasRepo`) or fully
//! in memory (`memory::MemoryRepo`, used without `DATABASE_URL` and in
//! tests).

pub mod memory;
pub mod postgres;

use serde::Serialize;

use crate::frame::ErrorCode;
use crate::grid::GridSnapshot;
use crate::ledger::PixelEdit;

// =============================================================================
// TYPES
// =============================================================================

/// Identity and shape of a canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanvasMeta {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Private canvases are fixed-size personal drawings; the rest are
    /// community pubs.
    pub is_private: bool,
}

/// A canvas as it sits in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCanvas {
    pub meta: CanvasMeta,
    pub snapshot: GridSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored canvas {canvas_id} is corrupt: {reason}")]
    Corrupt { canvas_id: String, reason: String },
}

impl ErrorCode for RepoError {
    fn error_code(&self) -> &'static str {
        "E_PERSISTENCE"
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Storage backend for canvases and their edit history.
#[async_trait::async_trait]
pub trait CanvasRepo: Send + Sync {
    /// Load one canvas, or `None` if it does not exist.
    async fn load_canvas(&self, canvas_id: &str) -> Result<Option<StoredCanvas>, RepoError>;

    /// Load the latest edit per cell of one canvas.
    async fn load_history(&self, canvas_id: &str) -> Result<Vec<PixelEdit>, RepoError>;

    /// Insert a new canvas.
    async fn insert_canvas(&self, canvas: &StoredCanvas) -> Result<(), RepoError>;

    /// Overwrite the stored grid blob of an existing canvas.
    async fn save_snapshot(&self, canvas_id: &str, snapshot: &GridSnapshot) -> Result<(), RepoError>;

    /// Append edit records to the audit history.
    async fn append_history(&self, edits: &[PixelEdit]) -> Result<(), RepoError>;

    /// List community (non-private) canvases.
    async fn list_community(&self) -> Result<Vec<CanvasMeta>, RepoError>;
}
