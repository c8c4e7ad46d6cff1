//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the canvas repository, the map of live canvases, and the broadcast
//! gateway. Each live canvas sits behind its own `tokio::sync::Mutex`: that
//! mutex is the per-canvas sequencing point for placements, so edits to one
//! canvas are strictly ordered while different canvases never contend. The
//! outer map lock is only held long enough to clone a handle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};

use crate::config::CanvasLimits;
use crate::gateway::Gateway;
use crate::grid::{Grid, GridError};
use crate::ledger::{Ledger, PixelEdit};
use crate::repo::{CanvasMeta, CanvasRepo, StoredCanvas};

// =============================================================================
// LIVE CANVAS
// =============================================================================

/// One canvas held in memory: the canonical grid plus its ledger.
/// Flushed to the repository by the persistence task.
#[derive(Debug)]
pub struct LiveCanvas {
    pub meta: CanvasMeta,
    pub grid: Grid,
    pub ledger: Ledger,
    /// Grid changed since the last successful snapshot save.
    pub dirty: bool,
    /// Bumped on every grid change; lets a flush tell whether it is stale.
    pub revision: u64,
    /// Held across a whole snapshot write so flushes of one canvas never
    /// overlap.
    pub flush_guard: Arc<Mutex<()>>,
}

impl LiveCanvas {
    /// Build a live canvas from storage.
    ///
    /// # Errors
    ///
    /// Returns a `GridError` if the stored blob does not match the stored
    /// dimensions.
    pub fn hydrate(stored: StoredCanvas, history: Vec<PixelEdit>) -> Result<Self, GridError> {
        let grid = Grid::from_snapshot(stored.meta.width, stored.meta.height, stored.snapshot)?;
        Ok(Self::new(stored.meta, grid, Ledger::from_edits(history)))
    }

    /// A clean live canvas over an already-built grid and ledger.
    #[must_use]
    pub fn new(meta: CanvasMeta, grid: Grid, ledger: Ledger) -> Self {
        Self { meta, grid, ledger, dirty: false, revision: 0, flush_guard: Arc::new(Mutex::new(())) }
    }

    /// Record a grid change for the persistence task.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }
}

pub type CanvasHandle = Arc<Mutex<LiveCanvas>>;

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn CanvasRepo>,
    pub canvases: Arc<RwLock<HashMap<String, CanvasHandle>>>,
    pub gateway: Gateway,
    /// Queue feeding the history persistence worker. `None` disables
    /// history persistence.
    pub history_tx: Option<mpsc::Sender<PixelEdit>>,
    pub limits: CanvasLimits,
    /// Outbound frame buffer per websocket connection.
    pub client_channel_capacity: usize,
}

impl AppState {
    #[must_use]
    pub fn new(repo: Arc<dyn CanvasRepo>, limits: CanvasLimits, client_channel_capacity: usize) -> Self {
        Self {
            repo,
            canvases: Arc::new(RwLock::new(HashMap::new())),
            gateway: Gateway::new(),
            history_tx: None,
            limits,
            client_channel_capacity,
        }
    }

    /// Handle for a canvas already held in memory.
    pub async fn live_canvas(&self, canvas_id: &str) -> Option<CanvasHandle> {
        self.canvases.read().await.get(canvas_id).cloned()
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
#[path = "state_helpers_test.rs"]
pub mod test_helpers;
