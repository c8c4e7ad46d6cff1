//! History ledger — last editor per cell.
//!
//! DESIGN
//! ======
//! The ledger keeps exactly one attribution per `(x, y)`: recording a cell
//! overwrites whatever was there. Full audit history lives in the
//! `pixel_history` table; this is the hot lookup structure answering
//! `request_history`. A ledger is owned by its canvas and mutated under the
//! same lock as the grid.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::grid::Color;

/// Who last painted a cell, when, and with what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub username: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
    pub color: Color,
}

/// One persisted history row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelEdit {
    pub canvas_id: String,
    pub x: u32,
    pub y: u32,
    pub attribution: Attribution,
}

#[derive(Debug, Default)]
pub struct Ledger {
    cells: HashMap<(u32, u32), Attribution>,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted edits. Later timestamps win; on a tie the later
    /// edit in iteration order wins.
    pub fn from_edits(edits: impl IntoIterator<Item = PixelEdit>) -> Self {
        let mut ledger = Self::new();
        for edit in edits {
            let newer = ledger
                .cells
                .get(&(edit.x, edit.y))
                .is_none_or(|current| current.timestamp <= edit.attribution.timestamp);
            if newer {
                ledger.record(edit.x, edit.y, edit.attribution);
            }
        }
        ledger
    }

    /// Overwrite the attribution for `(x, y)`.
    pub fn record(&mut self, x: u32, y: u32, attribution: Attribution) {
        self.cells.insert((x, y), attribution);
    }

    /// Attribution for `(x, y)`, or `None` if the cell was never recorded.
    #[must_use]
    pub fn lookup(&self, x: u32, y: u32) -> Option<&Attribution> {
        self.cells.get(&(x, y))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
