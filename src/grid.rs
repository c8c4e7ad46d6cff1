//! Grid — one canvas's pixel matrix.
//!
//! DESIGN
//! ======
//! Cells are stored row-major (`y * width + x`) as normalized `#RRGGBB`
//! colors. Dimensions are fixed at construction. Every mutation is an
//! idempotent replacement, so replaying an edit is harmless.
//!
//! The snapshot blob is the JSON-friendly `grid[y][x]` layout used both on
//! the wire (`canvas_data`) and in the `canvases.canvas_data` column.

use serde::{Deserialize, Serialize};

use crate::frame::ErrorCode;

/// Color of a never-painted cell.
pub const DEFAULT_COLOR: &str = "#FFFFFF";

// =============================================================================
// COLOR
// =============================================================================

/// A validated, upper-case `#RRGGBB` color.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl Color {
    /// Parse `#RGB` or `#RRGGBB` (any case) into the canonical form.
    ///
    /// # Errors
    ///
    /// Returns `GridError::InvalidColor` for anything else.
    pub fn parse(raw: &str) -> Result<Self, GridError> {
        let invalid = || GridError::InvalidColor(raw.to_owned());
        let hex = raw.trim().strip_prefix('#').ok_or_else(invalid)?;
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let expanded = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect::<String>(),
            6 => hex.to_owned(),
            _ => return Err(invalid()),
        };
        Ok(Self(format!("#{}", expanded.to_ascii_uppercase())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Color {
    fn default() -> Self {
        Self(DEFAULT_COLOR.to_owned())
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Color {
    type Error = GridError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.0
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("pixel ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds { x: i64, y: i64, width: u32, height: u32 },
    #[error("invalid color: {0:?}")]
    InvalidColor(String),
    #[error("snapshot is {got_width}x{got_height}, canvas is {width}x{height}")]
    DimensionMismatch { width: u32, height: u32, got_width: usize, got_height: usize },
    #[error("canvas dimensions must be at least 1x1, got {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },
}

impl ErrorCode for GridError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::OutOfBounds { .. } => "E_OUT_OF_BOUNDS",
            Self::InvalidColor(_) => "E_INVALID_COLOR",
            Self::DimensionMismatch { .. } | Self::EmptyDimensions { .. } => "E_INVALID_SNAPSHOT",
        }
    }
}

// =============================================================================
// GRID
// =============================================================================

/// Result of a successful `apply_pixel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The cell now holds a different color.
    Changed,
    /// The cell already held the requested color.
    Unchanged,
}

/// Snapshot blob: rows of colors, indexed `[y][x]`.
pub type GridSnapshot = Vec<Vec<Color>>;

/// A fixed-size pixel matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    width: u32,
    height: u32,
    cells: Vec<Color>,
}

impl Grid {
    /// Build an all-white grid.
    ///
    /// # Errors
    ///
    /// Returns `EmptyDimensions` when either side is zero.
    pub fn new(width: u32, height: u32) -> Result<Self, GridError> {
        if width == 0 || height == 0 {
            return Err(GridError::EmptyDimensions { width, height });
        }
        let len = width as usize * height as usize;
        Ok(Self { width, height, cells: vec![Color::default(); len] })
    }

    /// Build a grid from a snapshot blob.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if the blob is not exactly `width`x`height`.
    pub fn from_snapshot(width: u32, height: u32, snapshot: GridSnapshot) -> Result<Self, GridError> {
        let mut grid = Self::new(width, height)?;
        grid.load_snapshot(snapshot)?;
        Ok(grid)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Map signed coordinates to a cell index, or `None` when out of range.
    fn index(&self, x: i64, y: i64) -> Option<usize> {
        let x = u32::try_from(x).ok().filter(|x| *x < self.width)?;
        let y = u32::try_from(y).ok().filter(|y| *y < self.height)?;
        Some(y as usize * self.width as usize + x as usize)
    }

    /// Check coordinates against the canvas dimensions.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` unless `0 <= x < width` and `0 <= y < height`.
    pub fn check_bounds(&self, x: i64, y: i64) -> Result<(u32, u32), GridError> {
        if self.index(x, y).is_none() {
            return Err(GridError::OutOfBounds { x, y, width: self.width, height: self.height });
        }
        // Both casts are in range after the index check.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cell = (x as u32, y as u32);
        Ok(cell)
    }

    /// Color at `(x, y)`, or `None` when out of bounds.
    #[must_use]
    pub fn get(&self, x: i64, y: i64) -> Option<&Color> {
        self.index(x, y).map(|i| &self.cells[i])
    }

    /// Replace the color at `(x, y)`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfBounds` without touching the grid when the coordinates
    /// fall outside the canvas.
    pub fn apply_pixel(&mut self, x: i64, y: i64, color: &Color) -> Result<Applied, GridError> {
        let Some(i) = self.index(x, y) else {
            return Err(GridError::OutOfBounds { x, y, width: self.width, height: self.height });
        };
        if self.cells[i] == *color {
            return Ok(Applied::Unchanged);
        }
        self.cells[i] = color.clone();
        Ok(Applied::Changed)
    }

    /// Replace every cell from a snapshot blob.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if the blob shape differs; the grid is
    /// left untouched in that case.
    pub fn load_snapshot(&mut self, snapshot: GridSnapshot) -> Result<(), GridError> {
        let mismatch = |got_width: usize| GridError::DimensionMismatch {
            width: self.width,
            height: self.height,
            got_width,
            got_height: snapshot.len(),
        };
        if snapshot.len() != self.height as usize {
            return Err(mismatch(snapshot.first().map_or(0, Vec::len)));
        }
        if let Some(row) = snapshot.iter().find(|row| row.len() != self.width as usize) {
            return Err(mismatch(row.len()));
        }
        self.cells = snapshot.into_iter().flatten().collect();
        Ok(())
    }

    /// Export every cell as a snapshot blob.
    #[must_use]
    pub fn export_snapshot(&self) -> GridSnapshot {
        self.cells
            .chunks(self.width as usize)
            .map(<[Color]>::to_vec)
            .collect()
    }
}

#[cfg(test)]
#[path = "grid_test.rs"]
mod tests;
