//! Grid model: cell coordinates and the source-to-cell mapping
//!
//! Pure bookkeeping, no I/O. The session manager guards one `GridMap`
//! with a mutex held only for map mutation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::source::{RoomId, SourceId};

/// One cell of the wall, row-major from the top-left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    pub row: u32,
    pub col: u32,
}

impl GridCell {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl std::fmt::Display for GridCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Errors from session manager operations
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("cell {cell} is outside the {rows}x{cols} grid")]
    OutOfBounds { cell: GridCell, rows: u32, cols: u32 },

    #[error("cell {0} is already occupied")]
    OccupiedCell(GridCell),

    #[error("room {0} is already on the wall")]
    DuplicateRoom(RoomId),

    #[error("no free cell left on the grid")]
    GridFull,

    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    #[error("no backend registered as {0:?}")]
    UnknownBackend(String),

    #[error("grid must be at least 1x1")]
    EmptyGrid,
}

/// The wall layout: dimensions plus the cell occupancy map
///
/// Invariant: every mapped cell is in bounds and every source occupies at
/// most one cell.
#[derive(Debug)]
pub struct GridMap {
    rows: u32,
    cols: u32,
    cells: HashMap<GridCell, SourceId>,
}

impl GridMap {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
            cells: HashMap::new(),
        }
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn in_bounds(&self, cell: GridCell) -> bool {
        cell.row < self.rows && cell.col < self.cols
    }

    /// Place a source in a specific cell
    pub fn assign(&mut self, cell: GridCell, id: SourceId) -> Result<(), SessionError> {
        if !self.in_bounds(cell) {
            return Err(SessionError::OutOfBounds {
                cell,
                rows: self.rows,
                cols: self.cols,
            });
        }
        if self.cells.contains_key(&cell) {
            return Err(SessionError::OccupiedCell(cell));
        }
        self.cells.insert(cell, id);
        Ok(())
    }

    /// First unoccupied cell in row-major order
    pub fn first_free(&self) -> Option<GridCell> {
        for row in 0..self.rows {
            for col in 0..self.cols {
                let cell = GridCell::new(row, col);
                if !self.cells.contains_key(&cell) {
                    return Some(cell);
                }
            }
        }
        None
    }

    pub fn cell_of(&self, id: SourceId) -> Option<GridCell> {
        self.cells
            .iter()
            .find(|&(_, &v)| v == id)
            .map(|(&cell, _)| cell)
    }

    /// Remove a source's cell assignment
    pub fn unassign(&mut self, id: SourceId) -> Option<GridCell> {
        let cell = self.cell_of(id)?;
        self.cells.remove(&cell);
        Some(cell)
    }

    /// Move a source to a different (free, in-bounds) cell
    pub fn move_to(&mut self, id: SourceId, cell: GridCell) -> Result<(), SessionError> {
        let from = self.cell_of(id).ok_or(SessionError::UnknownSource(id))?;
        if cell == from {
            return Ok(());
        }
        if !self.in_bounds(cell) {
            return Err(SessionError::OutOfBounds {
                cell,
                rows: self.rows,
                cols: self.cols,
            });
        }
        if self.cells.contains_key(&cell) {
            return Err(SessionError::OccupiedCell(cell));
        }
        self.cells.remove(&from);
        self.cells.insert(cell, id);
        Ok(())
    }

    /// Change the grid dimensions; returns the sources whose cell fell
    /// outside the new bounds, in row-major order of their old cell
    pub fn resize(&mut self, rows: u32, cols: u32) -> Result<Vec<SourceId>, SessionError> {
        if rows == 0 || cols == 0 {
            return Err(SessionError::EmptyGrid);
        }
        self.rows = rows;
        self.cols = cols;

        let mut evicted: Vec<(GridCell, SourceId)> = self
            .cells
            .iter()
            .filter(|(cell, _)| !self.in_bounds(**cell))
            .map(|(&cell, &id)| (cell, id))
            .collect();
        evicted.sort_by_key(|(cell, _)| *cell);
        for (cell, _) in &evicted {
            self.cells.remove(cell);
        }
        Ok(evicted.into_iter().map(|(_, id)| id).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (GridCell, SourceId)> + '_ {
        self.cells.iter().map(|(&cell, &id)| (cell, id))
    }
}
