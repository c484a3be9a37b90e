//! Loads a grid from its line-oriented text format.
//!
//! Line 1 holds the row count, line 2 the column count, followed by that
//! many rows of whitespace-separated cell codes (0-12). Any malformed
//! input fails the whole load; no partial grid is ever produced.

use log::info;
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::{CellType, Grid};

/// A grid file could not be loaded.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("failed to read grid file: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing or invalid {0}")]
    Dimension(&'static str),

    #[error("expected {expected} rows, found only {found}")]
    MissingRows { expected: usize, found: usize },

    #[error("row {row} has {found} cells, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("unrecognised cell code {code:?} at row {row}, column {col}")]
    BadCell {
        row: usize,
        col: usize,
        code: String,
    },
}

impl Grid {
    /// Loads a grid from the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Grid, GridError> {
        Grid::parse(&fs::read_to_string(path)?)
    }

    /// Parses a grid from its text representation.
    pub fn parse(text: &str) -> Result<Grid, GridError> {
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        let rows = parse_dimension(lines.next(), "row count")?;
        let cols = parse_dimension(lines.next(), "column count")?;

        let mut cells = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            let line = lines.next().ok_or(GridError::MissingRows {
                expected: rows,
                found: row,
            })?;
            let codes: Vec<&str> = line.split_whitespace().collect();
            if codes.len() != cols {
                return Err(GridError::RowWidth {
                    row,
                    expected: cols,
                    found: codes.len(),
                });
            }
            for (col, code) in codes.iter().enumerate() {
                let ty = code
                    .parse::<u32>()
                    .ok()
                    .and_then(CellType::from_code)
                    .ok_or_else(|| GridError::BadCell {
                        row,
                        col,
                        code: code.to_string(),
                    })?;
                cells.push(ty);
            }
        }

        let grid = Grid::new(rows as u32, cols as u32, cells);
        info!(
            "loaded {}x{} grid with {} entries and {} exits",
            grid.rows(),
            grid.cols(),
            grid.entries().len(),
            grid.exits().len(),
        );
        Ok(grid)
    }
}

/// Parses one of the two leading dimension lines.
fn parse_dimension(line: Option<&str>, what: &'static str) -> Result<usize, GridError> {
    line.and_then(|line| line.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .ok_or(GridError::Dimension(what))
}
