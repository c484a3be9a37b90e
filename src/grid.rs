use itertools::iproduct;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

mod loader;

pub use loader::GridError;

/// One of the four cardinal directions of travel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    Up,
    Right,
    Down,
    Left,
}

impl Direction {
    /// The (row, column) deltas of one step in this direction.
    /// Row 0 is the top edge of the grid.
    pub fn offset(self) -> (i64, i64) {
        match self {
            Direction::Up => (-1, 0),
            Direction::Right => (0, 1),
            Direction::Down => (1, 0),
            Direction::Left => (0, -1),
        }
    }

    /// The direction of travel that undoes this one.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Right => Direction::Left,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
        }
    }
}

/// A grid coordinate.
///
/// The derived ordering is row-major (row first, then column), which doubles
/// as the canonical lock-acquisition order used to defeat circular waits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellCoord {
    pub row: u32,
    pub col: u32,
}

impl CellCoord {
    /// Creates a new coordinate.
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// The coordinate one step away in `dir`, or `None` if that would
    /// leave the grid through the top or left edge.
    pub fn step(self, dir: Direction) -> Option<CellCoord> {
        let (dr, dc) = dir.offset();
        let row = self.row as i64 + dr;
        let col = self.col as i64 + dc;
        if row < 0 || col < 0 {
            return None;
        }
        Some(CellCoord::new(row as u32, col as u32))
    }

    /// The direction of travel from this cell to an adjacent `other`,
    /// or `None` if the cells are not four-neighbours.
    pub fn direction_to(self, other: CellCoord) -> Option<Direction> {
        let dr = other.row as i64 - self.row as i64;
        let dc = other.col as i64 - self.col as i64;
        match (dr, dc) {
            (-1, 0) => Some(Direction::Up),
            (0, 1) => Some(Direction::Right),
            (1, 0) => Some(Direction::Down),
            (0, -1) => Some(Direction::Left),
            _ => None,
        }
    }

    /// Packs the coordinate into a single word for atomic storage.
    pub(crate) fn pack(self) -> u64 {
        (self.row as u64) << 32 | self.col as u64
    }

    /// Inverse of [CellCoord::pack].
    pub(crate) fn unpack(word: u64) -> CellCoord {
        CellCoord::new((word >> 32) as u32, word as u32)
    }
}

impl fmt::Debug for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// The variant of a junction cell, naming the directions it can be left in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JunctionKind {
    Up,
    Right,
    Down,
    Left,
    UpRight,
    UpLeft,
    RightDown,
    DownLeft,
}

impl JunctionKind {
    /// The directions a vehicle may leave this junction cell in.
    pub fn exits(self) -> &'static [Direction] {
        use Direction::*;
        match self {
            JunctionKind::Up => &[Up],
            JunctionKind::Right => &[Right],
            JunctionKind::Down => &[Down],
            JunctionKind::Left => &[Left],
            JunctionKind::UpRight => &[Up, Right],
            JunctionKind::UpLeft => &[Up, Left],
            JunctionKind::RightDown => &[Right, Down],
            JunctionKind::DownLeft => &[Down, Left],
        }
    }
}

/// The type of a single grid cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CellType {
    /// Unusable terrain; vehicles never occupy it and no lock exists for it.
    Empty,
    /// A one-way road segment flowing in the given direction.
    Road(Direction),
    /// A junction cell, part of an intersection block.
    Junction(JunctionKind),
}

impl CellType {
    /// Decodes the numeric cell code used by the grid file format.
    pub fn from_code(code: u32) -> Option<CellType> {
        use Direction::*;
        Some(match code {
            0 => CellType::Empty,
            1 => CellType::Road(Up),
            2 => CellType::Road(Right),
            3 => CellType::Road(Down),
            4 => CellType::Road(Left),
            5 => CellType::Junction(JunctionKind::Up),
            6 => CellType::Junction(JunctionKind::Right),
            7 => CellType::Junction(JunctionKind::Down),
            8 => CellType::Junction(JunctionKind::Left),
            9 => CellType::Junction(JunctionKind::UpRight),
            10 => CellType::Junction(JunctionKind::UpLeft),
            11 => CellType::Junction(JunctionKind::RightDown),
            12 => CellType::Junction(JunctionKind::DownLeft),
            _ => return None,
        })
    }

    /// The numeric cell code. Inverse of [CellType::from_code].
    pub fn code(self) -> u8 {
        use Direction::*;
        match self {
            CellType::Empty => 0,
            CellType::Road(Up) => 1,
            CellType::Road(Right) => 2,
            CellType::Road(Down) => 3,
            CellType::Road(Left) => 4,
            CellType::Junction(JunctionKind::Up) => 5,
            CellType::Junction(JunctionKind::Right) => 6,
            CellType::Junction(JunctionKind::Down) => 7,
            CellType::Junction(JunctionKind::Left) => 8,
            CellType::Junction(JunctionKind::UpRight) => 9,
            CellType::Junction(JunctionKind::UpLeft) => 10,
            CellType::Junction(JunctionKind::RightDown) => 11,
            CellType::Junction(JunctionKind::DownLeft) => 12,
        }
    }

    /// Whether the cell is part of an intersection block.
    pub fn is_junction(self) -> bool {
        matches!(self, CellType::Junction(_))
    }
}

/// An immutable road network: a matrix of cell types plus the entry and
/// exit coordinates derived from its border.
///
/// The grid never changes during a simulation run; it is shared freely
/// between agent threads without locking.
pub struct Grid {
    rows: u32,
    cols: u32,
    cells: Vec<CellType>,
    entries: Vec<CellCoord>,
    exits: Vec<CellCoord>,
}

impl Grid {
    /// Creates a grid from row-major cell types, deriving its entry and
    /// exit points.
    ///
    /// Entry points are border road cells whose direction points into the
    /// grid; exit points are border road cells pointing out of it.
    ///
    /// # Panics
    /// Panics if `cells.len() != rows * cols`.
    pub fn new(rows: u32, cols: u32, cells: Vec<CellType>) -> Self {
        assert_eq!(
            cells.len(),
            rows as usize * cols as usize,
            "cell count must match grid dimensions"
        );
        let mut grid = Self {
            rows,
            cols,
            cells,
            entries: vec![],
            exits: vec![],
        };
        grid.classify_border();
        grid
    }

    /// Scans the border for entry and exit points.
    fn classify_border(&mut self) {
        use Direction::*;
        let (rows, cols) = (self.rows, self.cols);
        for coord in self.coords() {
            let dir = match self.cell(coord) {
                CellType::Road(dir) => dir,
                _ => continue,
            };
            if coord.row == 0 {
                match dir {
                    Down => self.entries.push(coord),
                    Up => self.exits.push(coord),
                    _ => {}
                }
            }
            if coord.row == rows - 1 {
                match dir {
                    Up => self.entries.push(coord),
                    Down => self.exits.push(coord),
                    _ => {}
                }
            }
            if coord.col == 0 {
                match dir {
                    Right => self.entries.push(coord),
                    Left => self.exits.push(coord),
                    _ => {}
                }
            }
            if coord.col == cols - 1 {
                match dir {
                    Left => self.entries.push(coord),
                    Right => self.exits.push(coord),
                    _ => {}
                }
            }
        }
    }

    /// The number of rows.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// The number of columns.
    pub fn cols(&self) -> u32 {
        self.cols
    }

    /// The type of the cell at `coord`. Out-of-bounds coordinates answer
    /// [CellType::Empty].
    pub fn cell(&self, coord: CellCoord) -> CellType {
        if !self.in_bounds(coord) {
            return CellType::Empty;
        }
        self.cells[coord.row as usize * self.cols as usize + coord.col as usize]
    }

    /// Whether `coord` lies within the grid.
    pub fn in_bounds(&self, coord: CellCoord) -> bool {
        coord.row < self.rows && coord.col < self.cols
    }

    /// The entry points, in row-major order of discovery.
    pub fn entries(&self) -> &[CellCoord] {
        &self.entries
    }

    /// The exit points, in row-major order of discovery.
    pub fn exits(&self) -> &[CellCoord] {
        &self.exits
    }

    /// Whether `coord` is an exit point.
    pub fn is_exit(&self, coord: CellCoord) -> bool {
        self.exits.contains(&coord)
    }

    /// Iterates over every coordinate in row-major order.
    pub fn coords(&self) -> impl Iterator<Item = CellCoord> {
        iproduct!(0..self.rows, 0..self.cols).map(|(row, col)| CellCoord::new(row, col))
    }
}
