//! Plans routes through intersection blocks.
//!
//! Routing is deliberately dumb: every legal, in-bounds, loop-free way
//! out of the junction is enumerated and one is chosen uniformly at
//! random. There is no shortest-path or priority logic.

use arrayvec::ArrayVec;
use rand::Rng;
use smallvec::SmallVec;

use crate::{CellCoord, CellType, Direction, Grid, JunctionKind};

/// The cells of one intersection crossing, in traversal order, excluding
/// the entry cell. The final cell is always a normal road cell.
pub type CrossingPath = SmallVec<[CellCoord; 8]>;

/// Plans a crossing of the junction starting at `entry`, for a vehicle
/// travelling in `heading` as it arrives.
///
/// Candidate paths chain through adjacent junction cells until they land
/// on a normal road cell; candidates that leave the grid, hit unusable
/// terrain, or revisit a cell are discarded. One survivor is chosen
/// uniformly at random. An empty result means there is no legal way
/// through right now, which the caller treats as "wait and retry", not
/// as an error.
pub fn plan_crossing<R: Rng + ?Sized>(
    grid: &Grid,
    entry: CellCoord,
    heading: Direction,
    rng: &mut R,
) -> CrossingPath {
    let mut candidates = Vec::new();
    let mut prefix = CrossingPath::new();
    extend(grid, entry, entry, heading, &mut prefix, &mut candidates);
    match candidates.len() {
        0 => CrossingPath::new(),
        len => candidates.swap_remove(rng.gen_range(0..len)),
    }
}

/// Walks one step onward from the junction cell `at`, branching over its
/// legal exits, and collects every completed path into `out`.
fn extend(
    grid: &Grid,
    entry: CellCoord,
    at: CellCoord,
    heading: Direction,
    prefix: &mut CrossingPath,
    out: &mut Vec<CrossingPath>,
) {
    let CellType::Junction(kind) = grid.cell(at) else {
        return;
    };
    for dir in exit_directions(kind, heading) {
        let Some(next) = at.step(dir) else { continue };
        if next == entry || prefix.contains(&next) {
            continue;
        }
        match grid.cell(next) {
            CellType::Empty => {}
            CellType::Road(_) => {
                let mut path = prefix.clone();
                path.push(next);
                out.push(path);
            }
            CellType::Junction(_) => {
                prefix.push(next);
                extend(grid, entry, next, dir, prefix, out);
                prefix.pop();
            }
        }
    }
}

/// The legal ways out of a junction cell for a vehicle that entered it
/// travelling in `heading`. The reversal of `heading` is filtered out so
/// a vehicle never turns straight back the way it came.
fn exit_directions(kind: JunctionKind, heading: Direction) -> ArrayVec<Direction, 2> {
    kind.exits()
        .iter()
        .copied()
        .filter(|dir| *dir != heading.opposite())
        .collect()
}
