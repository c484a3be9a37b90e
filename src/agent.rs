use log::{debug, info, trace};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::debug::{debug_move, debug_reserve};
use crate::path::{plan_crossing, CrossingPath};
use crate::sync::LockTable;
use crate::util::CancelToken;
use crate::{CellCoord, CellType, Direction, Grid, RedrawHook};

/// Source of unique agent identifiers. Strictly increasing; used only for
/// display and logging.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of an agent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    /// Created but yet to complete a move.
    Spawned = 0,
    /// Travelling along normal road.
    MovingNormal = 1,
    /// Reserving or traversing an intersection block.
    Crossing = 2,
    /// Reached an exit point. Terminal.
    Arrived = 3,
    /// Torn down by cancellation. Terminal.
    Cancelled = 4,
}

impl AgentState {
    fn from_u8(value: u8) -> AgentState {
        match value {
            0 => AgentState::Spawned,
            1 => AgentState::MovingNormal,
            2 => AgentState::Crossing,
            3 => AgentState::Arrived,
            _ => AgentState::Cancelled,
        }
    }
}

/// A simulated vehicle.
///
/// The position fields are written only by the agent's own thread and read
/// lock-free by the renderer and the population controller.
pub struct Agent {
    /// The agent's display ID.
    id: u64,
    /// The current position, packed for atomic access.
    pos: AtomicU64,
    /// The previous position; disambiguates the heading on double-exit
    /// junction cells. Equals `pos` until the first move.
    prev: AtomicU64,
    /// The lifecycle state.
    state: AtomicU8,
    /// Time between steps. Randomized per agent at spawn.
    cadence: Duration,
}

/// Shared collaborators handed to every agent thread.
pub(crate) struct AgentContext {
    pub grid: Arc<Grid>,
    pub locks: Arc<LockTable>,
    pub cancel: CancelToken,
    pub redraw: RedrawHook,
    /// Consecutive failed reservations tolerated before a fresh random
    /// path is planned.
    pub replan_after: u32,
}

impl Agent {
    /// Creates an agent at `start`, which the caller must already have
    /// claimed the lock for.
    pub(crate) fn new(start: CellCoord, cadence: Duration) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            pos: AtomicU64::new(start.pack()),
            prev: AtomicU64::new(start.pack()),
            state: AtomicU8::new(AgentState::Spawned as u8),
            cadence,
        }
    }

    /// The agent's display ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The agent's current cell.
    pub fn position(&self) -> CellCoord {
        CellCoord::unpack(self.pos.load(Ordering::Acquire))
    }

    /// The cell the agent occupied before its last move.
    pub fn prev_position(&self) -> CellCoord {
        CellCoord::unpack(self.prev.load(Ordering::Acquire))
    }

    /// The agent's lifecycle state.
    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the agent has terminated, by arrival or cancellation.
    pub fn is_done(&self) -> bool {
        matches!(self.state(), AgentState::Arrived | AgentState::Cancelled)
    }

    /// The agent's movement cadence.
    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The agent's main loop. Runs on its own thread until it reaches an
    /// exit point or is cancelled.
    pub(crate) fn run(&self, ctx: &AgentContext) {
        info!("agent {} spawned at {}", self.id, self.position());
        let mut rng = rand::thread_rng();
        let mut planned: Option<CrossingPath> = None;
        let mut failed_attempts = 0u32;

        loop {
            if ctx.cancel.is_cancelled() {
                self.bail(ctx, &[]);
                return;
            }

            let pos = self.position();
            if ctx.grid.is_exit(pos) {
                ctx.locks.release(pos);
                self.set_state(AgentState::Arrived);
                info!("agent {} arrived at {}", self.id, pos);
                return;
            }

            let Some((heading, next)) = self.next_cell(&ctx.grid, pos) else {
                // Nowhere to go from here; a malformed map, not an error.
                // Wait a beat and look again.
                if ctx.cancel.sleep(self.cadence) {
                    self.bail(ctx, &[]);
                    return;
                }
                continue;
            };

            if ctx.grid.cell(next).is_junction() {
                self.set_state(AgentState::Crossing);
                if planned.is_none() {
                    let path = plan_crossing(&ctx.grid, next, heading, &mut rng);
                    if path.is_empty() {
                        if ctx.cancel.sleep(self.cadence) {
                            self.bail(ctx, &[]);
                            return;
                        }
                        continue;
                    }
                    planned = Some(path);
                }
                let Some(path) = planned.as_ref() else { continue };

                // Reserve the entry cell plus the whole crossing in one shot.
                let mut cells: SmallVec<[CellCoord; 8]> = SmallVec::new();
                cells.push(next);
                cells.extend_from_slice(path);
                if ctx.locks.try_acquire_path(&cells) {
                    debug!(
                        "agent {} reserved {} junction cells from {}",
                        self.id,
                        cells.len(),
                        next
                    );
                    debug_reserve(self.id, &cells);
                    planned = None;
                    failed_attempts = 0;
                    if self.traverse(ctx, &cells) {
                        return;
                    }
                } else {
                    failed_attempts += 1;
                    if failed_attempts >= ctx.replan_after {
                        debug!(
                            "agent {} replanning after {} failed reservations",
                            self.id, failed_attempts
                        );
                        planned = None;
                        failed_attempts = 0;
                    }
                    if ctx.cancel.sleep(self.cadence) {
                        self.bail(ctx, &[]);
                        return;
                    }
                }
            } else {
                self.set_state(AgentState::MovingNormal);
                if ctx.locks.acquire(next, &ctx.cancel).is_err() {
                    self.bail(ctx, &[]);
                    return;
                }
                self.move_to(ctx, next);
                if ctx.cancel.sleep(self.cadence) {
                    self.bail(ctx, &[]);
                    return;
                }
            }
        }
    }

    /// Steps through a fully reserved crossing, cell by cell. Returns
    /// true iff the agent was cancelled partway; every reserved lock has
    /// been released either way.
    fn traverse(&self, ctx: &AgentContext, cells: &[CellCoord]) -> bool {
        for (entered, &cell) in cells.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                self.bail(ctx, &cells[entered..]);
                return true;
            }
            self.move_to(ctx, cell);
            if ctx.cancel.sleep(self.cadence) {
                self.bail(ctx, &cells[entered + 1..]);
                return true;
            }
        }
        false
    }

    /// Lock-ahead move: the destination lock is already held. Updates the
    /// position, notifies the renderer, then frees the vacated cell.
    fn move_to(&self, ctx: &AgentContext, dest: CellCoord) {
        let origin = self.position();
        self.prev.store(origin.pack(), Ordering::Release);
        self.pos.store(dest.pack(), Ordering::Release);
        (ctx.redraw)();
        ctx.locks.release(origin);
        debug_move(self.id, origin, dest);
        trace!("agent {} moved {} -> {}", self.id, origin, dest);
    }

    /// Releases everything the agent holds, then marks it cancelled:
    /// its position lock plus any still-reserved crossing cells. A
    /// cancelled agent that leaked a lock would strand that cell for the
    /// rest of the run.
    fn bail(&self, ctx: &AgentContext, reserved: &[CellCoord]) {
        ctx.locks.release(self.position());
        ctx.locks.release_path(reserved);
        self.set_state(AgentState::Cancelled);
        info!("agent {} cancelled at {}", self.id, self.position());
    }

    /// The cell this agent will head for next, with the heading that
    /// takes it there, or `None` if the way ahead is unusable.
    fn next_cell(&self, grid: &Grid, pos: CellCoord) -> Option<(Direction, CellCoord)> {
        let dir = match grid.cell(pos) {
            CellType::Empty => return None,
            CellType::Road(dir) => dir,
            CellType::Junction(kind) => {
                // Normally unreachable: junction cells are traversed under
                // a reserved path. Reachable on a malformed map; continue
                // through the block if the arrival heading allows it.
                let heading = self.prev_position().direction_to(pos);
                match heading {
                    Some(heading) if kind.exits().contains(&heading) => heading,
                    _ => *kind.exits().first()?,
                }
            }
        };
        let next = pos.step(dir)?;
        if grid.cell(next) == CellType::Empty {
            return None;
        }
        Some((dir, next))
    }
}
