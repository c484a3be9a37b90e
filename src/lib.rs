pub use agent::{Agent, AgentState};
#[cfg(feature = "debug")]
pub use debug::take_debug_events;
pub use grid::{CellCoord, CellType, Direction, Grid, GridError, JunctionKind};
pub use path::{plan_crossing, CrossingPath};
pub use simulation::{Simulation, SimulationConfig};
use slotmap::{new_key_type, SlotMap};
pub use slotmap::{Key, KeyData};
use std::sync::Arc;
pub use sync::{LockStrategy, LockTable};
pub use util::{CancelToken, Cancelled};

mod agent;
mod debug;
mod grid;
mod path;
mod simulation;
mod sync;
mod util;

new_key_type! {
    /// Unique ID of an [Agent] within the registry.
    pub struct AgentKey;
}

type AgentSet = SlotMap<AgentKey, simulation::AgentSlot>;

/// Fire-and-forget notification invoked after every successful single-cell
/// move, so an external renderer knows agent positions have changed.
/// Called concurrently from every agent's thread; must not block.
pub type RedrawHook = Arc<dyn Fn() + Send + Sync>;
