use log::{debug, info};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::agent::AgentContext;
use crate::sync::DEFAULT_PATIENCE;
use crate::util::CancelToken;
use crate::{
    Agent, AgentKey, AgentSet, CellCoord, Grid, LockStrategy, LockTable, RedrawHook,
};

/// Configuration of a simulation run, supplied by the embedding
/// application. Consumed as plain parameters, never global state.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// Which locking strategy to build the cell-lock table with.
    pub strategy: LockStrategy,
    /// The maximum number of concurrently live agents.
    pub max_agents: usize,
    /// How often the population controller looks for terminated agents
    /// to replace.
    pub spawn_interval: Duration,
    /// The base time between agent steps. Each agent's cadence is this
    /// scaled by a random factor drawn at spawn.
    pub cadence: Duration,
    /// How long a bounded lock acquisition waits before giving up.
    pub patience: Duration,
    /// Consecutive failed path reservations tolerated before an agent
    /// plans a fresh random path.
    pub replan_after: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            strategy: LockStrategy::default(),
            max_agents: 8,
            spawn_interval: Duration::from_millis(500),
            cadence: Duration::from_millis(500),
            patience: DEFAULT_PATIENCE,
            replan_after: 3,
        }
    }
}

/// A registry entry: the shared agent record plus its thread handle.
pub(crate) struct AgentSlot {
    pub agent: Arc<Agent>,
    pub thread: Option<JoinHandle<()>>,
}

/// A traffic simulation: the grid, its lock table, and the population of
/// agents driving over it.
pub struct Simulation {
    grid: Arc<Grid>,
    locks: Arc<LockTable>,
    config: SimulationConfig,
    agents: Arc<Mutex<AgentSet>>,
    cancel: CancelToken,
    spawning: Arc<AtomicBool>,
    redraw: RedrawHook,
    controller: Option<JoinHandle<()>>,
}

impl Simulation {
    /// Creates a new simulation over `grid`. Builds the cell-lock table;
    /// no agents exist until [Simulation::start] is called.
    pub fn new(grid: Grid, config: SimulationConfig) -> Self {
        let locks = LockTable::with_patience(&grid, config.strategy, config.patience);
        Self {
            grid: Arc::new(grid),
            locks: Arc::new(locks),
            config,
            agents: Arc::new(Mutex::new(AgentSet::default())),
            cancel: CancelToken::new(),
            spawning: Arc::new(AtomicBool::new(true)),
            redraw: Arc::new(|| {}),
            controller: None,
        }
    }

    /// The simulated grid.
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// The cell-lock table. Authoritative for occupancy queries.
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// A shared handle to the lock table, for collaborators (such as a
    /// renderer) that outlive borrows of the simulation.
    pub fn locks_shared(&self) -> Arc<LockTable> {
        self.locks.clone()
    }

    /// Registers the redraw notification, invoked after every successful
    /// single-cell move. Must be set before [Simulation::start].
    pub fn set_redraw_hook(&mut self, hook: RedrawHook) {
        self.redraw = hook;
    }

    /// Starts the run: seeds one agent per entry point (up to the
    /// configured maximum), then launches the population controller,
    /// which replaces terminated agents for as long as insertion is
    /// enabled. A simulation starts at most once.
    pub fn start(&mut self) {
        if self.controller.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let seeded: Vec<CellCoord> = self
            .grid
            .entries()
            .iter()
            .take(self.config.max_agents)
            .copied()
            .collect();
        let mut spawned = 0;
        for entry in seeded {
            if self.spawn_agent(entry) {
                spawned += 1;
            }
        }
        info!(
            "simulation started with {spawned} initial agents ({} strategy)",
            match self.config.strategy {
                LockStrategy::Semaphore => "semaphore",
                LockStrategy::Monitor => "monitor",
            }
        );

        let shared = ControllerShared {
            grid: self.grid.clone(),
            locks: self.locks.clone(),
            config: self.config.clone(),
            agents: self.agents.clone(),
            cancel: self.cancel.clone(),
            spawning: self.spawning.clone(),
            redraw: self.redraw.clone(),
        };
        self.controller = Some(std::thread::spawn(move || shared.run()));
    }

    /// Stops inserting new agents. In-flight agents are unaffected.
    pub fn halt_spawning(&self) {
        self.spawning.store(false, Ordering::Relaxed);
        info!("agent insertion halted");
    }

    /// Cancels every agent and the population controller, then joins all
    /// their threads. Every agent has run its release-all cleanup by the
    /// time this returns; no cell lock is left held.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.spawning.store(false, Ordering::Relaxed);
        if let Some(controller) = self.controller.take() {
            let _ = controller.join();
        }
        let slots: Vec<AgentSlot> = {
            let mut agents = lock_registry(&self.agents);
            agents.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if let Some(thread) = slot.thread {
                let _ = thread.join();
            }
        }
        info!("simulation stopped");
    }

    /// Whether the run has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.controller.is_some() && !self.cancel.is_cancelled()
    }

    /// The number of live (non-terminated) agents.
    pub fn agent_count(&self) -> usize {
        lock_registry(&self.agents)
            .values()
            .filter(|slot| !slot.agent.is_done())
            .count()
    }

    /// A snapshot of every live agent's ID and position, read lock-free
    /// per agent. Intended for rendering.
    pub fn positions(&self) -> Vec<(u64, CellCoord)> {
        lock_registry(&self.agents)
            .values()
            .filter(|slot| !slot.agent.is_done())
            .map(|slot| (slot.agent.id(), slot.agent.position()))
            .collect()
    }

    /// Shared handles to every live agent.
    pub fn agents(&self) -> Vec<Arc<Agent>> {
        lock_registry(&self.agents)
            .values()
            .filter(|slot| !slot.agent.is_done())
            .map(|slot| slot.agent.clone())
            .collect()
    }

    /// Whether some live agent currently reports `cell` as its position.
    ///
    /// Advisory only: this scan and the lock table can disagree
    /// transiently. The lock table ([LockTable::is_occupied]) is the
    /// authoritative signal for synchronization decisions.
    pub fn is_position_held(&self, cell: CellCoord) -> bool {
        lock_registry(&self.agents)
            .values()
            .any(|slot| !slot.agent.is_done() && slot.agent.position() == cell)
    }

    /// Claims `entry` and spawns an agent there. Returns whether an agent
    /// was created.
    fn spawn_agent(&self, entry: CellCoord) -> bool {
        spawn_agent(
            entry,
            &self.grid,
            &self.locks,
            &self.config,
            &self.agents,
            &self.cancel,
            &self.redraw,
        )
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the population controller thread needs.
struct ControllerShared {
    grid: Arc<Grid>,
    locks: Arc<LockTable>,
    config: SimulationConfig,
    agents: Arc<Mutex<AgentSet>>,
    cancel: CancelToken,
    spawning: Arc<AtomicBool>,
    redraw: RedrawHook,
}

impl ControllerShared {
    /// The controller loop: reap terminated agents, then top the
    /// population back up while insertion is enabled.
    fn run(self) {
        let mut rng = rand::thread_rng();
        loop {
            if self.cancel.sleep(self.config.spawn_interval) {
                break;
            }
            self.reap();

            if !self.spawning.load(Ordering::Relaxed) || self.grid.entries().is_empty() {
                continue;
            }
            let live = lock_registry(&self.agents)
                .values()
                .filter(|slot| !slot.agent.is_done())
                .count();
            if live >= self.config.max_agents {
                continue;
            }

            let entries = self.grid.entries();
            let entry = entries[rng.gen_range(0..entries.len())];
            // Racy pre-check; the try_acquire in spawn_agent is what
            // actually claims the cell.
            if self.locks.is_occupied(entry) {
                continue;
            }
            spawn_agent(
                entry,
                &self.grid,
                &self.locks,
                &self.config,
                &self.agents,
                &self.cancel,
                &self.redraw,
            );
        }
        debug!("population controller finished");
    }

    /// Removes terminated agents from the registry and joins their
    /// threads.
    fn reap(&self) {
        let done: Vec<AgentSlot> = {
            let mut agents = lock_registry(&self.agents);
            let keys: Vec<AgentKey> = agents
                .iter()
                .filter(|(_, slot)| slot.agent.is_done())
                .map(|(key, _)| key)
                .collect();
            keys.into_iter().filter_map(|key| agents.remove(key)).collect()
        };
        for slot in done {
            debug!("reaped agent {}", slot.agent.id());
            if let Some(thread) = slot.thread {
                let _ = thread.join();
            }
        }
    }
}

/// Claims `entry` via the lock table and, on success, registers and
/// starts a new agent there. The agent owns its entry-cell lock from
/// birth, so it holds its position lock at every instant of its life.
fn spawn_agent(
    entry: CellCoord,
    grid: &Arc<Grid>,
    locks: &Arc<LockTable>,
    config: &SimulationConfig,
    agents: &Arc<Mutex<AgentSet>>,
    cancel: &CancelToken,
    redraw: &RedrawHook,
) -> bool {
    if !locks.try_acquire(entry) {
        return false;
    }

    let agent = Arc::new(Agent::new(entry, sample_cadence(config.cadence)));
    let ctx = AgentContext {
        grid: grid.clone(),
        locks: locks.clone(),
        cancel: cancel.clone(),
        redraw: redraw.clone(),
        replan_after: config.replan_after,
    };

    let mut registry = lock_registry(agents);
    let key = registry.insert(AgentSlot {
        agent: agent.clone(),
        thread: None,
    });
    let thread = std::thread::spawn(move || agent.run(&ctx));
    if let Some(slot) = registry.get_mut(key) {
        slot.thread = Some(thread);
    }
    true
}

/// Randomly scales the base cadence per agent, to create behavioural
/// variety between vehicles.
fn sample_cadence(base: Duration) -> Duration {
    let distr = Normal::new(1.0, 0.25).expect("Invalid standard deviation");
    let factor = Distribution::<f64>::sample(&distr, &mut rand::thread_rng()).clamp(0.5, 1.5);
    base.mul_f64(factor)
}

fn lock_registry(agents: &Mutex<AgentSet>) -> std::sync::MutexGuard<'_, AgentSet> {
    agents.lock().unwrap_or_else(PoisonError::into_inner)
}
