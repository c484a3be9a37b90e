//! Tests that involve a single agent on a straight corridor.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use traffic_grid::{CellCoord, Grid, LockStrategy, Simulation, SimulationConfig};

/// Polls until `cond` holds, failing the test if it takes too long.
fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A single agent on a 1-wide, N-long corridor reaches the exit in
/// exactly N-1 move steps, holds exactly two cells at the moment of every
/// move (its own plus the one it locked ahead into), and frees everything
/// upon arrival.
#[test]
fn agent_walks_the_corridor() {
    for strategy in [LockStrategy::Semaphore, LockStrategy::Monitor] {
        let n = 8;
        let row: Vec<String> = vec!["2".into(); n];
        let grid = Grid::parse(&format!("1\n{}\n{}\n", n, row.join(" "))).unwrap();
        assert_eq!(grid.entries(), &[CellCoord::new(0, 0)]);
        assert_eq!(grid.exits(), &[CellCoord::new(0, n as u32 - 1)]);

        let mut sim = Simulation::new(
            grid,
            SimulationConfig {
                strategy,
                max_agents: 1,
                spawn_interval: Duration::from_secs(60),
                cadence: Duration::from_millis(10),
                ..Default::default()
            },
        );

        // The hook runs on the agent's own thread right after each move,
        // before the vacated cell is released, so with a single agent it
        // observes the lock table at a quiescent instant.
        let locks = sim.locks_shared();
        let moves = Arc::new(AtomicUsize::new(0));
        let min_held = Arc::new(AtomicUsize::new(usize::MAX));
        let max_held = Arc::new(AtomicUsize::new(0));
        let hook = {
            let (moves, min_held, max_held) = (moves.clone(), min_held.clone(), max_held.clone());
            Arc::new(move || {
                let held = locks.occupied_count();
                min_held.fetch_min(held, Ordering::SeqCst);
                max_held.fetch_max(held, Ordering::SeqCst);
                moves.fetch_add(1, Ordering::SeqCst);
            })
        };
        sim.set_redraw_hook(hook);
        sim.start();
        sim.halt_spawning();

        wait_for("the agent to arrive", || {
            moves.load(Ordering::SeqCst) == n - 1 && sim.locks().occupied_count() == 0
        });

        assert_eq!(moves.load(Ordering::SeqCst), n - 1);
        assert_eq!(min_held.load(Ordering::SeqCst), 2);
        assert_eq!(max_held.load(Ordering::SeqCst), 2);
        sim.stop();
    }
}

/// The population controller replaces an arrived agent, and the
/// insertion cutoff stops it doing so.
#[test]
fn controller_replaces_arrived_agents() {
    let grid = Grid::parse("1\n4\n2 2 2 2\n").unwrap();
    let mut sim = Simulation::new(
        grid,
        SimulationConfig {
            max_agents: 1,
            spawn_interval: Duration::from_millis(20),
            cadence: Duration::from_millis(5),
            ..Default::default()
        },
    );
    sim.start();

    let mut seen = HashSet::new();
    wait_for("a replacement agent", || {
        for agent in sim.agents() {
            seen.insert(agent.id());
        }
        seen.len() >= 2
    });

    sim.halt_spawning();
    wait_for("the population to drain", || sim.agents().is_empty());
    assert_eq!(sim.locks().occupied_count(), 0);
    sim.stop();
}
