use std::time::Duration;

use traffic_grid::{Grid, Simulation, SimulationConfig};

fn main() {
    let path = std::env::args()
        .nth(1)
        .expect("usage: traffic-grid <grid-file>");
    let grid = Grid::load(&path).unwrap();
    println!(
        "{}x{} grid, {} entries, {} exits",
        grid.rows(),
        grid.cols(),
        grid.entries().len(),
        grid.exits().len()
    );

    let mut sim = Simulation::new(grid, SimulationConfig::default());
    sim.start();

    println!("Simulating...");
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let positions = sim.positions();
        println!(
            "{} vehicles, {} cells held --> {:?}",
            positions.len(),
            sim.locks().occupied_count(),
            positions,
        )
    }
}
