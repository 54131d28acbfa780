//! Simulation
//!
//! Support for accelerated runs against the simulated marketplace.

mod evaluator;

pub use evaluator::{finished_simulations, CompletedRun, SimulationEvaluator, SIMULATION_RUNS_OWNER};
