//! Evolutionary search over a bounded parameter space.
//!
//! # Overview
//!
//! - **Variation** (`genome`): seeded sampling, blend crossover and Gaussian
//!   mutation that never leave the parameter bounds
//! - **Statistics** (`stats`): per-generation mean/std/min/max of the cost
//! - **Search** (`search`): the generation loop, genetic algorithm,
//!   particle swarm and scan stepping, stopping rules
//! - **Swarm** (`swarm`): particle state in normalized coordinates
//! - **Scan** (`scan`): regular grid over the parameter bounds
//! - **Archive** (`archive`): hall of fame and result export
//!
//! # Example
//!
//! ```rust,no_run
//! use skpar::compute::FunctionObjective;
//! use skpar::compute::evolution::EvolutionEngine;
//! use skpar::schema::{EvolutionConfig, ParameterSpace};
//!
//! let space = ParameterSpace::parse(&["x 0.0 -1.0 1.0", "n 3 1 8 i"]).unwrap();
//! let objective = FunctionObjective::new(space, |v: &[f64]| v[0].powi(2) + (v[1] - 4.0).abs());
//!
//! let mut engine = EvolutionEngine::new(EvolutionConfig::default(), objective);
//! let result = engine.run_with_callback(|progress| {
//!     println!("Generation {}: best cost = {:.3e}",
//!         progress.generation, progress.best_fitness);
//! });
//! println!("Best: {:?}", result.best.parameters);
//! ```

mod archive;
mod genome;
mod scan;
mod search;
mod stats;
mod swarm;

pub use archive::{BEST_PARAMETER_FILE, HallOfFame, RESULT_FILE, load_result, save_result};
pub use genome::ParameterRng;
pub use scan::{Scan, grid_points};
pub use search::{Candidate, EvolutionEngine, FailureRecord, Fitness};
pub use stats::fitness_statistics;
pub use swarm::{Particle, Swarm, denormalize, normalize};
