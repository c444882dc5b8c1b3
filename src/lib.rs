//! skpar - Parameter optimization for Slater-Koster tight-binding models.
//!
//! A candidate parameter vector is written into template input files, a chain
//! of external programs (Slater-Koster table generator, DFTB calculation,
//! post-processing) is run on it in an isolated working directory, and the
//! resulting observables are scored against reference data. An evolutionary
//! search minimizes that cost.
//!
//! # Architecture
//!
//! - `schema`: Parameters, run configuration and result types
//! - `compute`: Templates, tasks, extractors, objectives, evaluation and search
//!
//! # Example
//!
//! ```rust,no_run
//! use skpar::{compute::Optimizer, schema::RunConfig};
//!
//! let config = RunConfig::from_file("skpar.json").unwrap();
//! let mut optimizer = Optimizer::from_config(&config).unwrap();
//! let result = optimizer.run().unwrap();
//!
//! for p in &result.best.parameters {
//!     println!("{} = {}", p.name, p.value);
//! }
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::{Evaluator, Optimizer, RunError};
pub use schema::{EvolutionResult, ParameterSpace, RunConfig};
