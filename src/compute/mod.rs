//! Compute module - the fitting pipeline from parameters to cost.

mod command;
mod evaluator;
mod query;
mod runner;
mod target;
mod task;
mod template;

pub mod evolution;

pub use command::*;
pub use evaluator::*;
pub use query::*;
pub use runner::*;
pub use target::*;
pub use task::*;
pub use template::*;
