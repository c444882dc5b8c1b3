//! Schema module - Configuration, parameter and result types for SKPAR runs.

mod config;
mod evolution;
mod parameter;

pub use config::*;
pub use evolution::*;
pub use parameter::*;
