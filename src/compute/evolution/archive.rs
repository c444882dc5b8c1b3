//! Hall of fame and export of the final result.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::schema::{CandidateSnapshot, EvolutionResult, ParameterSpace, format_parameter_file};

/// Full result as pretty JSON.
pub const RESULT_FILE: &str = "result.json";
/// Best parameter assignment in `current.par` layout.
pub const BEST_PARAMETER_FILE: &str = "best.par";

/// Best distinct candidates seen over a run, lowest cost first.
#[derive(Debug, Default)]
pub struct HallOfFame {
    entries: Vec<CandidateSnapshot>,
    max_size: usize,
}

impl HallOfFame {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Offer a candidate. Failed evaluations and duplicates of an entry's
    /// parameter values are rejected. Returns whether it was admitted.
    pub fn insert(&mut self, snapshot: &CandidateSnapshot) -> bool {
        if self.max_size == 0 || snapshot.failure.is_some() || !snapshot.fitness.is_finite() {
            return false;
        }
        if self
            .entries
            .iter()
            .any(|e| e.parameters == snapshot.parameters)
        {
            return false;
        }
        if self.entries.len() >= self.max_size
            && self
                .entries
                .last()
                .is_some_and(|worst| snapshot.fitness >= worst.fitness)
        {
            return false;
        }

        let pos = self
            .entries
            .partition_point(|e| e.fitness <= snapshot.fitness);
        self.entries.insert(pos, snapshot.clone());
        self.entries.truncate(self.max_size);
        true
    }

    pub fn best(&self) -> Option<&CandidateSnapshot> {
        self.entries.first()
    }

    pub fn entries(&self) -> &[CandidateSnapshot] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Write `result.json` and `best.par` into `dir`, creating it if needed.
pub fn save_result<P: AsRef<Path>>(
    dir: P,
    result: &EvolutionResult,
    space: &ParameterSpace,
) -> io::Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let result_path = dir.join(RESULT_FILE);
    let json = serde_json::to_string_pretty(result)?;
    fs::write(&result_path, json)?;

    let values: Vec<f64> = result.best.parameters.iter().map(|p| p.value).collect();
    let header = format!(
        "generation {} id {} fitness {}",
        result.best.generation, result.best.id, result.best.fitness
    );
    let best_path = dir.join(BEST_PARAMETER_FILE);
    fs::write(
        &best_path,
        format_parameter_file(space, &values, Some(&header)),
    )?;

    log::info!("Saved results to {}", dir.display());
    Ok(vec![result_path, best_path])
}

/// Load a previously saved result.
pub fn load_result<P: AsRef<Path>>(path: P) -> io::Result<EvolutionResult> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
