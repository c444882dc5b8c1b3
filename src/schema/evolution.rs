//! Evolution configuration and result types for the parameter search.
//!
//! Fitness is a cost throughout: lower is better.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the evolutionary search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Search algorithm to use.
    #[serde(default)]
    pub algorithm: SearchAlgorithm,
    /// Population and stopping settings.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Number of best distinct individuals kept across the run.
    #[serde(default = "default_hall_of_fame")]
    pub hall_of_fame: usize,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Directory receiving `result.json` and `best.par` at the end of the run.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            algorithm: SearchAlgorithm::default(),
            population: PopulationConfig::default(),
            hall_of_fame: default_hall_of_fame(),
            random_seed: None,
            output_dir: None,
        }
    }
}

fn default_hall_of_fame() -> usize {
    10
}

/// Search algorithm selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SearchAlgorithm {
    /// Genetic algorithm with elitism, crossover and Gaussian mutation.
    GeneticAlgorithm(GeneticAlgorithmConfig),
    /// Particle swarm over normalized parameter coordinates.
    ParticleSwarm(ParticleSwarmConfig),
    /// Exhaustive evaluation of a regular grid over the parameter bounds.
    ParameterScan(ParameterScanConfig),
}

impl Default for SearchAlgorithm {
    fn default() -> Self {
        Self::GeneticAlgorithm(GeneticAlgorithmConfig::default())
    }
}

/// Genetic Algorithm configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneticAlgorithmConfig {
    /// Selection method.
    #[serde(default)]
    pub selection: SelectionMethod,
    /// Crossover probability (0.0-1.0).
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    /// Mutation probability per parameter (0.0-1.0).
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    /// Mutation strength, as a fraction of each parameter's range.
    #[serde(default = "default_mutation_strength")]
    pub mutation_strength: f64,
    /// Elitism: number of best individuals carried over unchanged.
    #[serde(default = "default_elitism")]
    pub elitism: usize,
}

impl Default for GeneticAlgorithmConfig {
    fn default() -> Self {
        Self {
            selection: SelectionMethod::default(),
            crossover_rate: default_crossover_rate(),
            mutation_rate: default_mutation_rate(),
            mutation_strength: default_mutation_strength(),
            elitism: default_elitism(),
        }
    }
}

fn default_crossover_rate() -> f64 {
    0.8
}
fn default_mutation_rate() -> f64 {
    0.2
}
fn default_mutation_strength() -> f64 {
    0.1
}
fn default_elitism() -> usize {
    2
}

/// Selection method for genetic algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum SelectionMethod {
    /// Tournament selection with configurable size.
    Tournament {
        #[serde(default = "default_tournament_size")]
        size: usize,
    },
    /// Rank-based selection.
    RankBased,
    /// Roulette wheel on inverted cost.
    RouletteWheel,
}

impl Default for SelectionMethod {
    fn default() -> Self {
        Self::Tournament {
            size: default_tournament_size(),
        }
    }
}

fn default_tournament_size() -> usize {
    3
}

/// Particle swarm configuration.
///
/// Positions live in `[-1, 1]` per parameter; speeds are in the same units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticleSwarmConfig {
    /// Persistence factor applied to the previous displacement.
    #[serde(default = "default_inertia")]
    pub inertia: f64,
    /// Total acceleration, split evenly between personal and global attraction.
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    /// Lower speed limit per dimension.
    #[serde(default = "default_smin")]
    pub smin: f64,
    /// Upper speed limit per dimension.
    #[serde(default = "default_smax")]
    pub smax: f64,
    /// Reflect particles that leave `[-1, 1]` back inside.
    #[serde(default = "default_strict_bounds")]
    pub strict_bounds: bool,
}

impl Default for ParticleSwarmConfig {
    fn default() -> Self {
        Self {
            inertia: default_inertia(),
            acceleration: default_acceleration(),
            smin: default_smin(),
            smax: default_smax(),
            strict_bounds: default_strict_bounds(),
        }
    }
}

fn default_inertia() -> f64 {
    0.7298
}
fn default_acceleration() -> f64 {
    2.9922
}
fn default_smin() -> f64 {
    -1.0
}
fn default_smax() -> f64 {
    1.0
}
fn default_strict_bounds() -> bool {
    true
}

/// Grid scan configuration.
///
/// Each free parameter is divided into equally spaced points, end points
/// included; every point of the cartesian product is evaluated, in batches of
/// the population size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterScanConfig {
    /// Points per parameter unless overridden.
    #[serde(default = "default_scan_points")]
    pub points: usize,
    /// Point counts for individual parameters.
    #[serde(default)]
    pub per_parameter: BTreeMap<String, usize>,
}

impl Default for ParameterScanConfig {
    fn default() -> Self {
        Self {
            points: default_scan_points(),
            per_parameter: BTreeMap::new(),
        }
    }
}

fn default_scan_points() -> usize {
    5
}

/// Population size and stopping rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Number of individuals in population.
    #[serde(default = "default_population_size")]
    pub size: usize,
    /// Maximum number of generations.
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
    /// Stop once the best cost falls to or below this value.
    #[serde(default)]
    pub target_fitness: Option<f64>,
    /// Stop when the best cost improves by less than this over `tolerance_window` generations.
    #[serde(default)]
    pub tolerance: Option<f64>,
    /// Window (in generations) for the improvement tolerance.
    #[serde(default = "default_tolerance_window")]
    pub tolerance_window: usize,
    /// Stop when the smallest worst relative error in a generation falls below this.
    #[serde(default)]
    pub error_tolerance: Option<f64>,
    /// Stagnation limit: stop if no improvement for N generations.
    #[serde(default)]
    pub stagnation_limit: Option<usize>,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: default_population_size(),
            max_generations: default_max_generations(),
            target_fitness: None,
            tolerance: None,
            tolerance_window: default_tolerance_window(),
            error_tolerance: None,
            stagnation_limit: None,
        }
    }
}

fn default_population_size() -> usize {
    20
}
fn default_max_generations() -> usize {
    100
}
fn default_tolerance_window() -> usize {
    10
}

// ============================================================================
// Progress and Result Types
// ============================================================================

/// Aggregate statistics of a set of fitness values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct FitnessStats {
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Statistics recorded once per generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationStats {
    /// Generation index (0 is the initial population).
    pub generation: usize,
    /// Fitness statistics over the generation.
    pub fitness: FitnessStats,
    /// Smallest worst relative error among the generation's individuals.
    pub min_worst_error: Option<f64>,
    /// Number of individuals scored with the worst-case fitness.
    pub failures: usize,
}

/// Evolution history for plotting and convergence inspection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvolutionHistory {
    /// One record per evaluated generation.
    pub generations: Vec<GenerationStats>,
}

impl EvolutionHistory {
    /// Best (lowest) cost per generation.
    pub fn best_fitness(&self) -> Vec<f64> {
        self.generations.iter().map(|g| g.fitness.min).collect()
    }

    /// Mean cost per generation.
    pub fn avg_fitness(&self) -> Vec<f64> {
        self.generations.iter().map(|g| g.fitness.mean).collect()
    }
}

/// Progress update delivered after each generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionProgress {
    /// Current generation number.
    pub generation: usize,
    /// Total generations planned.
    pub total_generations: usize,
    /// Best cost seen so far.
    pub best_fitness: f64,
    /// Statistics of the current population.
    pub stats: FitnessStats,
    /// Generations since last improvement.
    pub stagnation_count: usize,
    /// Current best candidate.
    pub best_candidate: Option<CandidateSnapshot>,
}

/// Snapshot of an evaluated individual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSnapshot {
    /// Unique identifier.
    pub id: u64,
    /// Cost.
    pub fitness: f64,
    /// Largest relative deviation from reference over all targets.
    pub worst_relative_error: Option<f64>,
    /// Parameter assignment, in declaration order.
    pub parameters: Vec<NamedValue>,
    /// Per-target residual breakdown.
    pub target_scores: Vec<TargetScore>,
    /// Generation this candidate was created.
    pub generation: usize,
    /// Parent IDs.
    pub parents: Vec<u64>,
    /// Failure description when the evaluation did not complete.
    #[serde(default)]
    pub failure: Option<String>,
}

/// A named numeric value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedValue {
    pub name: String,
    pub value: f64,
}

/// Residual contribution of one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetScore {
    /// Target key.
    pub key: String,
    /// Normalized weight.
    pub weight: f64,
    /// Target residual aggregated over its items.
    pub residual: f64,
    /// Largest relative error over the weighted items.
    pub relative_error: f64,
    /// Weighted contribution to the cost.
    pub weighted_residual: f64,
    /// Per-item breakdown.
    pub items: Vec<ItemScore>,
}

/// One compared value of a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemScore {
    /// Observable name.
    pub observable: String,
    /// Reference value.
    pub reference: f64,
    /// Extracted model value; `None` when unavailable.
    pub model: Option<f64>,
    pub subweight: f64,
    /// Residual under the target's method (the penalty if unavailable).
    pub residual: f64,
    /// Relative error (the penalty if unavailable).
    pub relative_error: f64,
}

/// Final result of an evolution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionResult {
    /// Best candidate found.
    pub best: CandidateSnapshot,
    /// Best distinct candidates over the whole run.
    pub hall_of_fame: Vec<CandidateSnapshot>,
    /// Statistics from the run.
    pub stats: EvolutionStats,
    /// Full history for analysis.
    pub history: EvolutionHistory,
}

/// Statistics from an evolution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionStats {
    /// Total generations run.
    pub generations: usize,
    /// Total evaluations performed.
    pub total_evaluations: u64,
    /// Evaluations scored with the worst-case fitness.
    pub failed_evaluations: u64,
    /// Best cost achieved.
    pub best_fitness: f64,
    /// Average cost of final population.
    pub final_avg_fitness: f64,
    /// Time taken (in seconds).
    pub elapsed_seconds: f64,
    /// Evaluations per second.
    pub evaluations_per_second: f64,
    /// Reason for stopping.
    pub stop_reason: StopReason,
}

/// Reason evolution stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Reached maximum generations.
    MaxGenerations,
    /// Reached target fitness.
    TargetReached,
    /// Improvement fell below the tolerance over the window.
    Converged,
    /// Worst relative error fell below the error tolerance.
    ErrorTolerance,
    /// Stagnation limit hit.
    Stagnation,
    /// Every grid point of a parameter scan was evaluated.
    ScanComplete,
    /// User cancelled.
    Cancelled,
    /// Fatal evaluation error.
    Error(String),
}

// ============================================================================
// Validation
// ============================================================================

/// Evolution configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionConfigError {
    #[error("Population size must be at least 2")]
    PopulationTooSmall,
    #[error("Generation budget must be positive")]
    NoGenerations,
    #[error("Invalid rate: {0}")]
    InvalidRate(String),
    #[error("Elitism ({elitism}) must be smaller than population size ({size})")]
    TooManyElites { elitism: usize, size: usize },
    #[error("Tournament size must be positive")]
    EmptyTournament,
    #[error("Invalid tolerance: {0}")]
    InvalidTolerance(String),
    #[error("Invalid particle swarm setting: {0}")]
    InvalidSwarm(String),
    #[error("Invalid parameter scan: {0}")]
    InvalidScan(String),
}

impl EvolutionConfig {
    /// Validate evolution configuration.
    pub fn validate(&self) -> Result<(), EvolutionConfigError> {
        let population = &self.population;
        if population.size < 2 {
            return Err(EvolutionConfigError::PopulationTooSmall);
        }
        if population.max_generations == 0 {
            return Err(EvolutionConfigError::NoGenerations);
        }

        let check_unit = |value: f64, name: &str| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(EvolutionConfigError::InvalidRate(format!(
                    "{name} ({value}) must lie in [0, 1]"
                )))
            }
        };
        let check_non_negative = |value: Option<f64>, name: &str| match value {
            Some(v) if !(v.is_finite() && v >= 0.0) => Err(
                EvolutionConfigError::InvalidTolerance(format!("{name} ({v}) must be >= 0")),
            ),
            _ => Ok(()),
        };

        check_non_negative(population.tolerance, "tolerance")?;
        check_non_negative(population.error_tolerance, "error_tolerance")?;
        if population.tolerance.is_some() && population.tolerance_window == 0 {
            return Err(EvolutionConfigError::InvalidTolerance(
                "tolerance_window must be positive".to_string(),
            ));
        }

        match &self.algorithm {
            SearchAlgorithm::GeneticAlgorithm(ga) => {
                check_unit(ga.crossover_rate, "crossover_rate")?;
                check_unit(ga.mutation_rate, "mutation_rate")?;
                if !(ga.mutation_strength.is_finite() && ga.mutation_strength >= 0.0) {
                    return Err(EvolutionConfigError::InvalidRate(format!(
                        "mutation_strength ({}) must be >= 0",
                        ga.mutation_strength
                    )));
                }
                if ga.elitism >= population.size {
                    return Err(EvolutionConfigError::TooManyElites {
                        elitism: ga.elitism,
                        size: population.size,
                    });
                }
                if let SelectionMethod::Tournament { size: 0 } = ga.selection {
                    return Err(EvolutionConfigError::EmptyTournament);
                }
            }
            SearchAlgorithm::ParticleSwarm(pso) => {
                if pso.smin >= pso.smax {
                    return Err(EvolutionConfigError::InvalidSwarm(format!(
                        "smin ({}) must be below smax ({})",
                        pso.smin, pso.smax
                    )));
                }
                if !(pso.inertia.is_finite() && pso.acceleration.is_finite()) {
                    return Err(EvolutionConfigError::InvalidSwarm(
                        "inertia and acceleration must be finite".to_string(),
                    ));
                }
            }
            SearchAlgorithm::ParameterScan(scan) => {
                if scan.points == 0 {
                    return Err(EvolutionConfigError::InvalidScan(
                        "points must be positive".to_string(),
                    ));
                }
                if let Some((name, _)) = scan.per_parameter.iter().find(|(_, n)| **n == 0) {
                    return Err(EvolutionConfigError::InvalidScan(format!(
                        "points for '{name}' must be positive"
                    )));
                }
            }
        }

        Ok(())
    }
}
