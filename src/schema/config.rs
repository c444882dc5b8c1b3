//! Run configuration: parameters, tasks, objectives and evaluation settings.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{EvolutionConfig, EvolutionConfigError, ParameterSpace, ParameterSpecError};

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Parameter declarations, one entry per parameter.
    pub parameters: Vec<String>,
    /// Executable aliases: first command word -> invocation.
    #[serde(default)]
    pub executables: BTreeMap<String, String>,
    /// Tasks executed in order for every evaluation.
    pub tasks: Vec<TaskConfig>,
    /// Targets, reference data and cost function.
    pub objectives: ObjectivesConfig,
    /// Working directory and failure handling.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Search algorithm and stopping rules.
    #[serde(default)]
    pub evolution: EvolutionConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parameters: vec![
                "r0_Si_s 3.5 2.5 5.0".to_string(),
                "r0_Si_p 4.0 3.0 6.0".to_string(),
                "nc_Si 4 2 12 i".to_string(),
            ],
            executables: BTreeMap::from([
                ("skgen".to_string(), "skgen.sh".to_string()),
                ("dftb".to_string(), "dftb+".to_string()),
            ]),
            tasks: vec![
                TaskConfig {
                    name: "skgen".to_string(),
                    command: "skgen -o skf".to_string(),
                    subdir: None,
                    templates: vec![TemplateConfig {
                        source: PathBuf::from("template.skdefs.py"),
                        target: None,
                    }],
                    output: None,
                    timeout_seconds: None,
                },
                TaskConfig {
                    name: "dftb".to_string(),
                    command: "dftb".to_string(),
                    subdir: Some(PathBuf::from("Si")),
                    templates: Vec::new(),
                    output: Some(ExtractorConfig::default()),
                    timeout_seconds: None,
                },
            ],
            objectives: ObjectivesConfig {
                targets: vec![TargetSpec::new("Etot", 1.0), TargetSpec::new("Ef", 0.5)],
                reference: ReferenceSource::Inline(BTreeMap::from([
                    ("Etot".to_string(), ReferenceValue::Scalar(-105.0)),
                    ("Ef".to_string(), ReferenceValue::Scalar(-4.2)),
                ])),
                residual: ResidualMethod::default(),
                cost: CostFunction::default(),
                penalty: default_penalty(),
            },
            evaluation: EvaluationConfig::default(),
            evolution: EvolutionConfig::default(),
        }
    }
}

/// One external program invocation per evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identity used in logs and failure reports.
    pub name: String,
    /// Command line; the first word is looked up in the executable registry.
    pub command: String,
    /// Sub-directory of the evaluation working directory to run in.
    #[serde(default)]
    pub subdir: Option<PathBuf>,
    /// Templates rendered before launch.
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
    /// Extractor applied to the produced output.
    #[serde(default)]
    pub output: Option<ExtractorConfig>,
    /// Per-task timeout override.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
}

/// A template to render into the task directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Template path, relative to the task directory.
    pub source: PathBuf,
    /// Rendered path; defaults to the source name without its `template.` prefix.
    #[serde(default)]
    pub target: Option<PathBuf>,
}

/// Extractor selection, resolved by `kind` once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Extractor name (`DetailedOut`, `KeyValue`, `Table`).
    pub kind: String,
    /// Output file relative to the task directory; each kind has a default.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Report energies as unavailable when the SCC did not converge.
    #[serde(default = "default_require_convergence")]
    pub require_convergence: bool,
    /// Named picks for the `Table` extractor.
    #[serde(default)]
    pub columns: Vec<TableColumn>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            kind: "DetailedOut".to_string(),
            file: None,
            require_convergence: default_require_convergence(),
            columns: Vec::new(),
        }
    }
}

fn default_require_convergence() -> bool {
    true
}

/// A named cell of a numeric table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    /// Observable name.
    pub name: String,
    /// Zero-based data row (comments and blank lines skipped).
    pub row: usize,
    /// Zero-based column.
    pub column: usize,
    /// Factor applied to the value.
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_scale() -> f64 {
    1.0
}

/// Targets, reference data and cost aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectivesConfig {
    /// Observable names with raw weights.
    pub targets: Vec<TargetSpec>,
    /// Reference values for the targets.
    pub reference: ReferenceSource,
    /// Residual between model and reference.
    #[serde(default)]
    pub residual: ResidualMethod,
    /// Aggregation of weighted residuals into one cost.
    #[serde(default)]
    pub cost: CostFunction,
    /// Residual assigned to a target whose observable is unavailable.
    #[serde(default = "default_penalty")]
    pub penalty: f64,
}

fn default_penalty() -> f64 {
    1.0e3
}

/// A requested target with its raw weight.
///
/// A target compares one reference entry: a scalar, an array whose items are
/// the observables `key[0]`, `key[1]`, ... or a key-value map whose keys are
/// observable names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub key: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Residual for this target; the run-wide method when absent.
    #[serde(default)]
    pub residual: Option<ResidualMethod>,
    /// Aggregation over this target's items; the run-wide function when absent.
    #[serde(default)]
    pub cost: Option<CostFunction>,
    /// Weights of the individual items of an array or key-value target.
    #[serde(default)]
    pub subweights: Option<Subweights>,
    /// Scale subweights to sum to one.
    #[serde(default = "default_normalise")]
    pub normalise: bool,
}

impl TargetSpec {
    /// Target with default residual, cost and subweights.
    pub fn new(key: impl Into<String>, weight: f64) -> Self {
        Self {
            key: key.into(),
            weight,
            residual: None,
            cost: None,
            subweights: None,
            normalise: default_normalise(),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}
fn default_normalise() -> bool {
    true
}

/// Item weights within one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Subweights {
    /// One weight per item, in item order.
    List(Vec<f64>),
    /// A default weight with overrides.
    Rules(SubweightRules),
}

/// Subweight overrides. Indexes count from one and ranges are inclusive; where
/// ranges or value windows overlap, the larger weight wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubweightRules {
    /// Weight of items no rule touches; 1 for arrays, 0 for key-value maps.
    #[serde(default)]
    pub dflt: Option<f64>,
    /// `[index, weight]` pairs.
    #[serde(default)]
    pub indexes: Vec<(usize, f64)>,
    /// `[[first, last], weight]` pairs.
    #[serde(default)]
    pub ranges: Vec<((usize, usize), f64)>,
    /// `[[low, high], weight]` pairs over the reference values.
    #[serde(default)]
    pub values: Vec<((f64, f64), f64)>,
    /// Per-key weights of a key-value target.
    #[serde(default)]
    pub keys: BTreeMap<String, f64>,
}

/// One reference entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReferenceValue {
    Scalar(f64),
    Array(Vec<f64>),
    Pairs(BTreeMap<String, f64>),
}

impl From<f64> for ReferenceValue {
    fn from(value: f64) -> Self {
        Self::Scalar(value)
    }
}

/// Reference entries by target key.
pub type ReferenceData = BTreeMap<String, ReferenceValue>;

/// Where reference values come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReferenceSource {
    /// Values given inline.
    Inline(ReferenceData),
    /// Path to a JSON object of name -> value.
    File(PathBuf),
}

impl ReferenceSource {
    /// Load the reference map.
    pub fn load(&self) -> Result<ReferenceData, ConfigError> {
        match self {
            Self::Inline(values) => Ok(values.clone()),
            Self::File(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
}

/// Residual between a model value `m` and its reference `r`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ResidualMethod {
    /// `|m - r|`
    #[default]
    Absolute,
    /// `(m - r)^2`
    Squared,
    /// `|m - r| / |r|`, falling back to `|m|` when `r` vanishes.
    Relative,
}

/// Aggregation of residuals into the scalar cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CostFunction {
    /// `sum(w * residual)`
    #[default]
    WeightedSum,
    /// `sqrt(sum(w * residual^2))`
    Rms,
}

/// What happens when an evaluation fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Score the individual with `worst_fitness` and continue.
    #[default]
    WorstCase,
    /// Stop the run.
    Abort,
}

/// Working directories and failure handling for evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Root under which each evaluation gets its own `generation-index` directory.
    #[serde(default = "default_workroot")]
    pub workroot: PathBuf,
    /// Directory copied into every fresh working directory.
    #[serde(default)]
    pub templatedir: Option<PathBuf>,
    /// Keep working directories after evaluation.
    #[serde(default)]
    pub keep_workdirs: bool,
    /// Default per-task timeout.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    /// Re-runs of a failing task before the evaluation fails.
    #[serde(default)]
    pub retries: usize,
    /// Failure handling.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Cost assigned to failed evaluations under `WorstCase`.
    #[serde(default = "default_worst_fitness")]
    pub worst_fitness: f64,
    /// Number of parallel evaluations (0 = auto-detect).
    #[serde(default)]
    pub parallel_workers: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            workroot: default_workroot(),
            templatedir: None,
            keep_workdirs: false,
            timeout_seconds: None,
            retries: 0,
            failure_policy: FailurePolicy::default(),
            worst_fitness: default_worst_fitness(),
            parallel_workers: 0,
        }
    }
}

fn default_workroot() -> PathBuf {
    PathBuf::from("_workdir")
}
fn default_worst_fitness() -> f64 {
    1.0e10
}

impl RunConfig {
    /// Read and parse a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse the parameter declarations.
    pub fn parameter_space(&self) -> Result<ParameterSpace, ConfigError> {
        Ok(ParameterSpace::parse(&self.parameters)?)
    }

    /// Validate configuration before any evaluation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parameter_space()?;
        self.evolution.validate()?;

        if self.tasks.is_empty() {
            return Err(ConfigError::NoTasks);
        }
        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(ConfigError::DuplicateTask(task.name.clone()));
            }
            if task.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(task.name.clone()));
            }
            if let Some(t) = task.timeout_seconds {
                check_timeout(t)?;
            }
        }
        if let Some(t) = self.evaluation.timeout_seconds {
            check_timeout(t)?;
        }

        let objectives = &self.objectives;
        if objectives.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let mut keys = HashSet::new();
        for target in &objectives.targets {
            if !keys.insert(target.key.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.key.clone()));
            }
            if !(target.weight.is_finite() && target.weight >= 0.0) {
                return Err(ConfigError::InvalidWeight {
                    key: target.key.clone(),
                    weight: target.weight,
                });
            }
            if let Some(weight) = target.subweights.as_ref().and_then(invalid_subweight) {
                return Err(ConfigError::InvalidWeight {
                    key: target.key.clone(),
                    weight,
                });
            }
        }
        if objectives.targets.iter().map(|t| t.weight).sum::<f64>() <= 0.0 {
            return Err(ConfigError::ZeroTotalWeight);
        }
        if !(objectives.penalty.is_finite() && objectives.penalty >= 0.0) {
            return Err(ConfigError::InvalidPenalty(objectives.penalty));
        }
        if !self.evaluation.worst_fitness.is_finite() {
            return Err(ConfigError::InvalidWorstFitness(
                self.evaluation.worst_fitness,
            ));
        }

        Ok(())
    }
}

/// First subweight that is negative or not finite.
fn invalid_subweight(subweights: &Subweights) -> Option<f64> {
    let bad = |w: &f64| !(w.is_finite() && *w >= 0.0);
    match subweights {
        Subweights::List(list) => list.iter().copied().find(bad),
        Subweights::Rules(rules) => rules
            .dflt
            .iter()
            .chain(rules.indexes.iter().map(|(_, w)| w))
            .chain(rules.ranges.iter().map(|(_, w)| w))
            .chain(rules.values.iter().map(|(_, w)| w))
            .chain(rules.keys.values())
            .copied()
            .find(bad),
    }
}

fn check_timeout(seconds: f64) -> Result<(), ConfigError> {
    if seconds.is_finite() && seconds > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidTimeout(seconds))
    }
}

/// Configuration errors. All of them abort the run before any evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid parameter declaration: {0}")]
    Parameter(#[from] ParameterSpecError),
    #[error("Invalid evolution settings: {0}")]
    Evolution(#[from] EvolutionConfigError),
    #[error("At least one task is required")]
    NoTasks,
    #[error("Task '{0}' declared more than once")]
    DuplicateTask(String),
    #[error("Task '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("Timeout must be positive, got {0}")]
    InvalidTimeout(f64),
    #[error("At least one target is required")]
    NoTargets,
    #[error("Target '{0}' declared more than once")]
    DuplicateTarget(String),
    #[error("Target '{key}' has invalid weight {weight} (must be finite and >= 0)")]
    InvalidWeight { key: String, weight: f64 },
    #[error("Target weights sum to zero")]
    ZeroTotalWeight,
    #[error("Penalty must be finite and >= 0, got {0}")]
    InvalidPenalty(f64),
    #[error("Worst-case fitness must be finite, got {0}")]
    InvalidWorstFitness(f64),
}
