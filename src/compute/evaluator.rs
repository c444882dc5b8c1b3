//! Evaluation of one parameter vector: workdir, tasks, scoring.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use walkdir::WalkDir;

use super::command::{CommandError, ExecutableRegistry};
use super::query::ObservableMap;
use super::target::{ReferenceKeyError, TargetSet};
use super::task::{Task, TaskConfigError, TaskFailure};
use super::template::{self, TemplateError};
use crate::schema::{ConfigError, ParameterSpace, RunConfig, TargetScore, format_parameter_file};

/// Parameter file written into every working directory.
pub const PARAMETER_FILE: &str = "current.par";

/// Position of an evaluation in the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iteration {
    pub generation: usize,
    pub index: usize,
}

impl fmt::Display for Iteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.index)
    }
}

/// Result of a completed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Cost; lower is better.
    pub fitness: f64,
    pub worst_relative_error: f64,
    pub scores: Vec<TargetScore>,
}

/// A task that could not complete.
#[derive(Debug, thiserror::Error)]
#[error("task '{task}' failed after {attempts} attempt(s): {failure}")]
pub struct EvaluationFailure {
    pub task: String,
    pub failure: TaskFailure,
    pub attempts: usize,
}

/// Anything that maps a parameter vector to a cost.
pub trait Objective: Sync {
    /// Parameters the vectors refer to.
    fn space(&self) -> &ParameterSpace;

    /// Evaluate one vector; must be safe to call concurrently for distinct
    /// iterations.
    fn evaluate(
        &self,
        values: &[f64],
        iteration: Iteration,
        cancel: &AtomicBool,
    ) -> Result<Evaluation, EvaluationFailure>;
}

/// Cost computed in-process from the values alone.
pub struct FunctionObjective<F> {
    space: ParameterSpace,
    function: F,
}

impl<F> FunctionObjective<F>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    pub fn new(space: ParameterSpace, function: F) -> Self {
        Self { space, function }
    }
}

impl<F> Objective for FunctionObjective<F>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    fn space(&self) -> &ParameterSpace {
        &self.space
    }

    fn evaluate(
        &self,
        values: &[f64],
        _iteration: Iteration,
        cancel: &AtomicBool,
    ) -> Result<Evaluation, EvaluationFailure> {
        if cancel.load(Ordering::Relaxed) {
            return Err(EvaluationFailure {
                task: "function".to_string(),
                failure: TaskFailure::Cancelled,
                attempts: 0,
            });
        }
        Ok(Evaluation {
            fitness: (self.function)(values),
            worst_relative_error: 0.0,
            scores: Vec::new(),
        })
    }
}

/// Runs the configured task chain in isolated working directories.
#[derive(Debug)]
pub struct Evaluator {
    space: ParameterSpace,
    tasks: Vec<Task>,
    targets: TargetSet,
    registry: ExecutableRegistry,
    workroot: PathBuf,
    templatedir: Option<PathBuf>,
    keep_workdirs: bool,
    retries: usize,
}

impl Evaluator {
    /// Build from a run configuration. Every configuration fault surfaces here,
    /// before any evaluation.
    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let space = config.parameter_space()?;
        let registry = ExecutableRegistry::from_config(&config.executables)?;
        let reference = config.objectives.reference.load()?;
        let targets = TargetSet::from_config(&config.objectives, &reference)?;

        let eval = &config.evaluation;
        let tasks = config
            .tasks
            .iter()
            .map(|t| Task::from_config(t, eval.timeout_seconds))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(dir) = &eval.templatedir {
            if !dir.is_dir() {
                return Err(ConfigurationError::TemplateDir(dir.clone()));
            }
            for task in &config.tasks {
                let taskdir = match &task.subdir {
                    Some(sub) => dir.join(sub),
                    None => dir.clone(),
                };
                for t in &task.templates {
                    check_template(&taskdir.join(&t.source), &space)?;
                }
            }
        }

        Ok(Self {
            space,
            tasks,
            targets,
            registry,
            workroot: eval.workroot.clone(),
            templatedir: eval.templatedir.clone(),
            keep_workdirs: eval.keep_workdirs,
            retries: eval.retries,
        })
    }

    /// Evaluator over explicit parts, without a templatedir.
    pub fn new(
        space: ParameterSpace,
        tasks: Vec<Task>,
        targets: TargetSet,
        registry: ExecutableRegistry,
        workroot: impl Into<PathBuf>,
    ) -> Self {
        Self {
            space,
            tasks,
            targets,
            registry,
            workroot: workroot.into(),
            templatedir: None,
            keep_workdirs: false,
            retries: 0,
        }
    }

    pub fn with_templatedir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.templatedir = Some(dir.into());
        self
    }

    pub fn with_keep_workdirs(mut self, keep: bool) -> Self {
        self.keep_workdirs = keep;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn targets(&self) -> &TargetSet {
        &self.targets
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Working directory of one evaluation.
    pub fn workdir(&self, iteration: Iteration) -> PathBuf {
        self.workroot.join(iteration.to_string())
    }

    fn prepare_workdir(&self, dir: &Path, values: &[f64], iteration: Iteration) -> io::Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        if let Some(src) = &self.templatedir {
            copy_tree(src, dir)?;
        }
        let header = iteration.to_string();
        fs::write(
            dir.join(PARAMETER_FILE),
            format_parameter_file(&self.space, values, Some(&header)),
        )
    }

    fn run_task(
        &self,
        task: &Task,
        workdir: &Path,
        assignment: &BTreeMap<String, f64>,
        iteration: Iteration,
        cancel: &AtomicBool,
    ) -> Result<ObservableMap, EvaluationFailure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match task.run(workdir, assignment, &self.registry, cancel) {
                Ok(map) => return Ok(map),
                Err(failure) => {
                    let retry = attempt <= self.retries && !matches!(failure, TaskFailure::Cancelled);
                    if !retry {
                        return Err(EvaluationFailure {
                            task: task.name().to_string(),
                            failure,
                            attempts: attempt,
                        });
                    }
                    log::warn!(
                        "Evaluation {iteration}: task '{}' attempt {attempt} failed ({}), retrying",
                        task.name(),
                        failure.kind()
                    );
                    // A retry must not score what the failed attempt left behind.
                    if let Some(output) = task.output_path(workdir)
                        && let Err(e) = fs::remove_file(&output)
                        && e.kind() != io::ErrorKind::NotFound
                    {
                        log::debug!("Could not remove {}: {e}", output.display());
                    }
                }
            }
        }
    }

    fn evaluate_in(
        &self,
        workdir: &Path,
        values: &[f64],
        iteration: Iteration,
        cancel: &AtomicBool,
    ) -> Result<Evaluation, EvaluationFailure> {
        self.prepare_workdir(workdir, values, iteration)
            .map_err(|e| EvaluationFailure {
                task: "workdir".to_string(),
                failure: TaskFailure::Preparation(format!("{}: {e}", workdir.display())),
                attempts: 1,
            })?;

        let assignment: BTreeMap<String, f64> = self
            .space
            .assign(values)
            .map(|(name, v)| (name.to_string(), v))
            .collect();

        let mut observables = ObservableMap::new();
        for task in &self.tasks {
            let map = self.run_task(task, workdir, &assignment, iteration, cancel)?;
            observables.extend(map);
        }

        let score = self.targets.score(&observables);
        Ok(Evaluation {
            fitness: score.fitness,
            worst_relative_error: score.worst_relative_error,
            scores: score.scores,
        })
    }
}

impl Objective for Evaluator {
    fn space(&self) -> &ParameterSpace {
        &self.space
    }

    fn evaluate(
        &self,
        values: &[f64],
        iteration: Iteration,
        cancel: &AtomicBool,
    ) -> Result<Evaluation, EvaluationFailure> {
        let workdir = self.workdir(iteration);
        let result = self.evaluate_in(&workdir, values, iteration, cancel);

        // Partial directories of cancelled runs are never kept.
        if (!self.keep_workdirs || cancel.load(Ordering::Relaxed))
            && let Err(e) = fs::remove_dir_all(&workdir)
        {
            log::debug!("Could not remove {}: {e}", workdir.display());
        }
        result
    }
}

/// Check that every placeholder of a template resolves.
fn check_template(path: &Path, space: &ParameterSpace) -> Result<(), ConfigurationError> {
    let to_error = |source| ConfigurationError::Template {
        path: path.to_path_buf(),
        source,
    };
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        // Templates produced by an earlier task are checked when rendered.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(to_error(TemplateError::Io {
                path: path.to_path_buf(),
                source,
            }));
        }
    };
    for p in template::placeholders(&text).map_err(to_error)? {
        if p.default.is_none() && space.by_name(&p.name).is_none() {
            return Err(to_error(TemplateError::MissingParameter {
                name: p.name,
                line: p.line,
            }));
        }
    }
    Ok(())
}

/// Recursively copy the contents of `src` into `dst`, following symlinks.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).min_depth(1).follow_links(true) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Construction-time failures. None of them are recoverable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Reference(#[from] ReferenceKeyError),
    #[error(transparent)]
    Task(#[from] TaskConfigError),
    #[error("Invalid executable alias: {0}")]
    Command(#[from] CommandError),
    #[error("Template directory {0} does not exist")]
    TemplateDir(PathBuf),
    #[error("Template {path}: {source}")]
    Template { path: PathBuf, source: TemplateError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::command::CommandLine;
    use crate::compute::query::resolve_extractor;
    use crate::compute::target::build_targets;
    use crate::schema::{
        CostFunction, ExtractorConfig, ReferenceData, ReferenceValue, ResidualMethod, TargetSpec,
        TaskConfig, TemplateConfig,
    };
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn space() -> ParameterSpace {
        ParameterSpace::parse(&["r0 3.5 2.5 5.0", "n 4 2 12 i"]).unwrap()
    }

    fn etot_targets() -> TargetSet {
        let reference: ReferenceData = [("Etot".to_string(), ReferenceValue::Scalar(-105.0))].into();
        let targets = build_targets(&reference, &[TargetSpec::new("Etot", 1.0)]).unwrap();
        TargetSet::new(targets, ResidualMethod::Absolute, CostFunction::WeightedSum, 1e3)
    }

    fn sh(name: &str, script: &str) -> Task {
        Task::new(name, CommandLine::parse(&format!("sh -c '{script}'")).unwrap())
    }

    #[test]
    fn test_failing_task_reports_execution_error() {
        let root = tempdir().unwrap();
        let evaluator = Evaluator::new(
            space(),
            vec![sh("crash", "exit 3").with_extractor(
                resolve_extractor(&ExtractorConfig::default()).unwrap(),
            )],
            etot_targets(),
            ExecutableRegistry::new(),
            root.path(),
        );
        let it = Iteration {
            generation: 0,
            index: 2,
        };
        let err = evaluator
            .evaluate(&[3.5, 4.0], it, &AtomicBool::new(false))
            .unwrap_err();
        assert_eq!(err.task, "crash");
        assert_eq!(err.failure.kind(), "ExecutionError");
        assert_eq!(err.attempts, 1);
        assert!(!root.path().join("0-2").exists());
    }

    #[test]
    fn test_retries_are_bounded() {
        let root = tempdir().unwrap();
        let counter = root.path().join("count");
        let script = format!("echo x >> {}; exit 1", counter.display());
        let evaluator = Evaluator::new(
            space(),
            vec![sh("flaky", &script)],
            etot_targets(),
            ExecutableRegistry::new(),
            root.path().join("work"),
        )
        .with_retries(2);
        let it = Iteration {
            generation: 1,
            index: 0,
        };
        let err = evaluator
            .evaluate(&[3.5, 4.0], it, &AtomicBool::new(false))
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_retry_does_not_score_stale_output() {
        let root = tempdir().unwrap();
        // First attempt writes a perfect report and fails; the retry succeeds
        // without writing anything.
        let script = "if [ -f marker ]; then exit 0; else touch marker; \
                      printf \"Total energy: 0 H -105.0 eV\\n\" > detailed.out; exit 1; fi";
        let evaluator = Evaluator::new(
            space(),
            vec![sh("flaky", script).with_extractor(
                resolve_extractor(&ExtractorConfig::default()).unwrap(),
            )],
            etot_targets(),
            ExecutableRegistry::new(),
            root.path().join("work"),
        )
        .with_retries(1);
        let it = Iteration {
            generation: 0,
            index: 0,
        };
        let err = evaluator
            .evaluate(&[3.5, 4.0], it, &AtomicBool::new(false))
            .unwrap_err();
        assert_eq!(err.failure.kind(), "OutputMissing");
        assert_eq!(err.attempts, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_templatedir_symlinked_subdirectory_is_copied() {
        let root = tempdir().unwrap();
        let shared = root.path().join("shared");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("C-C.skf"), "spline\n").unwrap();
        let templates = root.path().join("templates");
        fs::create_dir_all(templates.join("nested")).unwrap();
        fs::write(templates.join("nested").join("geo.gen"), "2 C\n").unwrap();
        std::os::unix::fs::symlink(&shared, templates.join("skf")).unwrap();

        let evaluator = Evaluator::new(
            space(),
            vec![sh("check", "test -f skf/C-C.skf && test -f nested/geo.gen")],
            etot_targets(),
            ExecutableRegistry::new(),
            root.path().join("work"),
        )
        .with_templatedir(&templates)
        .with_keep_workdirs(true);
        let it = Iteration {
            generation: 0,
            index: 1,
        };
        evaluator
            .evaluate(&[3.5, 4.0], it, &AtomicBool::new(false))
            .unwrap();

        let copied = evaluator.workdir(it).join("skf");
        assert!(!fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(copied.join("C-C.skf")).unwrap(), "spline\n");
    }

    #[test]
    fn test_cancelled_evaluation_removes_workdir() {
        let root = tempdir().unwrap();
        let evaluator = Evaluator::new(
            space(),
            vec![sh("slow", "touch started; sleep 5")],
            etot_targets(),
            ExecutableRegistry::new(),
            root.path().join("work"),
        )
        .with_keep_workdirs(true);
        let it = Iteration {
            generation: 2,
            index: 0,
        };
        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let err = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                cancel.store(true, Ordering::Relaxed);
            });
            evaluator.evaluate(&[3.5, 4.0], it, &cancel).unwrap_err()
        });
        assert_eq!(err.failure.kind(), "Cancelled");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!evaluator.workdir(it).exists());
    }

    #[test]
    fn test_successful_evaluation() {
        let root = tempdir().unwrap();
        let templates = root.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(
            templates.join("template.in"),
            "Total energy:  0.0 H  -%(r0).1f eV\nSCC converged\n",
        )
        .unwrap();

        let task = sh("fake", "sed s/-3/-10/ in > detailed.out")
            .with_template(TemplateConfig {
                source: PathBuf::from("template.in"),
                target: None,
            })
            .with_extractor(resolve_extractor(&ExtractorConfig::default()).unwrap());
        let evaluator = Evaluator::new(
            space(),
            vec![task],
            etot_targets(),
            ExecutableRegistry::new(),
            root.path().join("work"),
        )
        .with_templatedir(&templates)
        .with_keep_workdirs(true);

        let it = Iteration {
            generation: 3,
            index: 1,
        };
        let eval = evaluator
            .evaluate(&[3.5, 4.0], it, &AtomicBool::new(false))
            .unwrap();
        // Rendered "-3.5" becomes "-10.5": |(-10.5) - (-105)|
        assert!((eval.fitness - 94.5).abs() < 1e-9);
        assert_eq!(eval.scores[0].items[0].model, Some(-10.5));

        let workdir = root.path().join("work").join("3-1");
        let par = fs::read_to_string(workdir.join(PARAMETER_FILE)).unwrap();
        assert!(par.starts_with("#3-1\n"));
        assert!(par.contains("r0  3.5"));
        assert!(workdir.join("run.log").exists());
    }

    #[test]
    fn test_workdir_purged_before_reuse() {
        let root = tempdir().unwrap();
        let evaluator = Evaluator::new(
            space(),
            vec![sh("check", "test ! -e stale")],
            etot_targets(),
            ExecutableRegistry::new(),
            root.path(),
        )
        .with_keep_workdirs(true);
        let it = Iteration {
            generation: 0,
            index: 0,
        };
        let dir = evaluator.workdir(it);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale"), "old").unwrap();

        let eval = evaluator
            .evaluate(&[3.5, 4.0], it, &AtomicBool::new(false))
            .unwrap();
        // No extractor: the target is unavailable and gets the penalty.
        assert_eq!(eval.fitness, 1e3);
    }

    #[test]
    fn test_from_config() {
        let root = tempdir().unwrap();
        let mut config = RunConfig::default();
        config.evaluation.workroot = root.path().join("work");
        config.evaluation.templatedir = None;
        let evaluator = Evaluator::from_config(&config).unwrap();
        assert_eq!(evaluator.tasks().len(), config.tasks.len());
        assert_eq!(evaluator.space().len(), 3);
        let sum: f64 = evaluator.targets().targets().iter().map(|t| t.weight).sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_config_rejects_bad_setup() {
        let root = tempdir().unwrap();
        let mut config = RunConfig::default();
        config.objectives.targets.push(TargetSpec::new("Egap", 1.0));
        assert!(matches!(
            Evaluator::from_config(&config),
            Err(ConfigurationError::Reference(_))
        ));

        let mut config = RunConfig::default();
        config.evaluation.templatedir = Some(root.path().join("absent"));
        assert!(matches!(
            Evaluator::from_config(&config),
            Err(ConfigurationError::TemplateDir(_))
        ));

        fs::write(root.path().join("template.in"), "x %(unknown)f\n").unwrap();
        let mut config = RunConfig::default();
        config.evaluation.templatedir = Some(root.path().to_path_buf());
        config.tasks = vec![TaskConfig {
            name: "t".to_string(),
            command: "true".to_string(),
            subdir: None,
            templates: vec![TemplateConfig {
                source: PathBuf::from("template.in"),
                target: None,
            }],
            output: None,
            timeout_seconds: None,
        }];
        assert!(matches!(
            Evaluator::from_config(&config),
            Err(ConfigurationError::Template { .. })
        ));
    }

    #[test]
    fn test_unreadable_template_is_rejected() {
        let root = tempdir().unwrap();
        // A directory where a template file is expected cannot be read, but
        // it is not missing either.
        fs::create_dir_all(root.path().join("template.in")).unwrap();
        let mut config = RunConfig::default();
        config.evaluation.workroot = root.path().join("work");
        config.evaluation.templatedir = Some(root.path().to_path_buf());
        config.tasks = vec![TaskConfig {
            name: "t".to_string(),
            command: "true".to_string(),
            subdir: None,
            templates: vec![TemplateConfig {
                source: PathBuf::from("template.in"),
                target: None,
            }],
            output: None,
            timeout_seconds: None,
        }];
        assert!(matches!(
            Evaluator::from_config(&config),
            Err(ConfigurationError::Template {
                source: TemplateError::Io { .. },
                ..
            })
        ));

        config.tasks[0].templates[0].source = PathBuf::from("template.absent");
        assert!(Evaluator::from_config(&config).is_ok());
    }

    #[test]
    fn test_function_objective() {
        let objective = FunctionObjective::new(space(), |v: &[f64]| v[0] + v[1]);
        let it = Iteration {
            generation: 0,
            index: 0,
        };
        let eval = objective
            .evaluate(&[1.0, 2.0], it, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(eval.fitness, 3.0);
        assert!(objective.evaluate(&[1.0, 2.0], it, &AtomicBool::new(true)).is_err());
    }
}
