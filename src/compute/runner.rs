//! End-to-end optimization run built from a [`RunConfig`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use super::evaluator::{ConfigurationError, Evaluator, Objective};
use super::evolution::{EvolutionEngine, save_result};
use crate::schema::{EvolutionProgress, EvolutionResult, RunConfig};

/// Errors that prevent a run from starting or its result from being saved.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("cannot start evaluation workers: {0}")]
    Workers(#[from] rayon::ThreadPoolBuildError),
    #[error("cannot save results to {path}: {source}")]
    Export {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// An evaluator wired to the configured search engine.
pub struct Optimizer {
    engine: EvolutionEngine<Evaluator>,
    output_dir: Option<PathBuf>,
}

impl Optimizer {
    /// Validate the configuration and assemble tasks, targets and engine.
    ///
    /// Nothing is executed until [`Optimizer::run`] is called.
    pub fn from_config(config: &RunConfig) -> Result<Self, RunError> {
        let evaluator = Evaluator::from_config(config)?;
        let eval = &config.evaluation;
        log::info!(
            "Fitting {} free of {} parameters against {} targets with {} tasks",
            evaluator.space().free_indices().len(),
            evaluator.space().len(),
            evaluator.targets().targets().len(),
            evaluator.tasks().len(),
        );

        let engine = EvolutionEngine::new(config.evolution.clone(), evaluator)
            .with_failure_policy(eval.failure_policy, eval.worst_fitness)
            .with_workers(eval.parallel_workers)?;

        Ok(Self {
            engine,
            output_dir: config.evolution.output_dir.clone(),
        })
    }

    /// Flag that stops the run after the generation in flight.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.engine.cancel_handle()
    }

    pub fn evaluator(&self) -> &Evaluator {
        self.engine.objective()
    }

    /// Run to completion, then write `result.json` and `best.par` when an
    /// output directory is configured.
    pub fn run_with_callback<F>(&mut self, callback: F) -> Result<EvolutionResult, RunError>
    where
        F: Fn(&EvolutionProgress),
    {
        let result = self.engine.run_with_callback(callback);
        log::info!(
            "Stopped after {} generations ({:?}): best cost {:.6e}",
            result.stats.generations,
            result.stats.stop_reason,
            result.stats.best_fitness,
        );

        if let Some(dir) = &self.output_dir {
            save_result(dir, &result, self.engine.objective().space()).map_err(|source| {
                RunError::Export {
                    path: dir.clone(),
                    source,
                }
            })?;
        }
        Ok(result)
    }

    pub fn run(&mut self) -> Result<EvolutionResult, RunError> {
        self.run_with_callback(|_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::evolution::{BEST_PARAMETER_FILE, RESULT_FILE, load_result};
    use crate::schema::{
        EvaluationConfig, EvolutionConfig, ExtractorConfig, ObjectivesConfig, PopulationConfig,
        ReferenceSource, ReferenceValue, StopReason, TargetSpec, TaskConfig, TemplateConfig,
    };
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn config(root: &std::path::Path) -> RunConfig {
        let templates = root.join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(
            templates.join("template.model.dat"),
            "# rendered model\nvalue = %(x).6f\n",
        )
        .unwrap();

        RunConfig {
            parameters: vec!["x 0.0 -4.0 4.0".to_string(), "label 7".to_string()],
            executables: BTreeMap::new(),
            tasks: vec![TaskConfig {
                name: "model".to_string(),
                command: "true".to_string(),
                subdir: None,
                templates: vec![TemplateConfig {
                    source: PathBuf::from("template.model.dat"),
                    target: None,
                }],
                output: Some(ExtractorConfig {
                    kind: "KeyValue".to_string(),
                    file: Some(PathBuf::from("model.dat")),
                    ..ExtractorConfig::default()
                }),
                timeout_seconds: Some(10.0),
            }],
            objectives: ObjectivesConfig {
                targets: vec![TargetSpec::new("value", 1.0)],
                reference: ReferenceSource::Inline(BTreeMap::from([(
                    "value".to_string(),
                    ReferenceValue::Scalar(1.5),
                )])),
                ..RunConfig::default().objectives
            },
            evaluation: EvaluationConfig {
                workroot: root.join("work"),
                templatedir: Some(templates),
                parallel_workers: 2,
                ..EvaluationConfig::default()
            },
            evolution: EvolutionConfig {
                population: PopulationConfig {
                    size: 6,
                    max_generations: 4,
                    ..PopulationConfig::default()
                },
                random_seed: Some(11),
                output_dir: Some(root.join("out")),
                ..EvolutionConfig::default()
            },
        }
    }

    #[test]
    fn test_run_renders_executes_and_saves() {
        let root = tempdir().unwrap();
        let mut optimizer = Optimizer::from_config(&config(root.path())).unwrap();
        let seen = Mutex::new(Vec::new());
        let result = optimizer
            .run_with_callback(|p| seen.lock().unwrap().push(p.generation))
            .unwrap();

        assert_eq!(result.stats.stop_reason, StopReason::MaxGenerations);
        assert_eq!(result.stats.failed_evaluations, 0);
        assert!(!seen.lock().unwrap().is_empty());
        // The fixed parameter never moves.
        assert_eq!(result.best.parameters[1].value, 7.0);
        assert!(result.best.fitness < 1.5);

        let out = root.path().join("out");
        assert!(out.join(BEST_PARAMETER_FILE).exists());
        let loaded = load_result(out.join(RESULT_FILE)).unwrap();
        assert_eq!(loaded.best.id, result.best.id);
        // Working directories are removed after scoring.
        let left = fs::read_dir(root.path().join("work")).map_or(0, |d| d.count());
        assert_eq!(left, 0);
    }

    #[test]
    fn test_missing_templatedir_is_rejected() {
        let root = tempdir().unwrap();
        let mut config = config(root.path());
        config.evaluation.templatedir = Some(root.path().join("absent"));
        let err = Optimizer::from_config(&config).err().unwrap();
        assert!(matches!(
            err,
            RunError::Configuration(ConfigurationError::TemplateDir(_))
        ));
    }
}
