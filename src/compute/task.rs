//! External program invocation with its own small lifecycle.
//!
//! A [`Task`] is configured once; every evaluation drives a fresh [`TaskRun`]
//! through `Pending -> Prepared -> Running -> Done | Failed`. Program output goes
//! to `run.log` in the task directory.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::command::{CommandError, CommandLine, ExecutableRegistry};
use super::query::{ObservableMap, QueryError, QueryExtractor, resolve_extractor};
use super::template;
use crate::schema::{TaskConfig, TemplateConfig};

/// File receiving stdout and stderr of the program.
pub const RUN_LOG: &str = "run.log";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Prepared,
    Running,
    Done,
    Failed,
}

/// Why a task execution failed.
#[derive(Debug, thiserror::Error)]
pub enum TaskFailure {
    #[error("preparation failed: {0}")]
    Preparation(String),
    #[error("execution error: {0}")]
    ExecutionError(String),
    #[error("execution error: timed out after {0:.1}s")]
    Timeout(f64),
    #[error("cancelled")]
    Cancelled,
    #[error("expected output {0} is missing")]
    OutputMissing(PathBuf),
    #[error("output rejected: {0}")]
    ParseError(String),
}

impl TaskFailure {
    /// Short classification used in logs and result files.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Preparation(_) => "PreparationError",
            Self::ExecutionError(_) | Self::Timeout(_) => "ExecutionError",
            Self::Cancelled => "Cancelled",
            Self::OutputMissing(_) => "OutputMissing",
            Self::ParseError(_) => "ParseError",
        }
    }
}

impl From<QueryError> for TaskFailure {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::OutputMissing(path) => Self::OutputMissing(path),
            other => Self::ParseError(other.to_string()),
        }
    }
}

/// A configured program invocation.
#[derive(Debug)]
pub struct Task {
    name: String,
    command: CommandLine,
    subdir: Option<PathBuf>,
    templates: Vec<TemplateConfig>,
    extractor: Option<Box<dyn QueryExtractor>>,
    timeout: Option<Duration>,
}

impl Task {
    pub fn new(name: impl Into<String>, command: CommandLine) -> Self {
        Self {
            name: name.into(),
            command,
            subdir: None,
            templates: Vec::new(),
            extractor: None,
            timeout: None,
        }
    }

    /// Build a task from configuration; `default_timeout` applies when the
    /// task has none of its own.
    pub fn from_config(
        config: &TaskConfig,
        default_timeout: Option<f64>,
    ) -> Result<Self, TaskConfigError> {
        let command = CommandLine::parse(&config.command).map_err(|source| {
            TaskConfigError::Command {
                task: config.name.clone(),
                source,
            }
        })?;
        let extractor = config
            .output
            .as_ref()
            .map(resolve_extractor)
            .transpose()
            .map_err(|source| TaskConfigError::Extractor {
                task: config.name.clone(),
                source,
            })?;
        let mut task = Self::new(&config.name, command);
        task.subdir = config.subdir.clone();
        task.templates = config.templates.clone();
        task.extractor = extractor;
        task.timeout = config
            .timeout_seconds
            .or(default_timeout)
            .map(Duration::from_secs_f64);
        Ok(task)
    }

    pub fn with_subdir(mut self, subdir: impl Into<PathBuf>) -> Self {
        self.subdir = Some(subdir.into());
        self
    }

    pub fn with_template(mut self, template: TemplateConfig) -> Self {
        self.templates.push(template);
        self
    }

    pub fn with_extractor(mut self, extractor: Box<dyn QueryExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Directory the program runs in.
    pub fn directory(&self, workdir: &Path) -> PathBuf {
        match &self.subdir {
            Some(sub) => workdir.join(sub),
            None => workdir.to_path_buf(),
        }
    }

    /// File the extractor reads, if the task has one.
    pub fn output_path(&self, workdir: &Path) -> Option<PathBuf> {
        self.extractor
            .as_ref()
            .map(|e| self.directory(workdir).join(e.output_file()))
    }

    /// Start a fresh execution rooted at `workdir`.
    pub fn start(&self, workdir: &Path) -> TaskRun<'_> {
        TaskRun {
            task: self,
            dir: self.directory(workdir),
            state: TaskState::Pending,
        }
    }

    /// Prepare, execute and query in one go.
    pub fn run(
        &self,
        workdir: &Path,
        values: &BTreeMap<String, f64>,
        registry: &ExecutableRegistry,
        cancel: &AtomicBool,
    ) -> Result<ObservableMap, TaskFailure> {
        let mut run = self.start(workdir);
        run.prepare(values)?;
        run.execute(registry, cancel)?;
        run.collect()
    }
}

/// One execution of a [`Task`].
#[derive(Debug)]
pub struct TaskRun<'a> {
    task: &'a Task,
    dir: PathBuf,
    state: TaskState,
}

impl TaskRun<'_> {
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn fail(&mut self, failure: TaskFailure) -> TaskFailure {
        log::warn!("Task '{}' failed: {failure}", self.task.name);
        self.state = TaskState::Failed;
        failure
    }

    fn expect_state(&self, expected: TaskState) -> Result<(), TaskFailure> {
        if self.state != expected {
            return Err(TaskFailure::Preparation(format!(
                "task '{}' is {:?}, expected {expected:?}",
                self.task.name, self.state
            )));
        }
        Ok(())
    }

    /// Create the task directory and render templates.
    pub fn prepare(&mut self, values: &BTreeMap<String, f64>) -> Result<(), TaskFailure> {
        self.expect_state(TaskState::Pending)?;
        if let Err(e) = fs::create_dir_all(&self.dir) {
            let failure =
                TaskFailure::Preparation(format!("cannot create {}: {e}", self.dir.display()));
            return Err(self.fail(failure));
        }
        let task = self.task;
        for t in &task.templates {
            let source = self.dir.join(&t.source);
            let target = t.target.as_ref().map(|p| self.dir.join(p));
            if let Err(e) = template::render_file(&source, target.as_deref(), values) {
                return Err(self.fail(TaskFailure::Preparation(e.to_string())));
            }
        }
        self.state = TaskState::Prepared;
        Ok(())
    }

    /// Launch the program and wait for it, honouring timeout and cancellation.
    pub fn execute(
        &mut self,
        registry: &ExecutableRegistry,
        cancel: &AtomicBool,
    ) -> Result<(), TaskFailure> {
        self.expect_state(TaskState::Prepared)?;
        if cancel.load(Ordering::Relaxed) {
            return Err(self.fail(TaskFailure::Cancelled));
        }
        match self.spawn_and_wait(registry, cancel) {
            Ok(()) => {
                self.state = TaskState::Running;
                Ok(())
            }
            Err(failure) => Err(self.fail(failure)),
        }
    }

    fn spawn_and_wait(
        &mut self,
        registry: &ExecutableRegistry,
        cancel: &AtomicBool,
    ) -> Result<(), TaskFailure> {
        let argv = self.task.command.resolve(registry, &self.dir);
        let Some((program, args)) = argv.split_first() else {
            return Err(TaskFailure::ExecutionError("empty command".to_string()));
        };
        log::debug!(
            "Task '{}': running {:?} in {}",
            self.task.name,
            argv,
            self.dir.display()
        );

        let log_path = self.dir.join(RUN_LOG);
        let stdout = File::create(&log_path).map_err(|e| {
            TaskFailure::ExecutionError(format!("cannot create {}: {e}", log_path.display()))
        })?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| TaskFailure::ExecutionError(format!("cannot share log handle: {e}")))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| TaskFailure::ExecutionError(format!("cannot launch '{program}': {e}")))?;
        self.state = TaskState::Running;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TaskFailure::ExecutionError(format!(
                        "waiting for '{program}' failed: {e}"
                    )));
                }
            }
            if let Some(limit) = self.task.timeout
                && started.elapsed() >= limit
            {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TaskFailure::Timeout(limit.as_secs_f64()));
            }
            if cancel.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TaskFailure::Cancelled);
            }
            thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            return Err(TaskFailure::ExecutionError(format!(
                "'{program}' exited with {status}; see {}",
                log_path.display()
            )));
        }
        Ok(())
    }

    /// Query the output; tasks without an extractor yield no observables.
    pub fn collect(&mut self) -> Result<ObservableMap, TaskFailure> {
        self.expect_state(TaskState::Running)?;
        let task = self.task;
        let observables = match &task.extractor {
            Some(extractor) => match extractor.extract(&self.dir) {
                Ok(map) => map,
                Err(e) => return Err(self.fail(e.into())),
            },
            None => ObservableMap::new(),
        };
        self.state = TaskState::Done;
        log::debug!(
            "Task '{}' done with {} observables",
            self.task.name,
            observables.len()
        );
        Ok(observables)
    }
}

/// Errors turning a task configuration into a [`Task`].
#[derive(Debug, thiserror::Error)]
pub enum TaskConfigError {
    #[error("Task '{task}': {source}")]
    Command { task: String, source: CommandError },
    #[error("Task '{task}': {source}")]
    Extractor { task: String, source: QueryError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ExtractorConfig;
    use tempfile::tempdir;

    fn shell_task(name: &str, script: &str) -> Task {
        let command = CommandLine::parse(&format!("sh -c '{script}'")).unwrap();
        Task::new(name, command)
    }

    fn run(task: &Task, dir: &Path) -> Result<ObservableMap, TaskFailure> {
        task.run(
            dir,
            &BTreeMap::new(),
            &ExecutableRegistry::new(),
            &AtomicBool::new(false),
        )
    }

    #[test]
    fn test_nonzero_exit_is_execution_error() {
        let dir = tempdir().unwrap();
        let task = shell_task("fails", "echo boom >&2; exit 1");
        let mut exec = task.start(dir.path());
        exec.prepare(&BTreeMap::new()).unwrap();
        assert_eq!(exec.state(), TaskState::Prepared);
        let err = exec
            .execute(&ExecutableRegistry::new(), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, TaskFailure::ExecutionError(_)));
        assert_eq!(err.kind(), "ExecutionError");
        assert_eq!(exec.state(), TaskState::Failed);

        let log = fs::read_to_string(dir.path().join(RUN_LOG)).unwrap();
        assert!(log.contains("boom"));
    }

    #[test]
    fn test_missing_program() {
        let dir = tempdir().unwrap();
        let task = Task::new("ghost", CommandLine::parse("no-such-program-xyz").unwrap());
        assert!(matches!(
            run(&task, dir.path()),
            Err(TaskFailure::ExecutionError(_))
        ));
    }

    #[test]
    fn test_timeout_kills_program() {
        let dir = tempdir().unwrap();
        let task = shell_task("slow", "sleep 5").with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = run(&task, dir.path()).unwrap_err();
        assert!(matches!(err, TaskFailure::Timeout(_)));
        assert_eq!(err.kind(), "ExecutionError");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_cancel_before_launch() {
        let dir = tempdir().unwrap();
        let task = shell_task("never", "exit 0");
        let err = task
            .run(
                dir.path(),
                &BTreeMap::new(),
                &ExecutableRegistry::new(),
                &AtomicBool::new(true),
            )
            .unwrap_err();
        assert!(matches!(err, TaskFailure::Cancelled));
    }

    #[test]
    fn test_cancel_kills_running_program() {
        let dir = tempdir().unwrap();
        let task = shell_task("slow", "sleep 5");
        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let err = thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                cancel.store(true, Ordering::Relaxed);
            });
            task.run(
                dir.path(),
                &BTreeMap::new(),
                &ExecutableRegistry::new(),
                &cancel,
            )
            .unwrap_err()
        });
        assert!(matches!(err, TaskFailure::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_output_missing_and_success() {
        let dir = tempdir().unwrap();
        let quiet = shell_task("quiet", "exit 0")
            .with_extractor(resolve_extractor(&ExtractorConfig::default()).unwrap());
        assert!(matches!(
            run(&quiet, dir.path()),
            Err(TaskFailure::OutputMissing(_))
        ));

        let writer = shell_task(
            "writer",
            "printf \"Total energy:  -1.0 H  -27.2114 eV\\nSCC converged\\n\" > detailed.out",
        )
        .with_subdir("calc")
        .with_extractor(resolve_extractor(&ExtractorConfig::default()).unwrap());
        let map = run(&writer, dir.path()).unwrap();
        assert_eq!(map["Etot"], -27.2114);
        assert!(dir.path().join("calc").join(RUN_LOG).exists());
    }

    #[test]
    fn test_garbage_output_is_parse_error() {
        let dir = tempdir().unwrap();
        let task = shell_task("garbage", "echo hello > detailed.out")
            .with_extractor(resolve_extractor(&ExtractorConfig::default()).unwrap());
        let err = run(&task, dir.path()).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }

    #[test]
    fn test_templates_rendered_before_launch() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("template.input"), "radius %(r0).2f\n").unwrap();
        let task = shell_task("cat", "cat input > echo.txt").with_template(TemplateConfig {
            source: PathBuf::from("template.input"),
            target: None,
        });
        let values: BTreeMap<String, f64> = [("r0".to_string(), 3.14159)].into();
        task.run(
            dir.path(),
            &values,
            &ExecutableRegistry::new(),
            &AtomicBool::new(false),
        )
        .unwrap();
        let echoed = fs::read_to_string(dir.path().join("echo.txt")).unwrap();
        assert_eq!(echoed, "radius 3.14\n");
    }

    #[test]
    fn test_missing_template_parameter_fails_preparation() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("template.input"), "radius %(r0)f\n").unwrap();
        let task = shell_task("cat", "exit 0").with_template(TemplateConfig {
            source: PathBuf::from("template.input"),
            target: None,
        });
        let err = run(&task, dir.path()).unwrap_err();
        assert_eq!(err.kind(), "PreparationError");
    }

    #[test]
    fn test_from_config_timeout_precedence() {
        let mut config = TaskConfig {
            name: "dftb".to_string(),
            command: "dftb".to_string(),
            subdir: None,
            templates: Vec::new(),
            output: None,
            timeout_seconds: None,
        };
        let task = Task::from_config(&config, Some(30.0)).unwrap();
        assert_eq!(task.timeout(), Some(Duration::from_secs(30)));

        config.timeout_seconds = Some(2.5);
        let task = Task::from_config(&config, Some(30.0)).unwrap();
        assert_eq!(task.timeout(), Some(Duration::from_millis(2500)));

        config.command = "'unterminated".to_string();
        assert!(matches!(
            Task::from_config(&config, None),
            Err(TaskConfigError::Command { .. })
        ));
    }
}
