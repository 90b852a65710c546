//! CLI commands

mod check;
mod plan;
mod run;

pub use check::CheckCommand;
pub use plan::PlanCommand;
pub use run::RunCommand;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;
use tracing::info;

use tav_core::config::{load_suite_config, load_version_set, ModuleFormat, RunnerConfig};
use tav_core::{Orchestrator, OrchestratorOptions, VersionSet};

/// Returned when at least one task failed
#[derive(Debug, thiserror::Error)]
#[error("{0} task(s) failed")]
pub struct TasksFailed(pub usize);

/// Returned when `check` finds invalid suites
#[derive(Debug, thiserror::Error)]
#[error("check failed with {0} error(s)")]
pub struct InvalidSuites(pub usize);

/// Module format accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModuleFormatArg {
    /// CommonJS modules
    Commonjs,
    /// ECMAScript modules
    Module,
}

impl From<ModuleFormatArg> for ModuleFormat {
    fn from(arg: ModuleFormatArg) -> Self {
        match arg {
            ModuleFormatArg::Commonjs => ModuleFormat::CommonJs,
            ModuleFormatArg::Module => ModuleFormat::Module,
        }
    }
}

/// Suite selection and runner overrides shared by every command
#[derive(Debug, Args)]
pub struct SuiteArgs {
    /// Test suite directories
    #[arg(default_value = ".")]
    pub suites: Vec<PathBuf>,

    /// Version set file mapping package names to their versions
    #[arg(long, env = "TAV_VERSIONS")]
    pub versions: PathBuf,

    /// Install every package on every run instead of only the changes
    #[arg(long)]
    pub all_pkgs: bool,

    /// Only use test files whose name contains this text (repeatable)
    #[arg(long = "pattern", value_name = "PATTERN")]
    pub patterns: Vec<String>,

    /// Limit each package to this many versions
    #[arg(long)]
    pub samples: Option<usize>,

    /// Fail when the suite has test files no declaration covers
    #[arg(long)]
    pub strict: bool,

    /// Module format of the code under test
    #[arg(long, value_enum)]
    pub module_format: Option<ModuleFormatArg>,

    /// Worker program
    #[arg(long)]
    pub worker: Option<String>,

    /// Argument passed to the worker before the task (repeatable)
    #[arg(long = "worker-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,
}

/// A suite directory with its configuration and orchestrator
#[derive(Debug)]
pub struct LoadedSuite {
    pub dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub orchestrator: Orchestrator,
}

impl SuiteArgs {
    /// Apply command-line overrides on top of a suite's runner config
    pub fn runner_config(&self, base: &RunnerConfig) -> RunnerConfig {
        let mut runner = base.clone();

        runner.all_pkgs |= self.all_pkgs;
        runner.strict |= self.strict;

        if !self.patterns.is_empty() {
            runner.test_patterns = self.patterns.clone();
        }
        if self.samples.is_some() {
            runner.samples = self.samples;
        }
        if let Some(format) = self.module_format {
            runner.module_format = format.into();
        }
        if let Some(program) = &self.worker {
            runner.worker.program = program.clone();
            runner.worker.args.clear();
        }
        if !self.worker_args.is_empty() {
            runner.worker.args = self.worker_args.clone();
        }

        runner
    }

    /// Load the version set
    pub fn version_set(&self) -> anyhow::Result<VersionSet> {
        let versions = load_version_set(&self.versions)
            .with_context(|| format!("loading version set {}", self.versions.display()))?;
        Ok(versions)
    }

    /// Load every suite and build its orchestrator
    pub fn load_suites(&self) -> anyhow::Result<Vec<LoadedSuite>> {
        let versions = self.version_set()?;

        self.suites
            .iter()
            .map(|suite| self.load_suite(suite, &versions))
            .collect()
    }

    fn load_suite(&self, suite: &Path, versions: &VersionSet) -> anyhow::Result<LoadedSuite> {
        let dir = suite
            .canonicalize()
            .with_context(|| format!("suite directory {}", suite.display()))?;

        let (config, config_path) = load_suite_config(&dir)?;
        let runner = self.runner_config(&config.runner);

        info!(
            dir = %dir.display(),
            tests = config.tests.len(),
            strict = runner.strict,
            "loading suite"
        );

        let orchestrator =
            Orchestrator::new(&dir, versions, &config.tests, OrchestratorOptions::from(&runner))?;

        Ok(LoadedSuite {
            dir,
            config_path,
            orchestrator,
        })
    }
}

/// Render a path relative to the suite directory when possible
pub fn relative_to<'a>(path: &'a Path, dir: &Path) -> std::borrow::Cow<'a, str> {
    path.strip_prefix(dir).unwrap_or(path).to_string_lossy()
}
