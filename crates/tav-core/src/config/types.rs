//! Configuration types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::DeclaredTest;

use super::defaults::DEFAULT_WORKER_PROGRAM;

/// Configuration of one test suite directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteConfig {
    /// Declared tests, in execution order
    pub tests: Vec<DeclaredTest>,

    /// Runner settings
    pub runner: RunnerConfig,
}

/// Runner settings for a suite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Install every required package on every run instead of the delta
    pub all_pkgs: bool,

    /// Substring filters on declared test files
    pub test_patterns: Vec<String>,

    /// Maximum versions sampled per dependency
    pub samples: Option<usize>,

    /// Treat untracked test files as an error
    pub strict: bool,

    /// Module format tag passed to the worker
    pub module_format: ModuleFormat,

    /// Worker process
    pub worker: WorkerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            all_pkgs: false,
            test_patterns: Vec::new(),
            samples: None,
            strict: false,
            module_format: ModuleFormat::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Module format of the code under test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    #[default]
    CommonJs,
    Module,
}

impl ModuleFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommonJs => "commonjs",
            Self::Module => "module",
        }
    }
}

impl fmt::Display for ModuleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker program and its leading arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program to execute
    pub program: String,

    /// Arguments placed before the test file and install list
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_WORKER_PROGRAM.to_string(),
            args: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}
