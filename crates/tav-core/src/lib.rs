//! tav core - Version-matrix test orchestration
//!
//! This crate enumerates (test file, dependency versions) tasks for a test
//! suite, runs each task in an isolated worker process with only the changed
//! packages installed, and collects pass/fail, output and timing.

pub mod config;
pub mod discovery;
pub mod error;
pub mod matrix;
pub mod orchestrator;
pub mod protocol;
pub mod reporter;
pub mod run;
pub mod suite;
pub mod task;

pub use error::{Result, TavError};
pub use matrix::{sample_versions, VersionMatrix};
pub use orchestrator::{Orchestrator, OrchestratorOptions};
pub use protocol::{ControlCommand, WorkerStatus};
pub use reporter::{CollectingReporter, SuiteEvent, SuiteReporter, TracingReporter};
pub use run::{Dispatch, RunEvent, RunHandle, RunOutcome};
pub use suite::{run_suite, SuiteOptions, SuiteSummary, TaskResult};
pub use task::{package_diff, DeclaredTest, Task, VersionSet};
