//! Suite driver - runs an orchestrator's tasks one after another

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::protocol::WorkerStatus;
use crate::reporter::{SuiteEvent, SuiteReporter};
use crate::run::{RunEvent, RunOutcome};
use crate::task::Task;

/// Result of a single task
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Task that was executed
    pub task: Task,
    /// Packages installed for it
    pub install: Vec<String>,
    /// Worker exit code
    pub code: i32,
    /// Whether the task failed
    pub failed: bool,
    /// Execute-phase duration
    pub duration: Duration,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl TaskResult {
    fn new(task: Task, install: Vec<String>, outcome: RunOutcome) -> Self {
        Self {
            task,
            install,
            code: outcome.code,
            failed: outcome.failed,
            duration: outcome.duration,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        }
    }
}

/// Options for driving a suite
#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    /// Stop after the first failed task
    pub bail: bool,
}

/// Summary of a suite run
#[derive(Debug, Clone, Default)]
pub struct SuiteSummary {
    /// Per-task results in execution order
    pub results: Vec<TaskResult>,
    /// Summed execute-phase duration
    pub duration: Duration,
    /// Wall-clock time of the whole suite
    pub elapsed: Duration,
}

impl SuiteSummary {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.failed).count()
    }

    pub fn passed(&self) -> usize {
        self.results.len() - self.failed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Run every remaining task of `orchestrator`. Each worker is allowed to
/// proceed as soon as it reports that installation finished.
pub async fn run_suite(
    orchestrator: &mut Orchestrator,
    options: &SuiteOptions,
    reporter: &dyn SuiteReporter,
) -> Result<SuiteSummary> {
    let start = Instant::now();
    let mut results = Vec::new();

    info!(
        suite = %orchestrator.cwd().display(),
        tasks = orchestrator.remaining(),
        "running suite"
    );

    loop {
        // Probed before dispatch so reporters can show an install indicator
        // while the worker is still starting.
        let needs_install = orchestrator.next_needs_install();
        let Some(mut handle) = orchestrator.run().await? else {
            break;
        };
        let task = handle.task().clone();
        let install = handle.install().to_vec();

        reporter.report(&SuiteEvent::Started {
            task: task.clone(),
            install: install.clone(),
            needs_install,
        });

        let mut outcome = None;
        while let Some(event) = handle.next_event().await {
            match event {
                RunEvent::Status(status) => {
                    if status == WorkerStatus::InstallComplete {
                        if let Err(e) = handle.proceed() {
                            warn!(task = %task, error = %e, "worker exited before it could proceed");
                        }
                    }
                    reporter.report(&SuiteEvent::Status {
                        task: task.clone(),
                        status,
                    });
                }
                RunEvent::Error { code } => {
                    warn!(task = %task, code, "worker terminated abnormally");
                }
                RunEvent::End(end) => outcome = Some(end),
            }
        }

        let outcome = outcome.unwrap_or_else(|| RunOutcome {
            code: -1,
            failed: true,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
        });

        if outcome.failed {
            reporter.report(&SuiteEvent::Failed {
                task: task.clone(),
                duration: outcome.duration,
                code: outcome.code,
                stderr: outcome.stderr.clone(),
            });
        } else {
            reporter.report(&SuiteEvent::Completed {
                task: task.clone(),
                duration: outcome.duration,
            });
        }

        let failed = outcome.failed;
        results.push(TaskResult::new(task, install, outcome));

        if failed && options.bail {
            info!("stopping suite after first failure");
            break;
        }
    }

    let summary = SuiteSummary {
        results,
        duration: orchestrator.duration(),
        elapsed: start.elapsed(),
    };

    reporter.report(&SuiteEvent::SuiteCompleted {
        runs: summary.results.len(),
        failed: summary.failed(),
        duration: summary.elapsed,
    });

    Ok(summary)
}
