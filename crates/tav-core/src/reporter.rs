//! Suite execution reporting

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::protocol::WorkerStatus;
use crate::task::Task;

/// Events emitted while a suite runs
#[derive(Debug, Clone)]
pub enum SuiteEvent {
    /// A worker was spawned for a task
    Started {
        task: Task,
        install: Vec<String>,
        needs_install: bool,
    },
    /// The worker reported a phase status
    Status { task: Task, status: WorkerStatus },
    /// A task passed
    Completed { task: Task, duration: Duration },
    /// A task failed
    Failed {
        task: Task,
        duration: Duration,
        code: i32,
        stderr: String,
    },
    /// Every task of the suite has run
    SuiteCompleted {
        runs: usize,
        failed: usize,
        duration: Duration,
    },
}

/// Trait for reporting suite progress
pub trait SuiteReporter: Send + Sync {
    /// Handle a suite event
    fn report(&self, event: &SuiteEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl SuiteReporter for TracingReporter {
    fn report(&self, event: &SuiteEvent) {
        match event {
            SuiteEvent::Started {
                task,
                install,
                needs_install,
            } => {
                if *needs_install {
                    tracing::info!("Starting {} (installing {})", task, install.join(" "));
                } else {
                    tracing::info!("Starting {}", task);
                }
            }
            SuiteEvent::Status { task, status } => {
                tracing::debug!("[{}] status {}", task, status);
            }
            SuiteEvent::Completed { task, duration } => {
                tracing::info!("{} passed in {:.1}s", task, duration.as_secs_f64());
            }
            SuiteEvent::Failed {
                task,
                duration,
                code,
                ..
            } => {
                tracing::error!(
                    "{} failed with code {} after {:.1}s",
                    task,
                    code,
                    duration.as_secs_f64()
                );
            }
            SuiteEvent::SuiteCompleted {
                runs,
                failed,
                duration,
            } => {
                tracing::info!(
                    "Suite complete: {} runs, {} failed ({:.1}s)",
                    runs,
                    failed,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<SuiteEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<SuiteEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SuiteReporter for CollectingReporter {
    fn report(&self, event: &SuiteEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// Fans events out to several reporters
#[derive(Default)]
pub struct ReporterSet {
    reporters: Vec<Arc<dyn SuiteReporter>>,
}

impl ReporterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn SuiteReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl SuiteReporter for ReporterSet {
    fn report(&self, event: &SuiteEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}
