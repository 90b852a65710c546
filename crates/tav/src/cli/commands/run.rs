//! Run command

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use tav_core::reporter::ReporterSet;
use tav_core::{
    run_suite, SuiteEvent, SuiteOptions, SuiteReporter, SuiteSummary, TracingReporter,
    WorkerStatus,
};

use super::{relative_to, SuiteArgs, TasksFailed};
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Run every task of the version matrix
#[derive(Debug, Args)]
pub struct RunCommand {
    #[command(flatten)]
    pub suite: SuiteArgs,

    /// Skip the first N tasks of each suite (resume an interrupted run)
    #[arg(long, default_value_t = 0)]
    pub skip: usize,

    /// Stop at the first failed task
    #[arg(long)]
    pub bail: bool,
}

impl RunCommand {
    /// Execute the run command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(
            suites = self.suite.suites.len(),
            skip = self.skip,
            bail = self.bail,
            "executing run command"
        );

        let mut suites = self.suite.load_suites()?;
        let options = SuiteOptions { bail: self.bail };
        let rt = tokio::runtime::Runtime::new()?;

        let mut summaries: Vec<(PathBuf, SuiteSummary)> = Vec::new();
        for suite in &mut suites {
            let orchestrator = &mut suite.orchestrator;
            if self.skip > 0 {
                orchestrator.seek(self.skip);
            }

            if cli.format == OutputFormat::Text && !cli.quiet {
                for file in orchestrator.untracked() {
                    output::warning(&format!("{} is not covered by any declared test", file));
                }
                println!(
                    "{} {} ({} of {} tasks)",
                    output::header("Suite"),
                    output::path_style().apply_to(suite.dir.display()),
                    orchestrator.remaining(),
                    orchestrator.total()
                );
            }

            let reporter = self.reporter(cli, &suite.dir);
            let summary = rt.block_on(run_suite(orchestrator, &options, &reporter))?;
            let stop = self.bail && !summary.is_success();
            summaries.push((suite.dir.clone(), summary));

            if stop {
                break;
            }
        }

        match cli.format {
            OutputFormat::Json => print_json(&summaries)?,
            OutputFormat::Text => {
                if !cli.quiet {
                    print_text(&summaries);
                }
            }
        }

        let failed: usize = summaries.iter().map(|(_, s)| s.failed()).sum();
        if failed > 0 {
            return Err(TasksFailed(failed).into());
        }

        Ok(())
    }

    fn reporter(&self, cli: &Cli, dir: &Path) -> ReporterSet {
        let reporters = ReporterSet::new().with(Arc::new(TracingReporter));
        match cli.format {
            OutputFormat::Json => reporters,
            OutputFormat::Text => reporters.with(Arc::new(ConsoleReporter::new(
                dir,
                cli.verbose,
                cli.quiet,
            ))),
        }
    }
}

fn print_text(summaries: &[(PathBuf, SuiteSummary)]) {
    let runs: usize = summaries.iter().map(|(_, s)| s.results.len()).sum();
    let failed: usize = summaries.iter().map(|(_, s)| s.failed()).sum();
    let elapsed: Duration = summaries.iter().map(|(_, s)| s.elapsed).sum();

    println!();
    if failed == 0 {
        output::success(&format!(
            "{} task(s) passed in {}",
            runs,
            output::seconds(elapsed)
        ));
    } else {
        output::error(&format!(
            "{} of {} task(s) failed in {}",
            failed,
            runs,
            output::seconds(elapsed)
        ));
        for (dir, summary) in summaries {
            for result in summary.results.iter().filter(|r| r.failed) {
                println!(
                    "  {} {} {}",
                    style("✗").red(),
                    relative_to(&result.task.test, dir),
                    output::package_style().apply_to(result.task.install_specs().join(" "))
                );
            }
        }
    }
}

fn print_json(summaries: &[(PathBuf, SuiteSummary)]) -> anyhow::Result<()> {
    let suites: Vec<serde_json::Value> = summaries
        .iter()
        .map(|(dir, summary)| {
            let results: Vec<serde_json::Value> = summary
                .results
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "test": relative_to(&r.task.test, dir),
                        "packages": r.task.packages,
                        "install": r.install,
                        "code": r.code,
                        "failed": r.failed,
                        "duration_ms": r.duration.as_millis() as u64,
                        "stdout": r.stdout,
                        "stderr": r.stderr,
                    })
                })
                .collect();

            serde_json::json!({
                "suite": dir.to_string_lossy(),
                "runs": summary.results.len(),
                "passed": summary.passed(),
                "failed": summary.failed(),
                "duration_ms": summary.duration.as_millis() as u64,
                "elapsed_ms": summary.elapsed.as_millis() as u64,
                "results": results,
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&suites)?);
    Ok(())
}

/// Console reporter with colored output and an install spinner
struct ConsoleReporter {
    dir: PathBuf,
    verbose: bool,
    quiet: bool,
    spinner: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    fn new(dir: &Path, verbose: bool, quiet: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            verbose,
            quiet,
            spinner: Mutex::new(None),
        }
    }

    fn start_spinner(&self, message: String) {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.blue} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(message);
        spinner.enable_steady_tick(Duration::from_millis(100));

        let mut slot = self.spinner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(spinner) {
            previous.finish_and_clear();
        }
    }

    fn stop_spinner(&self) {
        let mut slot = self.spinner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(spinner) = slot.take() {
            spinner.finish_and_clear();
        }
    }

    fn label(&self, task: &tav_core::Task) -> String {
        let test = relative_to(&task.test, &self.dir);
        if task.packages.is_empty() {
            test.into_owned()
        } else {
            format!(
                "{} {}",
                test,
                output::package_style().apply_to(task.install_specs().join(" "))
            )
        }
    }
}

impl SuiteReporter for ConsoleReporter {
    fn report(&self, event: &SuiteEvent) {
        if self.quiet {
            if let SuiteEvent::Failed { task, code, .. } = event {
                self.stop_spinner();
                output::error(&format!("{} (exit code {})", self.label(task), code));
            }
            return;
        }

        match event {
            SuiteEvent::Started {
                task,
                install,
                needs_install,
            } => {
                if *needs_install {
                    self.start_spinner(format!(
                        "Installing {}",
                        output::package_style().apply_to(install.join(" "))
                    ));
                } else if self.verbose {
                    output::info(&format!("Running {}", self.label(task)));
                }
            }
            SuiteEvent::Status { task, status } => {
                if *status == WorkerStatus::InstallComplete {
                    self.stop_spinner();
                    if self.verbose {
                        output::info(&format!("Running {}", self.label(task)));
                    }
                }
            }
            SuiteEvent::Completed { task, duration } => {
                self.stop_spinner();
                println!(
                    "{} {} {}",
                    style("✓").green(),
                    self.label(task),
                    style(format!("({})", output::seconds(*duration))).dim()
                );
            }
            SuiteEvent::Failed {
                task,
                duration,
                code,
                stderr,
            } => {
                self.stop_spinner();
                println!(
                    "{} {} {} {}",
                    style("✗").red(),
                    self.label(task),
                    style(format!("exit code {}", code)).red(),
                    style(format!("({})", output::seconds(*duration))).dim()
                );
                for line in stderr.lines() {
                    println!("    {}", style(line).dim());
                }
            }
            SuiteEvent::SuiteCompleted {
                runs,
                failed,
                duration,
            } => {
                self.stop_spinner();
                if self.verbose {
                    output::info(&format!(
                        "{} run(s), {} failed in {}",
                        runs,
                        failed,
                        output::seconds(*duration)
                    ));
                }
            }
        }
    }
}
