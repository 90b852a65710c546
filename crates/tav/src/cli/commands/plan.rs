//! Plan command

use clap::Args;
use console::style;
use tracing::info;

use tav_core::{package_diff, Orchestrator, Task};

use super::{relative_to, LoadedSuite, SuiteArgs};
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Print the task plan without running anything
#[derive(Debug, Args)]
pub struct PlanCommand {
    #[command(flatten)]
    pub suite: SuiteArgs,
}

/// One planned task
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlannedTask {
    position: usize,
    task: Task,
    install: Vec<String>,
}

/// Drain an orchestrator's matrix, computing what each dispatch would install
fn plan(orchestrator: &mut Orchestrator) -> Vec<PlannedTask> {
    let all_pkgs = orchestrator.options().all_pkgs;
    let mut previous: Option<Task> = None;
    let mut planned = Vec::new();

    while let Some(task) = orchestrator.next() {
        let install = if all_pkgs {
            task.install_specs()
        } else {
            package_diff(previous.as_ref(), &task)
        };
        planned.push(PlannedTask {
            position: planned.len(),
            task: task.clone(),
            install,
        });
        previous = Some(task);
    }

    planned
}

impl PlanCommand {
    /// Execute the plan command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(suites = self.suite.suites.len(), "executing plan command");

        let mut suites = self.suite.load_suites()?;
        let planned: Vec<Vec<PlannedTask>> = suites
            .iter_mut()
            .map(|suite| plan(&mut suite.orchestrator))
            .collect();
        let plans: Vec<(&LoadedSuite, Vec<PlannedTask>)> =
            suites.iter().zip(planned).collect();

        match cli.format {
            OutputFormat::Json => {
                let output: Vec<serde_json::Value> = plans
                    .iter()
                    .map(|(suite, planned)| {
                        let tasks: Vec<serde_json::Value> = planned
                            .iter()
                            .map(|p| {
                                serde_json::json!({
                                    "position": p.position,
                                    "test": relative_to(&p.task.test, &suite.dir),
                                    "packages": p.task.packages,
                                    "install": p.install,
                                })
                            })
                            .collect();

                        serde_json::json!({
                            "suite": suite.dir.to_string_lossy(),
                            "config_path": suite.config_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                            "total": planned.len(),
                            "untracked": suite.orchestrator.untracked(),
                            "tasks": tasks,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Text => {
                for (suite, planned) in &plans {
                    println!(
                        "{} {} ({} tasks)",
                        output::header("Suite"),
                        output::path_style().apply_to(suite.dir.display()),
                        planned.len()
                    );

                    if !cli.quiet {
                        for p in planned {
                            let install = if p.install.is_empty() {
                                style("(no install)".to_string()).dim().to_string()
                            } else {
                                output::package_style()
                                    .apply_to(format!("install {}", p.install.join(" ")))
                                    .to_string()
                            };
                            println!(
                                "  {:>4}  {}  {}",
                                style(p.position).dim(),
                                relative_to(&p.task.test, &suite.dir),
                                install
                            );
                        }
                    }

                    for file in suite.orchestrator.untracked() {
                        output::warning(&format!(
                            "{} is not covered by any declared test",
                            file
                        ));
                    }
                    println!();
                }
            }
        }

        Ok(())
    }
}
