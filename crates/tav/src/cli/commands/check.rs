//! Check command

use clap::Args;
use console::style;
use tracing::info;

use super::{InvalidSuites, SuiteArgs};
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Validate suite configuration and the version set
#[derive(Debug, Args)]
pub struct CheckCommand {
    #[command(flatten)]
    pub suite: SuiteArgs,
}

/// Findings for one suite directory
#[derive(Debug, Default, serde::Serialize)]
struct SuiteCheck {
    suite: String,
    config_path: Option<String>,
    tasks: usize,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl CheckCommand {
    /// Execute the check command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        info!(
            suites = self.suite.suites.len(),
            strict = self.suite.strict,
            "executing check command"
        );

        let mut errors: Vec<String> = Vec::new();
        let mut checks: Vec<SuiteCheck> = Vec::new();

        match self.suite.version_set() {
            Ok(versions) => {
                for dir in &self.suite.suites {
                    let mut check = SuiteCheck {
                        suite: dir.to_string_lossy().to_string(),
                        ..Default::default()
                    };

                    match self.suite.load_suite(dir, &versions) {
                        Ok(loaded) => {
                            check.config_path = loaded
                                .config_path
                                .as_ref()
                                .map(|p| p.to_string_lossy().to_string());
                            check.tasks = loaded.orchestrator.total();

                            if loaded.config_path.is_none() {
                                check.warnings.push("No config file found".to_string());
                            } else if loaded.orchestrator.tests().is_empty() {
                                check.warnings.push("No tests declared".to_string());
                            }
                            for file in loaded.orchestrator.untracked() {
                                check
                                    .warnings
                                    .push(format!("{} is not covered by any declared test", file));
                            }
                        }
                        Err(e) => check.errors.push(format!("{:#}", e)),
                    }

                    checks.push(check);
                }
            }
            Err(e) => errors.push(format!("{:#}", e)),
        }

        let error_count = errors.len() + checks.iter().map(|c| c.errors.len()).sum::<usize>();
        let passed = error_count == 0;

        match cli.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "valid": passed,
                    "versions": self.suite.versions.to_string_lossy(),
                    "errors": errors,
                    "suites": checks,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Text => {
                if !cli.quiet {
                    println!("{}", output::header("Check Results"));
                    println!();

                    for error in &errors {
                        println!("  {} {}", style("✗").red(), error);
                    }

                    for check in &checks {
                        println!(
                            "{} ({} tasks)",
                            output::path_style().apply_to(&check.suite),
                            check.tasks
                        );
                        if let Some(path) = &check.config_path {
                            println!("{}", output::key_value("config", path));
                        }
                        for error in &check.errors {
                            println!("  {} {}", style("✗").red(), error);
                        }
                        for warning in &check.warnings {
                            println!("  {} {}", style("!").yellow(), warning);
                        }
                        println!();
                    }

                    let warning_count: usize = checks.iter().map(|c| c.warnings.len()).sum();
                    if passed {
                        if warning_count == 0 {
                            output::success("All checks passed");
                        } else {
                            output::success(&format!(
                                "Check passed with {} warning(s)",
                                warning_count
                            ));
                        }
                    }
                }
            }
        }

        if !passed {
            return Err(InvalidSuites(error_count).into());
        }

        Ok(())
    }
}
