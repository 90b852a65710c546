//! tav - Run a test suite against every version of its dependencies

mod cli;
mod exit_codes;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cli::Cli;

fn main() -> ExitCode {
    let _guard = init_tracing();

    let cli = Cli::parse();
    match cli.execute() {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS),
        Err(e) => {
            cli::output::error(&format!("{:#}", e));
            ExitCode::from(exit_codes::for_error(&e))
        }
    }
}

/// Route orchestrator and worker logs. Stderr shows `RUST_LOG` (default
/// `warn`) so task output stays readable. A daily JSON file under the log
/// directory keeps every debug event of a matrix run.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    if let Some(log_dir) = log_directory() {
        let file_appender = tracing_appender::rolling::daily(&log_dir, "tav.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_filter(EnvFilter::new("debug")),
            )
            .init();

        return Some(guard);
    }

    // No home directory, so stderr only
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    None
}

/// `~/.tav/logs`, created on first use
fn log_directory() -> Option<PathBuf> {
    log_directory_in(&dirs::home_dir()?)
}

fn log_directory_in(home: &Path) -> Option<PathBuf> {
    let log_dir = home.join(".tav").join("logs");
    std::fs::create_dir_all(&log_dir).ok()?;
    Some(log_dir)
}
