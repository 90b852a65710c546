//! Test orchestrator - owns one suite directory and dispatches its tasks
//!
//! The suite directory's installed packages are shared mutable state, so at
//! most one worker runs per orchestrator. The `active` flag in the run ledger
//! enforces that; it is raised by [`Orchestrator::run`] and cleared by the
//! run's driver when the worker exits.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::{ModuleFormat, RunnerConfig, WorkerConfig};
use crate::discovery::untracked_test_files;
use crate::error::{ConfigError, OrchestratorError, Result};
use crate::matrix::VersionMatrix;
use crate::protocol::{read_frame, HelloMessage, IPC_ADDR_ENV, IPC_TOKEN_ENV, MODULE_FORMAT_ENV};
use crate::run::{Dispatch, ExitHook, RunHandle, RunOutcome};
use crate::task::{filter_tests, package_diff, DeclaredTest, Task, VersionSet};

/// How long a new control connection has to present the run token
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for an orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Install every package on every run instead of the delta
    pub all_pkgs: bool,
    /// Substring filters on declared test files
    pub test_patterns: Vec<String>,
    /// Sample bound forwarded to the matrix
    pub global_samples: Option<usize>,
    /// Fail construction when untracked test files exist
    pub strict: bool,
    /// Module format tag for the worker environment
    pub module_format: ModuleFormat,
    /// Worker process
    pub worker: WorkerConfig,
}

impl OrchestratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_all_pkgs(mut self, all_pkgs: bool) -> Self {
        self.all_pkgs = all_pkgs;
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.test_patterns = patterns;
        self
    }

    pub fn with_samples(mut self, samples: Option<usize>) -> Self {
        self.global_samples = samples;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_module_format(mut self, format: ModuleFormat) -> Self {
        self.module_format = format;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

impl From<&RunnerConfig> for OrchestratorOptions {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            all_pkgs: config.all_pkgs,
            test_patterns: config.test_patterns.clone(),
            global_samples: config.samples,
            strict: config.strict,
            module_format: config.module_format,
            worker: config.worker.clone(),
        }
    }
}

/// Bookkeeping shared with the active run's driver
#[derive(Debug, Default)]
struct RunLedger {
    active: bool,
    failed: bool,
    duration: Duration,
    stdout: String,
    stderr: String,
}

impl RunLedger {
    fn record(&mut self, outcome: &RunOutcome) {
        self.active = false;
        self.failed = outcome.failed;
        self.duration += outcome.duration;
        self.stdout = outcome.stdout.clone();
        self.stderr = outcome.stderr.clone();
    }
}

/// Orchestrates the version matrix of one test suite directory
#[derive(Debug)]
pub struct Orchestrator {
    cwd: PathBuf,
    options: OrchestratorOptions,
    tests: Vec<DeclaredTest>,
    matrix: VersionMatrix,
    untracked: Vec<String>,
    runs: usize,
    current_run: Option<Task>,
    previous_run: Option<Task>,
    ledger: Arc<Mutex<RunLedger>>,
}

impl Orchestrator {
    /// Create an orchestrator for `cwd`. `tests` are the suite's declared
    /// tests before pattern filtering.
    #[instrument(skip_all, fields(cwd = %cwd.as_ref().display(), tests = tests.len()))]
    pub fn new(
        cwd: impl AsRef<Path>,
        versions: &VersionSet,
        tests: &[DeclaredTest],
        options: OrchestratorOptions,
    ) -> Result<Self> {
        let cwd = cwd.as_ref().to_path_buf();
        let untracked = untracked_test_files(&cwd, tests);

        if !untracked.is_empty() {
            if options.strict {
                return Err(ConfigError::UntrackedTests {
                    dir: cwd,
                    files: untracked,
                }
                .into());
            }
            warn!(files = ?untracked, "test files not referenced by any declared test");
        }

        let tests = filter_tests(tests, &options.test_patterns);
        let matrix = VersionMatrix::new(&tests, versions, options.global_samples)?;

        info!(
            declared = tests.len(),
            tasks = matrix.len(),
            all_pkgs = options.all_pkgs,
            "orchestrator ready"
        );

        Ok(Self {
            cwd,
            options,
            tests,
            matrix,
            untracked,
            runs: 0,
            current_run: None,
            previous_run: None,
            ledger: Arc::new(Mutex::new(RunLedger::default())),
        })
    }

    /// Suite directory
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Declared tests remaining after pattern filtering
    pub fn tests(&self) -> &[DeclaredTest] {
        &self.tests
    }

    /// Test files on disk that no declared test references
    pub fn untracked(&self) -> &[String] {
        &self.untracked
    }

    /// Number of dispatched runs
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Total number of tasks in the matrix
    pub fn total(&self) -> usize {
        self.matrix.len()
    }

    /// Tasks not yet dispatched
    pub fn remaining(&self) -> usize {
        self.matrix.remaining()
    }

    /// Whether the most recent run failed
    pub fn failed(&self) -> bool {
        self.ledger().failed
    }

    /// Whether a run is still active
    pub fn is_active(&self) -> bool {
        self.ledger().active
    }

    /// Summed duration of every completed run
    pub fn duration(&self) -> Duration {
        self.ledger().duration
    }

    /// Captured stdout of the most recent completed run
    pub fn stdout(&self) -> String {
        self.ledger().stdout.clone()
    }

    /// Captured stderr of the most recent completed run
    pub fn stderr(&self) -> String {
        self.ledger().stderr.clone()
    }

    pub fn current_run(&self) -> Option<&Task> {
        self.current_run.as_ref()
    }

    pub fn previous_run(&self) -> Option<&Task> {
        self.previous_run.as_ref()
    }

    /// Next task, with its test file resolved against the suite directory
    pub fn next(&mut self) -> Option<Task> {
        self.matrix.next().map(|t| t.resolved(&self.cwd))
    }

    /// Next task without consuming it
    pub fn peek(&self) -> Option<Task> {
        self.matrix.peek().map(|t| t.resolved(&self.cwd))
    }

    /// Skip ahead to an absolute task position
    pub fn seek(&mut self, position: usize) {
        self.matrix.seek(position);
    }

    /// Whether dispatching the next task would install anything
    pub fn next_needs_install(&self) -> bool {
        match self.peek() {
            Some(next) => !package_diff(self.current_run.as_ref(), &next).is_empty(),
            None => false,
        }
    }

    /// Dispatch the next task to a fresh worker. Returns `Ok(None)` once the
    /// matrix is exhausted.
    pub async fn run(&mut self) -> Result<Option<RunHandle>> {
        if self.is_active() {
            return Err(OrchestratorError::RunInProgress(self.cwd.clone()).into());
        }

        let task = match self.next() {
            Some(task) => task,
            None => {
                debug!(runs = self.runs, "matrix exhausted");
                return Ok(None);
            }
        };

        self.previous_run = self.current_run.replace(task.clone());
        self.runs += 1;

        let diff = package_diff(self.previous_run.as_ref(), &task);
        let needs_install = !diff.is_empty();
        let install = if self.options.all_pkgs {
            task.install_specs()
        } else {
            diff
        };

        {
            let mut ledger = self.ledger();
            ledger.failed = false;
            ledger.active = true;
        }

        let dispatch = Dispatch {
            task,
            install,
            needs_install,
        };

        match self.spawn(dispatch).await {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                let mut ledger = self.ledger();
                ledger.active = false;
                ledger.failed = true;
                Err(e)
            }
        }
    }

    async fn spawn(&self, dispatch: Dispatch) -> Result<RunHandle> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(OrchestratorError::Io)?;
        let addr = listener.local_addr().map_err(OrchestratorError::Io)?;
        let token = uuid::Uuid::new_v4().to_string();

        let worker = &self.options.worker;
        let child = Command::new(&worker.program)
            .args(&worker.args)
            .arg(&dispatch.task.test)
            .args(&dispatch.install)
            .current_dir(&self.cwd)
            .env(MODULE_FORMAT_ENV, self.options.module_format.as_str())
            .env(IPC_ADDR_ENV, addr.to_string())
            .env(IPC_TOKEN_ENV, &token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| OrchestratorError::Spawn {
                program: worker.program.clone(),
                source,
            })?;

        info!(
            run = self.runs,
            task = %dispatch.task,
            install = ?dispatch.install,
            pid = ?child.id(),
            "worker spawned"
        );

        let connect = accept_worker(listener, token);

        let ledger = self.ledger.clone();
        let on_exit: ExitHook = Box::new(move |outcome: &RunOutcome| {
            ledger
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(outcome);
        });

        Ok(RunHandle::start(dispatch, child, connect, Some(on_exit)))
    }

    fn ledger(&self) -> MutexGuard<'_, RunLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Accept control connections until one presents `token` in its first
/// frame. Any other local client is dropped.
async fn accept_worker(listener: TcpListener, token: String) -> std::io::Result<TcpStream> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let hello =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame::<_, HelloMessage>(&mut stream))
                .await;
        match hello {
            Ok(Ok(Some(hello))) if hello.token == token => {
                debug!(%peer, "control connection accepted");
                return Ok(stream);
            }
            Ok(Ok(_)) => warn!(%peer, "control connection rejected: missing or wrong token"),
            Ok(Err(e)) => warn!(%peer, error = %e, "control connection rejected"),
            Err(_) => warn!(%peer, "control connection rejected: no handshake"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TavError;
    use crate::run::RunEvent;
    use tempfile::TempDir;

    fn redis_suite() -> (VersionSet, Vec<DeclaredTest>) {
        let versions = VersionSet::new()
            .with_package("redis", ["1", "2"])
            .with_package("pg", ["8"]);
        let tests = vec![DeclaredTest::new(["redis.test.js"]).with_package("redis")];
        (versions, tests)
    }

    fn echo_worker() -> WorkerConfig {
        WorkerConfig::new("sh").with_args(["-c", "echo \"$@\"", "worker"])
    }

    #[test]
    fn test_next_resolves_absolute_path() {
        let temp = TempDir::new().unwrap();
        let (versions, tests) = redis_suite();
        let mut orchestrator =
            Orchestrator::new(temp.path(), &versions, &tests, OrchestratorOptions::new()).unwrap();

        let peeked = orchestrator.peek().unwrap();
        assert_eq!(orchestrator.peek(), Some(peeked.clone()));
        let next = orchestrator.next().unwrap();
        assert_eq!(next, peeked);
        assert_eq!(next.test, temp.path().join("redis.test.js"));
        assert_eq!(next.packages["redis"], "1");
        assert_eq!(orchestrator.next().unwrap().packages["redis"], "2");
        assert!(orchestrator.next().is_none());
    }

    #[test]
    fn test_patterns_filter_declared_tests() {
        let temp = TempDir::new().unwrap();
        let tests = vec![
            DeclaredTest::new(["foo.test.js", "bar.test.js"]),
            DeclaredTest::new(["bar.test.js"]),
        ];
        let options = OrchestratorOptions::new().with_patterns(vec!["foo".to_string()]);
        let orchestrator = Orchestrator::new(temp.path(), &VersionSet::new(), &tests, options).unwrap();

        assert_eq!(orchestrator.tests().len(), 1);
        assert_eq!(orchestrator.tests()[0].files, vec!["foo.test.js"]);
        assert_eq!(orchestrator.total(), 1);
    }

    #[test]
    fn test_untracked_files_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("redis.test.js"), "").unwrap();
        std::fs::write(temp.path().join("stray.test.js"), "").unwrap();
        let (versions, tests) = redis_suite();

        let orchestrator =
            Orchestrator::new(temp.path(), &versions, &tests, OrchestratorOptions::new()).unwrap();
        assert_eq!(orchestrator.untracked(), ["stray.test.js"]);

        let strict = OrchestratorOptions::new().with_strict(true);
        let err = Orchestrator::new(temp.path(), &versions, &tests, strict).unwrap_err();
        assert!(matches!(
            err,
            TavError::Config(ConfigError::UntrackedTests { .. })
        ));
    }

    #[test]
    fn test_next_needs_install() {
        let temp = TempDir::new().unwrap();
        let versions = VersionSet::new().with_package("redis", ["1"]);
        let tests = vec![
            DeclaredTest::new(["a.test.js", "b.test.js"]).with_package("redis"),
            DeclaredTest::new(["c.test.js"]),
        ];
        let mut orchestrator =
            Orchestrator::new(temp.path(), &versions, &tests, OrchestratorOptions::new()).unwrap();

        assert!(orchestrator.next_needs_install());
        orchestrator.current_run = orchestrator.next();
        assert!(!orchestrator.next_needs_install());
        orchestrator.current_run = orchestrator.next();
        assert!(!orchestrator.next_needs_install());
        orchestrator.current_run = orchestrator.next();
        assert!(!orchestrator.next_needs_install());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_installs_only_the_delta() {
        let temp = TempDir::new().unwrap();
        let (versions, tests) = redis_suite();
        let options = OrchestratorOptions::new().with_worker(echo_worker());
        let mut orchestrator = Orchestrator::new(temp.path(), &versions, &tests, options).unwrap();

        let first = orchestrator.run().await.unwrap().unwrap();
        assert_eq!(first.install(), ["redis@1"]);
        assert!(first.needs_install());
        let outcome = first.wait().await;
        let expected = format!("{} redis@1\n", temp.path().join("redis.test.js").display());
        assert_eq!(outcome.stdout, expected);
        assert_eq!(orchestrator.stdout(), expected);
        assert!(!orchestrator.failed());
        assert!(!orchestrator.is_active());

        let second = orchestrator.run().await.unwrap().unwrap();
        assert_eq!(second.install(), ["redis@2"]);
        second.wait().await;

        assert_eq!(orchestrator.runs(), 2);
        assert_eq!(orchestrator.previous_run().unwrap().packages["redis"], "1");
        assert_eq!(orchestrator.current_run().unwrap().packages["redis"], "2");
        assert!(orchestrator.run().await.unwrap().is_none());
        assert_eq!(orchestrator.runs(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_all_pkgs_installs_everything() {
        let temp = TempDir::new().unwrap();
        let versions = VersionSet::new()
            .with_package("redis", ["1", "2"])
            .with_package("pg", ["8"]);
        let tests = vec![DeclaredTest::new(["db.test.js"])
            .with_package("redis")
            .with_package("pg")];
        let options = OrchestratorOptions::new()
            .with_all_pkgs(true)
            .with_worker(echo_worker());
        let mut orchestrator = Orchestrator::new(temp.path(), &versions, &tests, options).unwrap();

        orchestrator.run().await.unwrap().unwrap().wait().await;
        let second = orchestrator.run().await.unwrap().unwrap();
        assert_eq!(second.install(), ["pg@8", "redis@2"]);
        assert!(second.needs_install());
        second.wait().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_rejected_while_active() {
        let temp = TempDir::new().unwrap();
        let (versions, tests) = redis_suite();
        let options = OrchestratorOptions::new()
            .with_worker(WorkerConfig::new("sh").with_args(["-c", "sleep 0.3", "worker"]));
        let mut orchestrator = Orchestrator::new(temp.path(), &versions, &tests, options).unwrap();

        let handle = orchestrator.run().await.unwrap().unwrap();
        assert!(orchestrator.is_active());
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            TavError::Orchestrator(OrchestratorError::RunInProgress(_))
        ));
        assert_eq!(orchestrator.runs(), 1);

        handle.wait().await;
        assert!(!orchestrator.is_active());
        assert!(orchestrator.run().await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_killed_worker_marks_failed() {
        let temp = TempDir::new().unwrap();
        let (versions, tests) = redis_suite();
        let options = OrchestratorOptions::new()
            .with_worker(WorkerConfig::new("sh").with_args(["-c", "kill -9 $$", "worker"]));
        let mut orchestrator = Orchestrator::new(temp.path(), &versions, &tests, options).unwrap();

        let mut handle = orchestrator.run().await.unwrap().unwrap();
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }

        assert_eq!(events[0], RunEvent::Error { code: -9 });
        assert!(matches!(events[1], RunEvent::End(_)));
        assert!(orchestrator.failed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_environment_and_cwd() {
        let temp = TempDir::new().unwrap();
        let tests = vec![DeclaredTest::new(["esm.test.mjs"])];
        let options = OrchestratorOptions::new()
            .with_module_format(ModuleFormat::Module)
            .with_worker(WorkerConfig::new("sh").with_args([
                "-c",
                "echo \"$TAV_MODULE_FORMAT\"; test -n \"$TAV_IPC_ADDR\" && test -n \"$TAV_IPC_TOKEN\" && pwd",
                "worker",
            ]));
        let mut orchestrator =
            Orchestrator::new(temp.path(), &VersionSet::new(), &tests, options).unwrap();

        let handle = orchestrator.run().await.unwrap().unwrap();
        assert!(handle.install().is_empty());
        assert!(!handle.needs_install());
        let outcome = handle.wait().await;

        let mut lines = outcome.stdout.lines();
        assert_eq!(lines.next(), Some("module"));
        let cwd = std::fs::canonicalize(temp.path()).unwrap();
        let reported = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(reported, cwd);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_clears_active_flag() {
        let temp = TempDir::new().unwrap();
        let (versions, tests) = redis_suite();
        let options = OrchestratorOptions::new()
            .with_worker(WorkerConfig::new("/nonexistent/tav-worker"));
        let mut orchestrator = Orchestrator::new(temp.path(), &versions, &tests, options).unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            TavError::Orchestrator(OrchestratorError::Spawn { .. })
        ));
        assert!(!orchestrator.is_active());
        assert!(orchestrator.failed());
    }

    #[tokio::test]
    async fn test_control_connection_requires_run_token() {
        use crate::protocol::{write_frame, StatusMessage, WorkerStatus};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(accept_worker(listener, "secret".to_string()));

        let mut intruder = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut intruder, &HelloMessage::new("guess")).await.unwrap();

        let mut status_first = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut status_first, &StatusMessage::new(&WorkerStatus::Completed))
            .await
            .unwrap();

        let mut worker = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut worker, &HelloMessage::new("secret")).await.unwrap();
        write_frame(&mut worker, &StatusMessage::new(&WorkerStatus::Completed))
            .await
            .unwrap();

        let mut accepted = tokio::time::timeout(Duration::from_secs(10), accept)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let status: StatusMessage = read_frame(&mut accepted).await.unwrap().unwrap();
        assert_eq!(status.decode(), WorkerStatus::Completed);
    }
}
