//! Run handle - one in-flight worker process
//!
//! A driver task owns the child, its output pipes and the control
//! connection. The handle talks to it through channels: `proceed()` sends a
//! continue request, and the handle receives worker statuses in arrival
//! order followed by exactly one terminal [`RunEvent::End`].

use std::future::Future;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RunError;
use crate::protocol::{read_frame, write_frame, ControlCommand, StatusMessage, WorkerStatus};
use crate::task::Task;

/// How long to keep reading the control channel and output pipes after the
/// worker exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Exit code reported when the real one cannot be determined
const UNKNOWN_EXIT_CODE: i32 = -1;

/// What was dispatched for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Task being executed
    pub task: Task,
    /// Install arguments handed to the worker
    pub install: Vec<String>,
    /// Whether any package differs from the previous task
    pub needs_install: bool,
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code; negative when the worker was killed by a signal
    pub code: i32,
    /// Whether the exit code was non-zero
    pub failed: bool,
    /// Sum of the continue → completed windows
    pub duration: Duration,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl RunOutcome {
    /// Whether the worker terminated abnormally
    pub fn is_abnormal(&self) -> bool {
        self.code < 0
    }
}

/// Events observed on a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// The worker reported a status
    Status(WorkerStatus),
    /// The worker terminated abnormally; `End` follows
    Error { code: i32 },
    /// The worker exited; always the last event
    End(RunOutcome),
}

/// Callback invoked with the outcome right before `End` is delivered
pub type ExitHook = Box<dyn FnOnce(&RunOutcome) + Send + 'static>;

/// Handle to one running worker
pub struct RunHandle {
    dispatch: Dispatch,
    commands: mpsc::UnboundedSender<Instant>,
    events: mpsc::UnboundedReceiver<RunEvent>,
    exited: Arc<AtomicBool>,
    ended: bool,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("dispatch", &self.dispatch)
            .field("exited", &self.exited.load(Ordering::SeqCst))
            .finish()
    }
}

impl RunHandle {
    /// Start driving `child`. `connect` resolves to the control connection
    /// once the worker has attached to it.
    pub fn start<C, S>(
        dispatch: Dispatch,
        child: Child,
        connect: C,
        on_exit: Option<ExitHook>,
    ) -> Self
    where
        C: Future<Output = io::Result<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));

        let driver = Driver {
            label: dispatch.task.to_string(),
            commands: command_rx,
            events: event_tx,
            exited: exited.clone(),
            on_exit,
            phase_started: None,
            duration: Duration::ZERO,
        };
        tokio::spawn(driver.run(child, connect));

        Self {
            dispatch,
            commands: command_tx,
            events: event_rx,
            exited,
            ended: false,
        }
    }

    pub fn task(&self) -> &Task {
        &self.dispatch.task
    }

    pub fn install(&self) -> &[String] {
        &self.dispatch.install
    }

    pub fn needs_install(&self) -> bool {
        self.dispatch.needs_install
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Whether the worker has exited
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Let the worker proceed to its next timed phase. Starts the phase
    /// timer and sends `{"command": "continue"}`.
    pub fn proceed(&self) -> Result<(), RunError> {
        if self.has_exited() {
            return Err(RunError::InvalidState);
        }
        self.commands
            .send(Instant::now())
            .map_err(|_| RunError::InvalidState)
    }

    /// Next event, or `None` once `End` has been delivered
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        if self.ended {
            return None;
        }
        let event = self.events.recv().await;
        if matches!(event, Some(RunEvent::End(_)) | None) {
            self.ended = true;
        }
        event
    }

    /// Consume remaining events and return the outcome
    pub async fn wait(mut self) -> RunOutcome {
        while let Some(event) = self.next_event().await {
            if let RunEvent::End(outcome) = event {
                return outcome;
            }
        }

        // The driver always sends `End`; reaching this means it was torn down.
        RunOutcome {
            code: UNKNOWN_EXIT_CODE,
            failed: true,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

struct Driver {
    label: String,
    commands: mpsc::UnboundedReceiver<Instant>,
    events: mpsc::UnboundedSender<RunEvent>,
    exited: Arc<AtomicBool>,
    on_exit: Option<ExitHook>,
    phase_started: Option<Instant>,
    duration: Duration,
}

impl Driver {
    async fn run<C, S>(mut self, mut child: Child, connect: C)
    where
        C: Future<Output = io::Result<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let stdout = child.stdout.take().map(OutputCapture::spawn);
        let stderr = child.stderr.take().map(OutputCapture::spawn);

        tokio::pin!(connect);
        let mut connecting = true;
        let mut writer: Option<WriteHalf<S>> = None;
        let mut statuses: Option<mpsc::UnboundedReceiver<WorkerStatus>> = None;
        let mut pending = 0usize;
        let mut commands_open = true;

        let status = loop {
            tokio::select! {
                biased;

                conn = &mut connect, if connecting => {
                    connecting = false;
                    match conn {
                        Ok(stream) => {
                            debug!(task = %self.label, "worker attached to control channel");
                            let (reader, mut w) = tokio::io::split(stream);
                            statuses = Some(spawn_reader(reader));
                            let mut healthy = true;
                            for _ in 0..pending {
                                if let Err(e) = write_frame(&mut w, &ControlCommand::Continue).await {
                                    warn!(task = %self.label, error = %e, "failed to send queued continue");
                                    healthy = false;
                                    break;
                                }
                            }
                            pending = 0;
                            if healthy {
                                writer = Some(w);
                            }
                        }
                        Err(e) => {
                            warn!(task = %self.label, error = %e, "control channel unavailable");
                        }
                    }
                }

                status = recv_status(&mut statuses), if statuses.is_some() => {
                    match status {
                        Some(status) => self.on_status(status),
                        None => statuses = None,
                    }
                }

                request = self.commands.recv(), if commands_open => {
                    match request {
                        Some(at) => {
                            self.phase_started = Some(at);
                            match writer.as_mut() {
                                Some(w) => {
                                    if let Err(e) = write_frame(w, &ControlCommand::Continue).await {
                                        warn!(task = %self.label, error = %e, "failed to send continue");
                                        writer = None;
                                    }
                                }
                                None if connecting => pending += 1,
                                None => warn!(task = %self.label, "continue requested without a control channel"),
                            }
                        }
                        None => commands_open = false,
                    }
                }

                status = child.wait() => break status,
            }
        };
        self.exited.store(true, Ordering::SeqCst);

        // Descendants of the worker may inherit the pipes and the control
        // connection, so nothing after exit waits past this deadline.
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;

        // Statuses the worker sent before exiting still come before `End`.
        if let Some(mut rx) = statuses.take() {
            while let Ok(Some(status)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                self.on_status(status);
            }
        }
        drop(writer);

        let code = match status {
            Ok(status) => exit_code(&status),
            Err(e) => {
                warn!(task = %self.label, error = %e, "failed to wait for worker");
                UNKNOWN_EXIT_CODE
            }
        };

        let outcome = RunOutcome {
            code,
            failed: code != 0,
            duration: self.duration,
            stdout: collect_output(stdout, deadline).await,
            stderr: collect_output(stderr, deadline).await,
        };

        info!(
            task = %self.label,
            code,
            duration_ms = outcome.duration.as_millis() as u64,
            "worker exited"
        );

        if outcome.is_abnormal() {
            let _ = self.events.send(RunEvent::Error { code });
        }
        if let Some(hook) = self.on_exit.take() {
            hook(&outcome);
        }
        let _ = self.events.send(RunEvent::End(outcome));
    }

    fn on_status(&mut self, status: WorkerStatus) {
        debug!(task = %self.label, status = %status, "worker status");
        if status == WorkerStatus::Completed {
            if let Some(started) = self.phase_started.take() {
                self.duration += started.elapsed();
            }
        }
        let _ = self.events.send(RunEvent::Status(status));
    }
}

/// Forward decoded statuses from the control connection. Reading happens in
/// its own task so a partially received frame is never dropped by `select!`.
fn spawn_reader<R>(mut reader: ReadHalf<R>) -> mpsc::UnboundedReceiver<WorkerStatus>
where
    R: AsyncRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match read_frame::<_, StatusMessage>(&mut reader).await {
                Ok(Some(message)) => {
                    if tx.send(message.decode()).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "control channel closed with error");
                    break;
                }
            }
        }
    });
    rx
}

async fn recv_status(
    statuses: &mut Option<mpsc::UnboundedReceiver<WorkerStatus>>,
) -> Option<WorkerStatus> {
    match statuses.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// An output pipe drained in the background into a shared buffer, so the
/// bytes read so far survive when the reader is abandoned.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl OutputCapture {
    fn spawn<R>(mut pipe: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let reader = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        warn!(error = %e, "failed to read worker output");
                        break;
                    }
                }
            }
        });

        Self { buffer, reader }
    }

    /// Wait for end of stream until `deadline`, then take what was read
    async fn collect(mut self, deadline: tokio::time::Instant) -> String {
        if tokio::time::timeout_at(deadline, &mut self.reader).await.is_err() {
            debug!("output pipe still open after worker exit, truncating");
            self.reader.abort();
        }
        let bytes = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let text = String::from_utf8_lossy(&bytes).into_owned();
        text
    }
}

async fn collect_output(capture: Option<OutputCapture>, deadline: tokio::time::Instant) -> String {
    match capture {
        Some(capture) => capture.collect(deadline).await,
        None => String::new(),
    }
}

/// Exit code of a finished worker; signals map to their negated number
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    UNKNOWN_EXIT_CODE
}
