//! Supervision of external backend operations.
//!
//! Every backend action runs as a separate OS process in a named [`Slot`].
//! A slot holds at most one running operation; starting another in an
//! occupied slot fails with a busy error and leaves the running one alone.
//! Each started operation produces exactly one [`SupervisorEvent::Finished`],
//! delivered after all of its [`SupervisorEvent::Output`] lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{Error, ProcessError, Result};

/// How long to wait for a finished process's stderr to drain.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// How long to keep reading stdout after the process exited. A background
/// child that inherited the pipe can hold it open indefinitely.
const STDOUT_DRAIN: Duration = Duration::from_secs(2);

/// Exit code the backend uses for "try again later".
pub const EXIT_DEFERRED: i32 = 3;

// =============================================================================
// Operation identity
// =============================================================================

/// Concurrency slot. At most one operation runs per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Slot {
    /// Playlist transfer to the device.
    Upload,
    /// Mobile status query.
    Status,
    /// Remote device listing.
    DeviceScan,
    /// Staleness check before an upload.
    CheckUpdate,
    /// Retry, cleanup, manual accounting and source refresh share this slot.
    Maintenance,
    /// Track rating writes.
    Rating,
}

impl Slot {
    /// All slots, in display order.
    pub const ALL: [Self; 6] = [
        Self::Upload,
        Self::Status,
        Self::DeviceScan,
        Self::CheckUpdate,
        Self::Maintenance,
        Self::Rating,
    ];

    /// Stable name used in logs and messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Status => "status",
            Self::DeviceScan => "device-scan",
            Self::CheckUpdate => "check-update",
            Self::Maintenance => "maintenance",
            Self::Rating => "rating",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Unique identifier of a started operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OperationId(pub u64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Opaque handle returned when an operation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OperationHandle {
    /// Operation id.
    pub id: OperationId,
    /// Slot the operation occupies.
    pub slot: Slot,
}

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.slot, self.id)
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Backend script, resolved through the [`ScriptLocator`] search path.
    Script(String),
    /// Program looked up on `PATH`.
    System(String),
}

impl Program {
    /// Name of the script or program.
    pub fn name(&self) -> &str {
        match self {
            Self::Script(name) | Self::System(name) => name,
        }
    }
}

/// Whether stdout is streamed line by line or collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Each line becomes a [`SupervisorEvent::Output`].
    #[default]
    Stream,
    /// Lines are accumulated into [`OperationOutcome::stdout`].
    Capture,
}

/// A fully described external operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program to run.
    pub program: Program,
    /// Positional arguments, subcommand first.
    pub positional: Vec<String>,
    /// Flags, appended after the positional arguments.
    pub flags: Vec<String>,
    /// Output handling.
    pub output: OutputMode,
    /// Hard limit on run time.
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Invoke a backend script.
    pub fn script(name: impl Into<String>) -> Self {
        Self::new(Program::Script(name.into()))
    }

    /// Invoke a program from `PATH`.
    pub fn system(name: impl Into<String>) -> Self {
        Self::new(Program::System(name.into()))
    }

    const fn new(program: Program) -> Self {
        Self {
            program,
            positional: Vec::new(),
            flags: Vec::new(),
            output: OutputMode::Stream,
            timeout: None,
        }
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.positional.push(arg.into());
        self
    }

    /// Append several positional arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.positional.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append a bare flag.
    #[must_use]
    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// Append a flag followed by its value.
    #[must_use]
    pub fn flag_value(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self.flags.push(value.into());
        self
    }

    /// Collect stdout instead of streaming it.
    #[must_use]
    pub const fn captured(mut self) -> Self {
        self.output = OutputMode::Capture;
        self
    }

    /// Bound the run time.
    #[must_use]
    pub const fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Arguments in the order they are passed to the program.
    pub fn command_line(&self) -> impl Iterator<Item = &str> {
        self.positional
            .iter()
            .chain(self.flags.iter())
            .map(String::as_str)
    }

    /// Short label for logs, e.g. `musiclib_mobile.sh upload`.
    pub fn label(&self) -> String {
        match self.positional.first() {
            Some(sub) => format!("{} {}", self.program.name(), sub),
            None => self.program.name().to_string(),
        }
    }
}

// =============================================================================
// Outcomes and events
// =============================================================================

/// How an operation came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process exited on its own.
    Exited,
    /// The process was stopped on request.
    Cancelled,
    /// The process exceeded its time limit.
    TimedOut,
}

/// Classified result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Exit code 0.
    Success,
    /// Exit code 3.
    Deferred,
    /// Anything else, with a diagnostic suitable for display.
    Failed {
        /// Diagnostic text.
        diagnostic: String,
    },
}

/// Terminal result of one supervised operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    /// Handle of the finished operation.
    pub handle: OperationHandle,
    /// Exit code, absent when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// How the operation ended.
    pub termination: Termination,
    /// Captured stdout (empty in streaming mode).
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl OperationOutcome {
    /// Whether the process exited on its own with code 0.
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    /// Classify the outcome.
    pub fn status(&self) -> OutcomeStatus {
        match (self.termination, self.exit_code) {
            (Termination::Exited, Some(0)) => OutcomeStatus::Success,
            (Termination::Exited, Some(EXIT_DEFERRED)) => OutcomeStatus::Deferred,
            (Termination::Cancelled, _) => OutcomeStatus::Failed {
                diagnostic: "Cancelled".to_string(),
            },
            (Termination::TimedOut, _) => OutcomeStatus::Failed {
                diagnostic: "Timed out".to_string(),
            },
            (Termination::Exited, code) => {
                let stderr = self.stderr.trim();
                let diagnostic = if !stderr.is_empty() {
                    stderr.to_string()
                } else if let Some(code) = code {
                    format!("Script exited with code {code}")
                } else {
                    "Script was terminated by a signal".to_string()
                };
                OutcomeStatus::Failed { diagnostic }
            }
        }
    }

    /// Convert into a `Result`, naming `operation` in the error.
    pub fn into_result(self, operation: &str) -> Result<Self> {
        match self.status() {
            OutcomeStatus::Success => Ok(self),
            OutcomeStatus::Deferred => {
                let message = match self.stderr.trim() {
                    "" => "backend is busy, the change was queued".to_string(),
                    s => s.to_string(),
                };
                Err(Error::deferred(operation, message))
            }
            OutcomeStatus::Failed { diagnostic } => {
                Err(Error::external_failure(operation, self.exit_code, diagnostic))
            }
        }
    }
}

/// Event emitted by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// One stdout line of a streaming operation.
    Output {
        /// Originating operation.
        handle: OperationHandle,
        /// Line without its terminator.
        line: String,
    },
    /// The operation ended. Always the last event for its handle.
    Finished(OperationOutcome),
}

impl SupervisorEvent {
    /// Handle the event belongs to.
    pub const fn handle(&self) -> OperationHandle {
        match self {
            Self::Output { handle, .. } => *handle,
            Self::Finished(outcome) => outcome.handle,
        }
    }
}

/// Receiving side of the supervisor's event stream.
pub type SupervisorEvents = mpsc::UnboundedReceiver<SupervisorEvent>;

// =============================================================================
// Launcher seam
// =============================================================================

/// Starts and stops operations. Implemented by [`Supervisor`].
#[cfg_attr(test, mockall::automock)]
pub trait OperationLauncher {
    /// Start `invocation` in `slot` without blocking.
    ///
    /// Fails with a busy error if the slot is occupied, and with a not-found
    /// error if a script cannot be located. Nothing is started in either case.
    fn launch(&mut self, slot: Slot, invocation: &Invocation) -> Result<OperationHandle>;

    /// Ask the operation in `slot` to stop. Returns `false` if none is running.
    fn cancel(&mut self, slot: Slot) -> bool;

    /// Whether an operation occupies `slot`.
    fn is_running(&self, slot: Slot) -> bool;

    /// Ask every running operation to stop. Returns how many were signalled.
    fn cancel_all(&mut self) -> usize;
}

// =============================================================================
// Script resolution
// =============================================================================

/// Resolves backend script names against an ordered list of directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLocator {
    search_dirs: Vec<PathBuf>,
    shell: String,
}

impl ScriptLocator {
    /// Create a locator searching `search_dirs` in order and running scripts with `shell`.
    pub fn new(search_dirs: Vec<PathBuf>, shell: impl Into<String>) -> Self {
        Self {
            search_dirs,
            shell: shell.into(),
        }
    }

    /// Locator for the development then installed directories in `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            vec![
                config.scripts.development_directory.clone(),
                config.scripts.installed_directory.clone(),
            ],
            config.scripts.shell.clone(),
        )
    }

    /// Find `script` in the first directory that has it.
    pub fn resolve(&self, script: &str) -> Result<PathBuf> {
        self.search_dirs
            .iter()
            .map(|dir| dir.join(script))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| Error::operation_not_found(script, self.searched()))
    }

    /// Program and argument list for `invocation`.
    pub fn command_for(&self, invocation: &Invocation) -> Result<(String, Vec<String>)> {
        let args = invocation.command_line().map(str::to_string);
        match &invocation.program {
            Program::Script(name) => {
                let path = self.resolve(name)?;
                let mut full = vec![path.to_string_lossy().into_owned()];
                full.extend(args);
                Ok((self.shell.clone(), full))
            }
            Program::System(name) => Ok((name.clone(), args.collect())),
        }
    }

    fn searched(&self) -> String {
        let home = dirs::home_dir();
        self.search_dirs
            .iter()
            .map(|dir| display_with_tilde(dir, home.as_deref()))
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

fn display_with_tilde(dir: &Path, home: Option<&Path>) -> String {
    match home.and_then(|h| dir.strip_prefix(h).ok()) {
        Some(rest) => format!("~/{}", rest.display()),
        None => dir.display().to_string(),
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct RunningOperation {
    handle: OperationHandle,
    cancel_tx: Option<oneshot::Sender<()>>,
}

type RunningMap = Arc<Mutex<HashMap<Slot, RunningOperation>>>;

/// Runs backend operations as child processes, one per slot.
///
/// Launching requires a Tokio runtime context; each operation is driven by
/// its own task that forwards events to the receiver returned from
/// [`Supervisor::new`].
pub struct Supervisor {
    locator: ScriptLocator,
    grace: Duration,
    next_id: AtomicU64,
    running: RunningMap,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Supervisor {
    /// Create a supervisor and the receiver for its events.
    pub fn new(locator: ScriptLocator, grace: Duration) -> (Self, SupervisorEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            locator,
            grace,
            next_id: AtomicU64::new(1),
            running: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (supervisor, rx)
    }

    /// Create a supervisor from application configuration.
    pub fn from_config(config: &AppConfig) -> (Self, SupervisorEvents) {
        Self::new(
            ScriptLocator::from_config(config),
            config.timeouts.termination_grace(),
        )
    }

    /// The script locator in use.
    pub const fn locator(&self) -> &ScriptLocator {
        &self.locator
    }

    /// Handles of all running operations.
    pub fn running(&self) -> Vec<OperationHandle> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handles: Vec<_> = running.values().map(|r| r.handle).collect();
        handles.sort_by_key(|h| h.id);
        handles
    }
}

impl OperationLauncher for Supervisor {
    fn launch(&mut self, slot: Slot, invocation: &Invocation) -> Result<OperationHandle> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = running.get(&slot) {
            debug!("Ignoring {} request, {} still running", slot, existing.handle);
            return Err(Error::operation_busy(slot));
        }

        let (program, args) = self.locator.command_for(invocation)?;
        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            Error::Process(ProcessError::SpawnFailed {
                program: program.clone(),
                reason: e.to_string(),
            })
        })?;

        let handle = OperationHandle {
            id: OperationId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            slot,
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        running.insert(
            slot,
            RunningOperation {
                handle,
                cancel_tx: Some(cancel_tx),
            },
        );

        info!("Started {} as {} (pid {:?})", invocation.label(), handle, child.id());
        debug!("Command line: {} {}", program, args.join(" "));

        let task = OperationTask {
            handle,
            output: invocation.output,
            deadline: invocation.timeout.map(|t| Instant::now() + t),
            grace: self.grace,
            events: self.events.clone(),
            running: Arc::clone(&self.running),
        };
        tokio::spawn(task.run(child, cancel_rx));

        Ok(handle)
    }

    fn cancel(&mut self, slot: Slot) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get_mut(&slot).and_then(|r| r.cancel_tx.take()) {
            Some(tx) => {
                info!("Cancelling {} operation", slot);
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    fn is_running(&self, slot: Slot) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&slot)
    }

    fn cancel_all(&mut self) -> usize {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let mut signalled = 0;
        for op in running.values_mut() {
            if let Some(tx) = op.cancel_tx.take() {
                let _ = tx.send(());
                signalled += 1;
            }
        }
        if signalled > 0 {
            info!("Requested termination of {} running operation(s)", signalled);
        }
        signalled
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

// =============================================================================
// Per-operation task
// =============================================================================

struct OperationTask {
    handle: OperationHandle,
    output: OutputMode,
    deadline: Option<Instant>,
    grace: Duration,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    running: RunningMap,
}

impl OperationTask {
    async fn run(self, mut child: Child, mut cancel_rx: oneshot::Receiver<()>) {
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));
        let mut lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut captured = String::new();

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let finished = loop {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => break Finish::Stop(Termination::Cancelled),
                () = &mut expired => break Finish::Stop(Termination::TimedOut),
                line = next_line(&mut lines), if lines.is_some() => match line {
                    Some(line) => self.deliver(line, &mut captured),
                    None => lines = None,
                },
                status = child.wait() => break Finish::Exited(status),
            }
        };

        if matches!(finished, Finish::Exited(_)) && lines.is_some() {
            let drain = async {
                while let Some(line) = next_line(&mut lines).await {
                    self.deliver(line, &mut captured);
                }
            };
            if timeout(STDOUT_DRAIN, drain).await.is_err() {
                warn!("{} exited but its output is still held open", self.handle);
            }
        }

        let (termination, status) = match finished {
            Finish::Exited(status) => (Termination::Exited, status.ok()),
            Finish::Stop(reason) => {
                if reason == Termination::TimedOut {
                    warn!("{} exceeded its time limit", self.handle);
                }
                (reason, terminate(&mut child, self.grace).await)
            }
        };

        let stderr = match timeout(STDERR_DRAIN, stderr_task).await {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };

        let outcome = OperationOutcome {
            handle: self.handle,
            exit_code: status.and_then(|s| s.code()),
            termination,
            stdout: captured,
            stderr,
        };
        debug!(
            "{} finished: {:?}, exit code {:?}",
            self.handle, outcome.termination, outcome.exit_code
        );

        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.get(&self.handle.slot).map(|r| r.handle) == Some(self.handle) {
                running.remove(&self.handle.slot);
            }
        }

        if self.events.send(SupervisorEvent::Finished(outcome)).is_err() {
            debug!("Event receiver gone, dropping outcome of {}", self.handle);
        }
    }

    fn deliver(&self, line: String, captured: &mut String) {
        match self.output {
            OutputMode::Stream => {
                let event = SupervisorEvent::Output {
                    handle: self.handle,
                    line,
                };
                let _ = self.events.send(event);
            }
            OutputMode::Capture => {
                captured.push_str(&line);
                captured.push('\n');
            }
        }
    }
}

enum Finish {
    Exited(std::io::Result<ExitStatus>),
    Stop(Termination),
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(reader) => match reader.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!("Stopped reading operation output: {}", e);
                None
            }
        },
        None => None,
    }
}

async fn read_all<R>(stream: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = String::new();
    if let Some(mut stream) = stream
        && let Err(e) = stream.read_to_string(&mut buf).await
    {
        debug!("Failed to read stderr: {}", e);
    }
    buf
}

/// Request termination, then force-kill once `grace` has passed.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    request_termination(child).await;
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            error!("Failed waiting for process: {}", e);
            None
        }
        Err(_) => {
            warn!("Process ignored termination request, killing it");
            if let Err(e) = child.kill().await {
                error!("Failed to kill process: {}", e);
            }
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
async fn request_termination(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let sent = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success());
    if !sent {
        debug!("kill -TERM {} failed, falling back to SIGKILL", pid);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
async fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}
