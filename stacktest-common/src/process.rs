//! Supervised child processes.
//!
//! A [`ProcessSupervisor`] spawns a command with piped output, hands both
//! pipes to a [`StreamTracker`] and manages the stop/drain/wait lifecycle.

use std::fmt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::track::{StreamTracker, TrackError, TrackerOptions};

/// Exit code a shell reports for a child terminated by a signal: 128 + N.
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// SIGINT signal number.
pub const SIGINT: i32 = 2;

/// Exit code of a process stopped by an interrupt.
pub const EXIT_INTERRUPTED: i32 = EXIT_SIGNAL_BASE + SIGINT;

/// Error type for supervisor operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Process failed to start: {0}")]
    StartupFailed(String),

    #[error("Process {0} was already started")]
    AlreadyStarted(String),

    #[error("Process {0} is not running")]
    NotRunning(String),

    #[error("Failed to signal process {name} (pid={pid}): {reason}")]
    SignalFailed {
        name: String,
        pid: u32,
        reason: String,
    },

    #[error("Stream tracking failed: {0}")]
    Track(#[from] TrackError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with status 0.
    Clean,
    /// Stopped by our interrupt and exited with 130.
    Interrupted,
    /// Any other termination. `code` follows the 128+N convention for
    /// signal deaths.
    Failed { code: i32 },
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Classify an exit code given whether a stop was requested.
    ///
    /// 130 only counts as success when we asked the process to stop.
    pub fn classify(code: i32, stop_requested: bool) -> Self {
        match code {
            0 => Self::Clean,
            EXIT_INTERRUPTED if stop_requested => Self::Interrupted,
            code => Self::Failed { code },
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "exited cleanly"),
            Self::Interrupted => write!(f, "stopped by interrupt (exit status {EXIT_INTERRUPTED})"),
            Self::Failed { code } => write!(f, "exit status {code}"),
        }
    }
}

/// Map an exit status to a single code, folding signal deaths into 128+N.
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EXIT_SIGNAL_BASE + signal;
        }
    }
    -1
}

/// Owns a child process and the tracker consuming its output.
#[derive(Debug)]
pub struct ProcessSupervisor {
    name: String,
    command: Command,
    tracker: StreamTracker,
    child: Option<Child>,
    started_at: Option<Instant>,
    stop_requested: bool,
}

impl ProcessSupervisor {
    /// Prepare a supervisor. The tracker exists immediately so match
    /// requests can be registered before the process starts.
    pub fn new(name: impl Into<String>, command: Command, options: TrackerOptions) -> Self {
        Self {
            name: name.into(),
            command,
            tracker: StreamTracker::new(options),
            child: None,
            started_at: None,
            stop_requested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracker(&self) -> &StreamTracker {
        &self.tracker
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Spawn the process and start tracking `<name>-stdout` and
    /// `<name>-stderr`.
    pub fn start(&mut self) -> SupervisorResult<u32> {
        if self.child.is_some() {
            return Err(SupervisorError::AlreadyStarted(self.name.clone()));
        }

        self.command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            "Spawning process: {} {:?}",
            self.name,
            self.command.get_program()
        );
        let mut child = self.command.spawn().map_err(|e| {
            SupervisorError::StartupFailed(format!(
                "{}: {}",
                self.command.get_program().to_string_lossy(),
                e
            ))
        })?;
        let pid = child.id();

        if let Err(e) = self.attach_output(&mut child) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        self.child = Some(child);
        self.started_at = Some(Instant::now());
        info!(pid, "Process spawned: {}", self.name);
        Ok(pid)
    }

    fn attach_output(&self, child: &mut Child) -> SupervisorResult<()> {
        if let Some(stdout) = child.stdout.take() {
            self.tracker.attach(format!("{}-stdout", self.name), stdout)?;
        }
        if let Some(stderr) = child.stderr.take() {
            self.tracker.attach(format!("{}-stderr", self.name), stderr)?;
        }
        Ok(())
    }

    /// Ask the process to stop with SIGINT.
    pub fn signal_stop(&mut self) -> SupervisorResult<()> {
        self.request_stop(send_interrupt)
    }

    /// A stop only counts as requested once the signal was delivered.
    fn request_stop<F>(&mut self, send: F) -> SupervisorResult<()>
    where
        F: FnOnce(u32) -> Result<(), String>,
    {
        let pid = self
            .pid()
            .ok_or_else(|| SupervisorError::NotRunning(self.name.clone()))?;
        info!("Stopping process: {} (pid={})", self.name, pid);
        send(pid).map_err(|reason| SupervisorError::SignalFailed {
            name: self.name.clone(),
            pid,
            reason,
        })?;
        self.stop_requested = true;
        Ok(())
    }

    /// Drain all output, then wait for the process to exit.
    ///
    /// Output is drained first because the pipes must be fully read before
    /// the exit status is collected.
    pub fn wait(&mut self) -> SupervisorResult<ExitOutcome> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| SupervisorError::NotRunning(self.name.clone()))?;

        self.tracker.wait_close();
        let status = child.wait()?;
        let code = exit_code(&status);
        let outcome = ExitOutcome::classify(code, self.stop_requested);

        match outcome {
            ExitOutcome::Failed { .. } => {
                error!("Process {} ended uncleanly: {}", self.name, outcome)
            }
            _ => debug!(
                ran_for = ?self.started_at.map(|t| t.elapsed()),
                "Process {} {}", self.name, outcome
            ),
        }
        Ok(outcome)
    }

    /// Start, drain and wait in one call, for short-lived commands.
    pub fn run_to_completion(&mut self) -> SupervisorResult<ExitOutcome> {
        self.start()?;
        self.wait()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("Killing unwaited process: {} (pid={})", self.name, child.id());
            if let Err(e) = child.kill() {
                warn!("Failed to kill {}: {}", self.name, e);
            }
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> Result<(), String> {
    match Command::new("kill")
        .arg("-INT")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(String::from_utf8_lossy(&output.stderr).trim().to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) -> Result<(), String> {
    Err("interrupt signals are only supported on unix".to_string())
}
