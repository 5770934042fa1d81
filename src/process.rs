use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::errors::{OperatorError, OperatorResult};
use crate::logging::{open_log_writers, LogRotationPolicy, LogSink, ProcessLogs};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Idle,
    Running,
    Error,
    Updating,
    Succeed,
    Stopped,
}

impl ProcessStatus {
    /// Statuses from which a handle can only be revived through a clone.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeed | Self::Error | Self::Stopped)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Error => "error",
            Self::Updating => "updating",
            Self::Succeed => "succeed",
            Self::Stopped => "stopped",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub success: bool,
    pub wait_error: Option<String>,
    /// Set when the exit was caused by an explicit `stop`.
    pub stop_requested: bool,
}

impl ProcessExit {
    pub fn is_failure(&self) -> bool {
        !self.success
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.wait_error, self.code) {
            (Some(err), _) => write!(f, "wait failed: {err}"),
            (None, Some(code)) => write!(f, "exit code {code}"),
            (None, None) => write!(f, "terminated by signal"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum OutputTarget {
    /// Forward stdout to the supervisor's own stdout.
    Inherit,
    Files {
        logs: ProcessLogs,
        rotation: LogRotationPolicy,
    },
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub output: OutputTarget,
    pub stop_timeout: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            output: OutputTarget::Inherit,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn from_command_line(command_line: &str) -> OperatorResult<Self> {
        let (program, args) = parse_command_line(command_line)?;
        Ok(Self::new(program, args))
    }

    pub fn slug(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

pub fn parse_command_line(command_line: &str) -> OperatorResult<(String, Vec<String>)> {
    let tokens = shell_words::split(command_line)
        .map_err(|err| OperatorError::InvalidCommand(err.to_string()))?;
    let Some((program, args)) = tokens.split_first() else {
        return Err(OperatorError::InvalidCommand(
            "command cannot be empty".to_string(),
        ));
    };
    Ok((program.clone(), args.to_vec()))
}

struct HandleState {
    status: ProcessStatus,
    version: String,
    pid: Option<u32>,
    started: bool,
    stop_requested: bool,
    sink: Option<Arc<LogSink>>,
}

/// One supervised OS process.
///
/// A handle runs at most one process in its lifetime. Once started (or
/// stopped) it cannot be started again; `clone_fresh` yields a new idle
/// handle with the same program, arguments and version.
pub struct ProcessHandle {
    spec: ProcessSpec,
    state: Mutex<HandleState>,
    exit_watch: watch::Sender<Option<ProcessExit>>,
    exit_tx: mpsc::Sender<ProcessExit>,
    exit_rx: Mutex<Option<mpsc::Receiver<ProcessExit>>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("slug", &self.slug())
            .field("version", &self.version())
            .field("status", &self.status())
            .finish()
    }
}

impl ProcessHandle {
    pub fn new(spec: ProcessSpec, version: impl Into<String>) -> Self {
        let (exit_watch, _) = watch::channel(None);
        let (exit_tx, exit_rx) = mpsc::channel(1);
        Self {
            spec,
            state: Mutex::new(HandleState {
                status: ProcessStatus::Idle,
                version: version.into(),
                pid: None,
                started: false,
                stop_requested: false,
                sink: None,
            }),
            exit_watch,
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
        }
    }

    pub fn slug(&self) -> String {
        self.spec.slug()
    }

    pub fn version(&self) -> String {
        self.lock_state().version.clone()
    }

    pub fn set_version(&self, version: impl Into<String>) {
        self.lock_state().version = version.into();
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_state().pid
    }

    pub fn set_status(&self, status: ProcessStatus) {
        self.lock_state().status = status;
    }

    /// Asserts `updating` and returns the effective status it replaced.
    /// A stopped handle is left alone and yields `None`.
    pub fn mark_updating(&self) -> Option<ProcessStatus> {
        let mut state = self.lock_state();
        if state.status == ProcessStatus::Stopped {
            return None;
        }
        let previous = self.effective_status(&state);
        state.status = ProcessStatus::Updating;
        Some(previous)
    }

    /// Sets `to` only while the status is still `expected`, so a stop that
    /// landed in between is never overwritten.
    pub fn restore_status(&self, expected: ProcessStatus, to: ProcessStatus) -> bool {
        let mut state = self.lock_state();
        if state.status != expected {
            return false;
        }
        state.status = to;
        true
    }

    /// Effective status: an explicit stop wins, then the observed exit, then
    /// whatever was last set.
    pub fn status(&self) -> ProcessStatus {
        let state = self.lock_state();
        self.effective_status(&state)
    }

    fn effective_status(&self, state: &HandleState) -> ProcessStatus {
        if state.status == ProcessStatus::Stopped {
            return ProcessStatus::Stopped;
        }
        match self.success() {
            Some(true) => ProcessStatus::Succeed,
            Some(false) => ProcessStatus::Error,
            None => state.status,
        }
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit_watch.borrow().clone()
    }

    pub fn success(&self) -> Option<bool> {
        self.exit_watch.borrow().as_ref().map(|exit| exit.success)
    }

    /// Hands out the single-slot exit notification receiver. Only the first
    /// caller gets it.
    pub fn take_exit_receiver(&self) -> Option<mpsc::Receiver<ProcessExit>> {
        self.exit_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn clone_fresh(&self) -> Self {
        Self::new(self.spec.clone(), self.version())
    }

    pub fn clone_with_version(&self, version: impl Into<String>) -> Self {
        Self::new(self.spec.clone(), version)
    }

    pub async fn start(self: &Arc<Self>) -> OperatorResult<u32> {
        {
            let state = self.lock_state();
            if state.started || state.status == ProcessStatus::Stopped {
                return Err(OperatorError::AlreadyStarted);
            }
        }

        let (sink, stderr) = match &self.spec.output {
            OutputTarget::Inherit => (Arc::new(LogSink::stdout()), Stdio::inherit()),
            OutputTarget::Files { logs, rotation } => {
                let (stdout, stderr) = open_log_writers(logs, *rotation).map_err(|err| {
                    OperatorError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("{err:#}"),
                    ))
                })?;
                (Arc::new(LogSink::file(stdout)), Stdio::from(stderr))
            }
        };

        let mut command = Command::new(&self.spec.program);
        #[cfg(unix)]
        {
            // Own process group so a stop reaches every descendant.
            unsafe {
                command.pre_exec(|| {
                    if nix::libc::setpgid(0, 0) == 0 {
                        Ok(())
                    } else {
                        Err(std::io::Error::last_os_error())
                    }
                });
            }
        }
        command
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                sink.close().await;
                self.set_status(ProcessStatus::Error);
                return Err(OperatorError::Spawn {
                    slug: self.slug(),
                    source,
                });
            }
        };
        let pid = child.id().unwrap_or_default();

        {
            let mut state = self.lock_state();
            state.started = true;
            state.pid = Some(pid);
            state.status = ProcessStatus::Running;
            state.sink = Some(Arc::clone(&sink));
        }
        info!("started process {} with pid {}", self.slug(), pid);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, sink, self.slug()));
        }

        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit {
                    pid,
                    code: status.code(),
                    success: status.success(),
                    wait_error: None,
                    stop_requested: false,
                },
                Err(err) => {
                    error!("wait for pid {} failed: {}", pid, err);
                    ProcessExit {
                        pid,
                        code: None,
                        success: false,
                        wait_error: Some(err.to_string()),
                        stop_requested: false,
                    }
                }
            };
            handle.record_exit(exit);
        });

        Ok(pid)
    }

    pub async fn stop(&self) -> OperatorResult<()> {
        let (live_pid, sink) = {
            let mut state = self.lock_state();
            if state.status == ProcessStatus::Stopped {
                return Err(OperatorError::AlreadyStopped);
            }
            state.status = ProcessStatus::Stopped;
            state.stop_requested = true;
            let exited = self.exit().is_some();
            (state.pid.filter(|_| !exited), state.sink.clone())
        };

        let result = match live_pid {
            Some(pid) => self.terminate(pid).await,
            None => Ok(()),
        };
        if let Some(sink) = sink {
            sink.close().await;
        }
        result
    }

    /// Resolves once the process has exited. Returns immediately for a
    /// handle that never started.
    pub async fn wait(&self) -> Option<ProcessExit> {
        if !self.lock_state().started {
            return None;
        }
        let mut rx = self.exit_watch.subscribe();
        let exit = rx.wait_for(Option::is_some).await.ok()?.clone();
        exit
    }

    async fn terminate(&self, pid: u32) -> OperatorResult<()> {
        let mut exit_rx = self.exit_watch.subscribe();

        if let Err(err) = signal_group(pid, GroupSignal::Interrupt) {
            self.lock_state().status = ProcessStatus::Error;
            return Err(err);
        }

        let grace = self.spec.stop_timeout;
        if timeout(grace, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok()
        {
            debug!("process {} exited after interrupt", pid);
            return Ok(());
        }

        warn!(
            "process {} did not exit within {:?} of SIGINT; sending SIGKILL",
            pid, grace
        );
        signal_group(pid, GroupSignal::Kill)?;
        let _ = exit_rx.wait_for(Option::is_some).await;
        Ok(())
    }

    fn record_exit(&self, mut exit: ProcessExit) {
        {
            let mut state = self.lock_state();
            exit.stop_requested = state.stop_requested;
            if exit.is_failure() && state.status != ProcessStatus::Stopped {
                state.status = ProcessStatus::Error;
            }
        }
        if exit.stop_requested {
            debug!("process {} exited after stop ({})", exit.pid, exit);
        } else if exit.success {
            info!("process {} exited cleanly", self.slug());
        } else {
            warn!("process {} exited with {}", self.slug(), exit);
        }

        self.exit_watch.send_replace(Some(exit.clone()));
        // Capacity 1 and a single exit per handle: never blocks.
        let _ = self.exit_tx.try_send(exit);
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn forward_output<R>(stdout: R, sink: Arc<LogSink>, slug: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                // A closed sink still drains the pipe so the child never blocks.
                let _ = sink.write_line(&line).await;
            }
            Ok(None) => break,
            Err(err) => {
                error!("failed reading output of {}: {}", slug, err);
                sink.close().await;
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> OperatorResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Interrupt => Signal::SIGINT,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(-(pid as i32)), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!(
                "failed to send {:?} to process group of {}: {}",
                signal, pid, err
            );
            match kill(Pid::from_raw(pid as i32), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    return Err(OperatorError::Signal {
                        pid,
                        message: err.to_string(),
                    })
                }
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: GroupSignal) -> OperatorResult<()> {
    Err(OperatorError::Signal {
        pid,
        message: "process groups are not supported on this platform".to_string(),
    })
}
