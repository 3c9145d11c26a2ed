/// Child process lifecycle: spawn the proxy (or container), poll it without
/// blocking, terminate its process group, and collect its exit code.
use crate::config::CommandConfig;
use crate::signals::ShutdownSignal;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Observed state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Exited(i32),
}

/// Errors that can occur while managing child processes.
#[derive(Debug)]
pub enum ProcessError {
    /// Failed to spawn the subprocess.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to query the child's status.
    Poll { source: std::io::Error },
    /// Failed while waiting for the child to exit.
    Wait { source: std::io::Error },
    /// Failed to deliver a signal to the child's process group.
    Signal { pid: u32, source: Errno },
    /// A check-call style command exited non-zero.
    CommandFailed { command: String, code: i32 },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { command, source } => {
                write!(f, "failed to spawn '{command}': {source}")
            }
            ProcessError::Poll { source } => write!(f, "failed to poll child process: {source}"),
            ProcessError::Wait { source } => {
                write!(f, "failed to wait for child process: {source}")
            }
            ProcessError::Signal { pid, source } => {
                write!(f, "failed to signal process group {pid}: {source}")
            }
            ProcessError::CommandFailed { command, code } => {
                write!(f, "'{command}' exited with status {code}")
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
            ProcessError::Poll { source } => Some(source),
            ProcessError::Wait { source } => Some(source),
            ProcessError::Signal { source, .. } => Some(source),
            ProcessError::CommandFailed { .. } => None,
        }
    }
}

/// Exit code as a shell would report it: the status code, or 128+N when the
/// process was killed by signal N.
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Something whose liveness gates the redirect.
#[allow(async_fn_in_trait)]
pub trait Supervised {
    fn poll(&mut self) -> Result<ChildState, ProcessError>;

    /// Ask the process to stop. Must tolerate a process that already exited.
    fn terminate(&mut self) -> Result<(), ProcessError>;

    /// Stop the process unconditionally.
    fn kill(&mut self) -> Result<(), ProcessError>;

    /// Wait for the process to exit and return its exit code.
    async fn wait(&mut self) -> Result<i32, ProcessError>;
}

/// A proxy (or container) spawned and owned by this process.
pub struct ProxyProcess {
    child: Child,
    pid: u32,
    command: String,
}

impl ProxyProcess {
    /// Spawn `config` with inherited stdio in a new process group, so
    /// `terminate` reaches everything it forks.
    pub fn spawn(config: &CommandConfig) -> Result<Self, ProcessError> {
        let command = config.to_string();
        tracing::info!(command = %command, "spawning proxy process");

        let child = Command::new(&config.command)
            .args(&config.args)
            .process_group(0)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "proxy process started");

        Ok(Self {
            child,
            pid,
            command,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn signal_group(&self, signal: Signal) -> Result<(), ProcessError> {
        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::Signal {
                pid: self.pid,
                source: e,
            }),
        }
    }
}

impl Supervised for ProxyProcess {
    fn poll(&mut self) -> Result<ChildState, ProcessError> {
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(ChildState::Exited(exit_code(status))),
            Ok(None) => Ok(ChildState::Running),
            Err(e) => Err(ProcessError::Poll { source: e }),
        }
    }

    fn terminate(&mut self) -> Result<(), ProcessError> {
        if let ChildState::Exited(_) = self.poll()? {
            return Ok(());
        }
        tracing::info!(pid = self.pid, "sending SIGTERM to proxy process group");
        self.signal_group(Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        tracing::warn!(pid = self.pid, "sending SIGKILL to proxy process group");
        self.signal_group(Signal::SIGKILL)
    }

    async fn wait(&mut self) -> Result<i32, ProcessError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::Wait { source: e })?;
        Ok(exit_code(status))
    }
}

/// A proxy started by someone else (e.g. the container's own init). Only
/// its port is observable, so it is always considered running.
#[derive(Debug, Default)]
pub struct ExternalProxy;

impl Supervised for ExternalProxy {
    fn poll(&mut self) -> Result<ChildState, ProcessError> {
        Ok(ChildState::Running)
    }

    fn terminate(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn wait(&mut self) -> Result<i32, ProcessError> {
        Ok(0)
    }
}

/// How often `stop` rechecks the force flag while waiting out the grace.
const FORCE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Terminate `proc` and collect its exit code.
///
/// SIGKILL follows once `grace` elapses or `shutdown` is forced, so a proxy
/// that ignores SIGTERM cannot stall the exit.
pub async fn stop<S: Supervised>(
    proc: &mut S,
    grace: Duration,
    shutdown: &ShutdownSignal,
) -> Result<i32, ProcessError> {
    proc.terminate()?;
    let deadline = Instant::now() + grace;
    loop {
        let step = FORCE_CHECK_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
        tokio::select! {
            code = proc.wait() => return code,
            _ = tokio::time::sleep(step) => {}
        }
        if shutdown.is_forced() || Instant::now() >= deadline {
            break;
        }
    }
    tracing::warn!(grace_secs = grace.as_secs_f64(), "proxy ignored SIGTERM");
    proc.kill()?;
    proc.wait().await
}

/// Run `config` to completion, failing on a non-zero exit.
pub async fn run_checked(config: &CommandConfig) -> Result<(), ProcessError> {
    let command = config.to_string();
    tracing::info!(command = %command, "running");

    let status = Command::new(&config.command)
        .args(&config.args)
        .status()
        .await
        .map_err(|e| ProcessError::Spawn {
            command: command.clone(),
            source: e,
        })?;

    if !status.success() {
        return Err(ProcessError::CommandFailed {
            command,
            code: exit_code(status),
        });
    }
    Ok(())
}
