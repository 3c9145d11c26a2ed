/// Port-gated redirect supervision.
///
/// Waits for the proxy to bind its port, installs the redirect for as long as
/// the proxy stays up, and always removes the redirect before reporting the
/// proxy's exit code.
use crate::config::{Config, InstallPolicy};
use crate::probe::is_port_open;
use crate::process::{self, ChildState, ExternalProxy, ProcessError, ProxyProcess, Supervised};
use crate::redirect::{RedirectError, RedirectGuard, RedirectRule, RuleBackend};
use crate::signals::ShutdownSignal;
use crate::status::{Phase, StatusTracker};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-run supervision settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub policy: InstallPolicy,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            port: config.proxy.port,
            poll_interval: config.monitor.poll_interval(),
            stop_grace: config.monitor.stop_grace(),
            policy: config.redirect.on_install_failure,
        }
    }
}

/// How a supervised run ended. Every variant carries the exit code the
/// program should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The proxy exited or its port closed after the redirect region ran.
    Completed { code: i32 },
    /// The proxy exited before its port ever opened. No rule was installed.
    ChildTerminatedEarly { code: i32 },
    /// SIGTERM/SIGINT was received. The proxy was stopped.
    Interrupted { code: i32 },
}

impl Outcome {
    pub fn code(&self) -> i32 {
        match *self {
            Outcome::Completed { code }
            | Outcome::ChildTerminatedEarly { code }
            | Outcome::Interrupted { code } => code,
        }
    }
}

/// Errors that abort a run.
#[derive(Debug)]
pub enum SupervisorError {
    /// Managing packet filter rules requires root.
    Privilege { euid: u32 },
    /// The redirect could not be installed and the policy is `abort`.
    Install(RedirectError),
    /// A child process could not be spawned, polled, or stopped.
    Process(ProcessError),
    /// A stale pid file could not be removed.
    PidFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Privilege { euid } => {
                write!(f, "this must be run as root (effective uid is {euid})")
            }
            SupervisorError::Install(e) => write!(f, "failed to install iptables redirect: {e}"),
            SupervisorError::Process(e) => write!(f, "{e}"),
            SupervisorError::PidFile { path, source } => {
                write!(
                    f,
                    "failed to remove stale pid file {}: {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Privilege { .. } => None,
            SupervisorError::Install(e) => Some(e),
            SupervisorError::Process(e) => Some(e),
            SupervisorError::PidFile { source, .. } => Some(source),
        }
    }
}

impl From<ProcessError> for SupervisorError {
    fn from(e: ProcessError) -> Self {
        SupervisorError::Process(e)
    }
}

/// Fail unless running with an effective uid of 0.
pub fn ensure_root() -> Result<(), SupervisorError> {
    let euid = nix::unistd::geteuid();
    if !euid.is_root() {
        return Err(SupervisorError::Privilege {
            euid: euid.as_raw(),
        });
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum WaitOutcome {
    PortOpen,
    ChildExited(i32),
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum MonitorExit {
    PortClosed,
    ChildExited(i32),
    Shutdown,
}

/// Poll until the port opens, the child exits, or shutdown is requested.
async fn wait_for_port<S: Supervised>(
    proc: &mut S,
    settings: &Settings,
    shutdown: &ShutdownSignal,
) -> Result<WaitOutcome, ProcessError> {
    let mut announced = false;
    loop {
        if shutdown.is_requested() {
            return Ok(WaitOutcome::Shutdown);
        }
        if let ChildState::Exited(code) = proc.poll()? {
            return Ok(WaitOutcome::ChildExited(code));
        }
        if is_port_open(settings.port).await {
            return Ok(WaitOutcome::PortOpen);
        }
        if announced {
            debug!(port = settings.port, "still waiting for port to open");
        } else {
            info!(port = settings.port, "waiting for port to open");
            announced = true;
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

/// Poll while the port is open, the child runs, and no shutdown is requested.
async fn monitor<S: Supervised>(
    proc: &mut S,
    settings: &Settings,
    shutdown: &ShutdownSignal,
) -> Result<MonitorExit, ProcessError> {
    loop {
        if shutdown.is_requested() {
            return Ok(MonitorExit::Shutdown);
        }
        if let ChildState::Exited(code) = proc.poll()? {
            return Ok(MonitorExit::ChildExited(code));
        }
        if !is_port_open(settings.port).await {
            return Ok(MonitorExit::PortClosed);
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

/// Gate `rule` on the liveness of `proc` and its port.
///
/// The rule is installed only after the port opens and is removed exactly
/// once before this returns, whatever ended the monitoring loop. Dropping
/// the returned future mid-flight removes it via the guard's `Drop`.
pub async fn supervise<S: Supervised, B: RuleBackend>(
    proc: &mut S,
    backend: &B,
    rule: RedirectRule,
    settings: &Settings,
    shutdown: &ShutdownSignal,
    status: &mut StatusTracker,
) -> Result<Outcome, SupervisorError> {
    status.update(Phase::WaitingForPort);
    let waited = match wait_for_port(proc, settings, shutdown).await {
        Ok(w) => w,
        Err(e) => {
            stop_after_error(proc, settings, shutdown).await;
            return Err(e.into());
        }
    };

    match waited {
        WaitOutcome::ChildExited(code) => {
            warn!(
                port = settings.port,
                code, "port never opened, proxy must have terminated prematurely"
            );
            return Ok(Outcome::ChildTerminatedEarly { code });
        }
        WaitOutcome::Shutdown => {
            info!("shutdown requested before port opened");
            let code = process::stop(proc, settings.stop_grace, shutdown).await?;
            return Ok(Outcome::Interrupted { code });
        }
        WaitOutcome::PortOpen => {}
    }

    info!(
        port = settings.port,
        "port detected open, setting up iptables redirection"
    );
    status.update(Phase::Installing);
    let mut guard = match RedirectGuard::enter(backend, rule, settings.policy) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "failed to set up iptables redirect, stopping proxy");
            status.update(Phase::Idle);
            stop_after_error(proc, settings, shutdown).await;
            return Err(SupervisorError::Install(e));
        }
    };
    status.set_redirect_active(guard.is_active());
    if guard.is_active() {
        status.update(Phase::Installed);
        status.update(Phase::Monitoring);
    } else {
        status.update(Phase::Degraded);
    }
    let exited = monitor(proc, settings, shutdown).await;

    status.update(Phase::TearingDown);
    if let Err(e) = guard.exit() {
        error!(error = %e, "failed to remove iptables redirect");
    }
    drop(guard);
    status.set_redirect_active(false);
    status.update(Phase::Idle);

    let exited = match exited {
        Ok(x) => x,
        Err(e) => {
            stop_after_error(proc, settings, shutdown).await;
            return Err(e.into());
        }
    };

    let outcome = match exited {
        MonitorExit::ChildExited(code) => Outcome::Completed { code },
        MonitorExit::PortClosed => {
            info!(port = settings.port, "port closed, stopping proxy");
            Outcome::Completed {
                code: process::stop(proc, settings.stop_grace, shutdown).await?,
            }
        }
        MonitorExit::Shutdown => Outcome::Interrupted {
            code: process::stop(proc, settings.stop_grace, shutdown).await?,
        },
    };
    Ok(outcome)
}

/// Best-effort stop used when a run is already failing.
async fn stop_after_error<S: Supervised>(
    proc: &mut S,
    settings: &Settings,
    shutdown: &ShutdownSignal,
) {
    if let Err(e) = process::stop(proc, settings.stop_grace, shutdown).await {
        warn!(error = %e, "failed to stop proxy process");
    }
}

/// `deploy`: build the image, run the container, and supervise it.
pub async fn run_deploy<B: RuleBackend>(
    config: &Config,
    build: bool,
    backend: &B,
    shutdown: &ShutdownSignal,
    status: &mut StatusTracker,
) -> Result<Outcome, SupervisorError> {
    status.update(Phase::Starting);
    if build {
        process::run_checked(&config.container.build).await?;
    }

    let mut proc = ProxyProcess::spawn(&config.container.run)?;
    status.set_child_pid(proc.pid());

    let rule = RedirectRule::from_config(&config.redirect);
    let settings = Settings::from_config(config);
    let outcome = supervise(&mut proc, backend, rule, &settings, shutdown, status).await?;

    info!(
        command = proc.command(),
        code = outcome.code(),
        "container process exited"
    );
    Ok(outcome)
}

/// `intercept`: the proxy is managed elsewhere; only its port is watched.
pub async fn run_intercept<B: RuleBackend>(
    config: &Config,
    backend: &B,
    shutdown: &ShutdownSignal,
    status: &mut StatusTracker,
) -> Result<Outcome, SupervisorError> {
    status.update(Phase::Starting);
    let rule = RedirectRule::from_config(&config.redirect);
    let settings = Settings::from_config(config);
    supervise(&mut ExternalProxy, backend, rule, &settings, shutdown, status).await
}
