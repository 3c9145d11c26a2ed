/// Direct proxy launch: clear a stale pid file, run the cache preparation
/// commands, then run the proxy in the foreground until it exits or a
/// shutdown is requested.
use crate::config::LaunchConfig;
use crate::process::{self, ChildState, ProxyProcess, Supervised};
use crate::signals::ShutdownSignal;
use crate::status::{Phase, StatusTracker};
use crate::supervisor::{Outcome, SupervisorError};
use std::path::Path;
use std::time::Duration;

/// Remove `path` if present. Returns whether a file was removed.
fn remove_stale_pid_file(path: &Path) -> Result<bool, SupervisorError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "removed stale pid file");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SupervisorError::PidFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

pub async fn run_launch(
    config: &LaunchConfig,
    poll_interval: Duration,
    stop_grace: Duration,
    shutdown: &ShutdownSignal,
    status: &mut StatusTracker,
) -> Result<Outcome, SupervisorError> {
    status.update(Phase::Starting);
    if let Some(pid_file) = &config.pid_file {
        remove_stale_pid_file(pid_file)?;
    }

    for step in &config.prepare {
        process::run_checked(step).await?;
    }

    if config.settle_secs > 0 {
        tracing::debug!(secs = config.settle_secs, "waiting for cache setup to settle");
        tokio::time::sleep(Duration::from_secs(config.settle_secs)).await;
    }

    let mut proc = ProxyProcess::spawn(&config.proxy)?;
    status.set_child_pid(proc.pid());
    status.update(Phase::Monitoring);
    tracing::info!("waiting for proxy to finish");

    let outcome = loop {
        if let ChildState::Exited(code) = proc.poll()? {
            break Outcome::Completed { code };
        }
        if shutdown.is_requested() {
            break Outcome::Interrupted {
                code: process::stop(&mut proc, stop_grace, shutdown).await?,
            };
        }
        tokio::time::sleep(poll_interval).await;
    };

    tracing::info!(code = outcome.code(), "proxy process exited");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandConfig;
    use tempfile::tempdir;

    fn launch_config(pid_file: Option<&Path>, proxy: &str) -> LaunchConfig {
        LaunchConfig {
            pid_file: pid_file.map(Path::to_path_buf),
            prepare: vec![],
            settle_secs: 0,
            proxy: CommandConfig::new("sh", &["-c", proxy]),
        }
    }

    #[tokio::test]
    async fn test_removes_stale_pid_file_and_reports_exit() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("squid3.pid");
        std::fs::write(&pid_file, "1234\n").unwrap();

        let outcome = run_launch(
            &launch_config(Some(pid_file.as_path()), "exit 4"),
            Duration::from_millis(20),
            Duration::from_secs(5),
            &ShutdownSignal::new(),
            &mut StatusTracker::disabled(),
        )
        .await
        .unwrap();

        assert!(!pid_file.exists());
        assert_eq!(outcome, Outcome::Completed { code: 4 });
    }

    #[test]
    fn test_missing_pid_file_is_fine() {
        let dir = tempdir().unwrap();
        assert!(!remove_stale_pid_file(&dir.path().join("absent.pid")).unwrap());
    }

    #[tokio::test]
    async fn test_prepare_steps_run_in_order() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("steps.log");
        let append = |word: &str| {
            let script = format!("echo {word} >> {}", log.display());
            CommandConfig::new("sh", &["-c", script.as_str()])
        };
        let mut config = launch_config(None, "exit 0");
        config.prepare = vec![append("chown"), append("init-cache")];

        run_launch(
            &config,
            Duration::from_millis(20),
            Duration::from_secs(5),
            &ShutdownSignal::new(),
            &mut StatusTracker::disabled(),
        )
        .await
        .unwrap();

        let contents = std::fs::read_to_string(&log).unwrap();
        assert_eq!(contents, "chown\ninit-cache\n");
    }

    #[tokio::test]
    async fn test_failed_prepare_step_aborts_before_spawn() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let mut config = launch_config(None, &format!("touch {}", marker.display()));
        config.prepare = vec![CommandConfig::new("sh", &["-c", "exit 1"])];

        let err = run_launch(
            &config,
            Duration::from_millis(20),
            Duration::from_secs(5),
            &ShutdownSignal::new(),
            &mut StatusTracker::disabled(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SupervisorError::Process(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_shutdown_terminates_proxy() {
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });

        let outcome = run_launch(
            &launch_config(None, "sleep 30"),
            Duration::from_millis(20),
            Duration::from_secs(5),
            &shutdown,
            &mut StatusTracker::disabled(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Interrupted { code: 143 });
    }

    #[tokio::test]
    async fn test_shutdown_kills_proxy_that_ignores_sigterm() {
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.trigger();
        });

        let outcome = run_launch(
            &launch_config(None, "trap '' TERM; sleep 30 & wait; sleep 30"),
            Duration::from_millis(20),
            Duration::from_millis(300),
            &shutdown,
            &mut StatusTracker::disabled(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Interrupted { code: 137 });
    }
}
