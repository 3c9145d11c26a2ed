/// Status file: writes the supervisor's lifecycle phase as JSON on every
/// transition, so operators can see whether a redirect is currently live.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Supervisor phases written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    WaitingForPort,
    Installing,
    Installed,
    Monitoring,
    /// Monitoring without a redirect: install failed under `degrade`.
    Degraded,
    TearingDown,
    Idle,
    Exited,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub phase: Phase,
    pub port: u16,
    pub child_pid: Option<u32>,
    pub redirect: String,
    pub redirect_active: bool,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

/// Publishes the supervisor's phase. A tracker without a path records
/// nothing.
pub struct StatusTracker {
    path: Option<PathBuf>,
    pid: u32,
    port: u16,
    redirect: String,
    child_pid: Option<u32>,
    redirect_active: bool,
    started_at: DateTime<Utc>,
    exit_code: Option<i32>,
}

impl StatusTracker {
    pub fn new(path: Option<PathBuf>, port: u16, redirect: String) -> Self {
        Self {
            path,
            pid: std::process::id(),
            port,
            redirect,
            child_pid: None,
            redirect_active: false,
            started_at: Utc::now(),
            exit_code: None,
        }
    }

    /// Tracker that records nothing.
    pub fn disabled() -> Self {
        Self::new(None, 0, String::new())
    }

    fn snapshot(&self, phase: Phase) -> StatusData {
        StatusData {
            pid: self.pid,
            phase,
            port: self.port,
            child_pid: self.child_pid,
            redirect: self.redirect.clone(),
            redirect_active: self.redirect_active,
            started_at: self.started_at,
            last_update: Utc::now(),
            exit_code: self.exit_code,
        }
    }

    /// Record a phase transition. Write failures are logged, never fatal.
    pub fn update(&self, phase: Phase) {
        tracing::debug!(?phase, "phase transition");
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = publish(path, &self.snapshot(phase)) {
            tracing::warn!(error = %e, "status not published");
        }
    }

    pub fn set_child_pid(&mut self, pid: u32) {
        self.child_pid = Some(pid);
    }

    pub fn set_redirect_active(&mut self, active: bool) {
        self.redirect_active = active;
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    pub fn remove(&self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Sibling of `path` that `publish` stages into before renaming.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}", std::process::id()))
}

/// Replace `path` with `data` in one rename, so a reader sees the previous
/// phase or the new one and never a torn file.
fn publish(path: &Path, data: &StatusData) -> Result<(), StatusError> {
    let json = serde_json::to_vec_pretty(data).map_err(StatusError::Encode)?;
    let staged = staging_path(path);
    std::fs::write(&staged, json).map_err(|source| StatusError::Io {
        path: staged.clone(),
        source,
    })?;
    std::fs::rename(&staged, path).map_err(|source| {
        let _ = std::fs::remove_file(&staged);
        StatusError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[derive(Debug)]
pub enum StatusError {
    Encode(serde_json::Error),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Encode(e) => write!(f, "cannot encode status as JSON: {e}"),
            StatusError::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(e) => Some(e),
            StatusError::Io { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_json(path: &Path) -> serde_json::Value {
        let contents = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    #[test]
    fn test_publish_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("squid-in-a-can.status");
        let mut tracker = StatusTracker::new(
            Some(path.clone()),
            3128,
            "iptables -t nat -A PREROUTING".to_string(),
        );
        tracker.set_child_pid(4242);
        tracker.set_redirect_active(true);
        tracker.update(Phase::Monitoring);

        let parsed = read_json(&path);
        assert_eq!(parsed["pid"], std::process::id());
        assert_eq!(parsed["phase"], "monitoring");
        assert_eq!(parsed["port"], 3128);
        assert_eq!(parsed["child_pid"], 4242);
        assert_eq!(parsed["redirect_active"], true);
        assert!(parsed["exit_code"].is_null());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("squid-in-a-can.status")]);
    }

    #[test]
    fn test_all_phases_serialize() {
        let phases = vec![
            (Phase::Starting, "starting"),
            (Phase::WaitingForPort, "waiting_for_port"),
            (Phase::Installing, "installing"),
            (Phase::Installed, "installed"),
            (Phase::Monitoring, "monitoring"),
            (Phase::Degraded, "degraded"),
            (Phase::TearingDown, "tearing_down"),
            (Phase::Idle, "idle"),
            (Phase::Exited, "exited"),
        ];

        for (phase, expected) in phases {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{expected}\""));
        }
    }

    #[test]
    fn test_tracker_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("squid-in-a-can.status");
        let mut tracker = StatusTracker::new(Some(path.clone()), 3128, "redirect".to_string());

        tracker.update(Phase::WaitingForPort);
        assert_eq!(read_json(&path)["phase"], "waiting_for_port");

        tracker.set_child_pid(99);
        tracker.set_redirect_active(true);
        tracker.update(Phase::Monitoring);
        let parsed = read_json(&path);
        assert_eq!(parsed["phase"], "monitoring");
        assert_eq!(parsed["child_pid"], 99);
        assert_eq!(parsed["redirect_active"], true);

        tracker.set_redirect_active(false);
        tracker.set_exit_code(137);
        tracker.update(Phase::Exited);
        let parsed = read_json(&path);
        assert_eq!(parsed["redirect_active"], false);
        assert_eq!(parsed["exit_code"], 137);

        tracker.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_disabled_tracker_writes_nothing() {
        let tracker = StatusTracker::disabled();
        tracker.update(Phase::Monitoring);
        tracker.remove();
    }

    #[test]
    fn test_unwritable_directory_is_reported() {
        let path = PathBuf::from("/nonexistent/dir/squid-in-a-can.status");
        let tracker = StatusTracker::new(Some(path.clone()), 3128, String::new());
        let err = publish(&path, &tracker.snapshot(Phase::Starting)).unwrap_err();
        assert!(matches!(err, StatusError::Io { .. }));
        assert!(err.to_string().starts_with("/nonexistent/dir/.squid-in-a-can.status."));

        // update() only logs.
        tracker.update(Phase::Starting);
        assert!(!path.exists());
    }
}
