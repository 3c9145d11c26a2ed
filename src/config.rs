use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from squid-in-a-can.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub container: ContainerConfig,
    pub redirect: RedirectConfig,
    pub monitor: MonitorConfig,
    pub launch: LaunchConfig,
    pub status: StatusConfig,
}

/// The local proxy whose port gates the redirect.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
}

/// An external command: program plus arguments, no shell involved.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub build: CommandConfig,
    pub run: CommandConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub iptables: String,
    pub table: String,
    pub chain: String,
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    /// Pass `-w` so iptables waits for the xtables lock instead of failing.
    pub wait_for_lock: bool,
    pub on_install_failure: InstallPolicy,
}

/// What to do when the redirect rule cannot be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Stop the proxy and exit with an error.
    #[default]
    Abort,
    /// Warn and keep supervising the proxy without redirection.
    Degrade,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// Seconds a proxy gets to exit after SIGTERM before it is killed.
    pub stop_grace_secs: u64,
}

/// Direct proxy launch (no container).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub pid_file: Option<PathBuf>,
    pub prepare: Vec<CommandConfig>,
    pub settle_secs: u64,
    pub proxy: CommandConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    pub file: Option<PathBuf>,
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        key: &'static str,
        message: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid { key, message } => write!(f, "invalid {key}: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl Config {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the poll loops spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "monitor.poll_interval_secs",
                message: "must be at least 1",
            });
        }
        Ok(())
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl CommandConfig {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for CommandConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// --- Default implementations ---

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { port: 3128 }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            build: CommandConfig::new("docker", &["build", "-t", "local-squid-in-a-can", "."]),
            run: CommandConfig::new("docker", &["run", "--net", "host", "local-squid-in-a-can"]),
        }
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            table: "nat".to_string(),
            chain: "PREROUTING".to_string(),
            protocol: "tcp".to_string(),
            from_port: 80,
            to_port: 3129,
            wait_for_lock: true,
            on_install_failure: InstallPolicy::Abort,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            stop_grace_secs: 10,
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            pid_file: Some(PathBuf::from("/run/squid3.pid")),
            prepare: vec![
                CommandConfig::new("chown", &["-R", "proxy:proxy", "/var/cache/squid3"]),
                CommandConfig::new("squid3", &["-Nz"]),
            ],
            settle_secs: 0,
            proxy: CommandConfig::new("squid3", &["-N"]),
        }
    }
}
