/// Packet redirect rule and its scoped guard.
///
/// `RedirectGuard` ties the lifetime of one iptables REDIRECT rule to a scope:
/// `enter()` installs it, `exit()` removes it, and `Drop` removes it on any
/// path that skipped `exit()` (panic, `?` early return, dropped future).
use crate::config::{InstallPolicy, RedirectConfig};
use std::process::Command;
use tracing::{debug, error, info, warn};

/// Whether a rule is being appended or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Append,
    Delete,
}

impl RuleOp {
    fn flag(self) -> &'static str {
        match self {
            RuleOp::Append => "-A",
            RuleOp::Delete => "-D",
        }
    }
}

/// A NAT redirect of inbound `from_port` traffic to local `to_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    pub table: String,
    pub chain: String,
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    pub wait_for_lock: bool,
}

impl RedirectRule {
    pub fn from_config(config: &RedirectConfig) -> Self {
        Self {
            table: config.table.clone(),
            chain: config.chain.clone(),
            protocol: config.protocol.clone(),
            from_port: config.from_port,
            to_port: config.to_port,
            wait_for_lock: config.wait_for_lock,
        }
    }

    /// iptables arguments for the given operation. Append and delete differ
    /// only in the `-A`/`-D` flag so a delete always matches what was added.
    pub fn args(&self, op: RuleOp) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.clone(),
            op.flag().to_string(),
            self.chain.clone(),
            "-p".to_string(),
            self.protocol.clone(),
            "--dport".to_string(),
            self.from_port.to_string(),
            "-j".to_string(),
            "REDIRECT".to_string(),
            "--to".to_string(),
            self.to_port.to_string(),
        ];
        if self.wait_for_lock {
            args.push("-w".to_string());
        }
        args
    }
}

/// Errors from the packet-filtering subsystem.
#[derive(Debug)]
pub enum RedirectError {
    /// The filter tool could not be started at all.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The filter tool ran and reported failure.
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for RedirectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedirectError::Spawn { command, source } => {
                write!(f, "failed to run '{command}': {source}")
            }
            RedirectError::Failed {
                command,
                code,
                stderr,
            } => {
                match code {
                    Some(c) => write!(f, "'{command}' exited with status {c}")?,
                    None => write!(f, "'{command}' was killed by a signal")?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RedirectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RedirectError::Spawn { source, .. } => Some(source),
            RedirectError::Failed { .. } => None,
        }
    }
}

/// The packet-filtering subsystem, reduced to install/remove.
pub trait RuleBackend {
    /// Printable command line for `op`, used in logs and `--dry-run`.
    fn describe(&self, rule: &RedirectRule, op: RuleOp) -> String;

    fn install(&self, rule: &RedirectRule) -> Result<(), RedirectError>;

    fn remove(&self, rule: &RedirectRule) -> Result<(), RedirectError>;
}

/// Production backend: shells out to `iptables`.
#[derive(Debug, Clone)]
pub struct Iptables {
    program: String,
}

impl Iptables {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, rule: &RedirectRule, op: RuleOp) -> Result<(), RedirectError> {
        let command = self.describe(rule, op);
        debug!(command = %command, "running");

        let output = Command::new(&self.program)
            .args(rule.args(op))
            .output()
            .map_err(|e| RedirectError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(RedirectError::Failed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl RuleBackend for Iptables {
    fn describe(&self, rule: &RedirectRule, op: RuleOp) -> String {
        format!("{} {}", self.program, rule.args(op).join(" "))
    }

    fn install(&self, rule: &RedirectRule) -> Result<(), RedirectError> {
        self.run(rule, RuleOp::Append)
    }

    fn remove(&self, rule: &RedirectRule) -> Result<(), RedirectError> {
        self.run(rule, RuleOp::Delete)
    }
}

/// Scoped ownership of one installed redirect rule.
pub struct RedirectGuard<'a, B: RuleBackend> {
    backend: &'a B,
    rule: RedirectRule,
    installed: bool,
}

impl<'a, B: RuleBackend> RedirectGuard<'a, B> {
    /// Install the rule.
    ///
    /// Under `InstallPolicy::Abort` an install failure is returned. Under
    /// `InstallPolicy::Degrade` it is logged and an inactive guard is
    /// returned, which never issues a remove.
    pub fn enter(
        backend: &'a B,
        rule: RedirectRule,
        policy: InstallPolicy,
    ) -> Result<Self, RedirectError> {
        info!(
            command = %backend.describe(&rule, RuleOp::Append),
            "enabling iptables redirect"
        );
        let mut guard = Self {
            backend,
            rule,
            installed: false,
        };
        match backend.install(&guard.rule) {
            Ok(()) => {
                guard.installed = true;
                Ok(guard)
            }
            Err(e) => match policy {
                InstallPolicy::Abort => Err(e),
                InstallPolicy::Degrade => {
                    warn!(
                        error = %e,
                        command = %backend.describe(&guard.rule, RuleOp::Append),
                        "failed to set up iptables redirect, continuing without it; \
                         run with --privileged or apply the command manually"
                    );
                    Ok(guard)
                }
            },
        }
    }

    /// True while teardown is owed.
    pub fn is_active(&self) -> bool {
        self.installed
    }

    /// Remove the rule if this guard installed it. Idempotent.
    ///
    /// The owed flag is cleared before the remove runs, so a failed remove is
    /// reported once and never retried from `Drop`.
    pub fn exit(&mut self) -> Result<(), RedirectError> {
        if !self.installed {
            return Ok(());
        }
        self.installed = false;
        info!(
            command = %self.backend.describe(&self.rule, RuleOp::Delete),
            "disabling iptables redirect"
        );
        self.backend.remove(&self.rule)
    }
}

impl<B: RuleBackend> Drop for RedirectGuard<'_, B> {
    fn drop(&mut self) {
        if self.installed {
            if let Err(e) = self.exit() {
                error!(error = %e, "failed to remove iptables redirect");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Backend that counts calls instead of touching the kernel.
    #[derive(Default)]
    pub struct RecordingBackend {
        pub installs: AtomicUsize,
        pub removes: AtomicUsize,
        pub fail_install: AtomicBool,
        pub fail_remove: AtomicBool,
    }

    impl RecordingBackend {
        pub fn failing_install() -> Self {
            let backend = Self::default();
            backend.fail_install.store(true, Ordering::SeqCst);
            backend
        }

        pub fn installs(&self) -> usize {
            self.installs.load(Ordering::SeqCst)
        }

        pub fn removes(&self) -> usize {
            self.removes.load(Ordering::SeqCst)
        }
    }

    impl RuleBackend for RecordingBackend {
        fn describe(&self, rule: &RedirectRule, op: RuleOp) -> String {
            format!("recording {}", rule.args(op).join(" "))
        }

        fn install(&self, rule: &RedirectRule) -> Result<(), RedirectError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self.fail_install.load(Ordering::SeqCst) {
                return Err(RedirectError::Failed {
                    command: self.describe(rule, RuleOp::Append),
                    code: Some(4),
                    stderr: "Permission denied (you must be root)".to_string(),
                });
            }
            Ok(())
        }

        fn remove(&self, rule: &RedirectRule) -> Result<(), RedirectError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(RedirectError::Failed {
                    command: self.describe(rule, RuleOp::Delete),
                    code: Some(1),
                    stderr: "Bad rule (does a matching rule exist in that chain?)".to_string(),
                });
            }
            Ok(())
        }
    }

    pub fn default_rule() -> RedirectRule {
        RedirectRule::from_config(&RedirectConfig::default())
    }
}
