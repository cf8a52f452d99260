//! Enforcement daemon abstraction.
//!
//! The engine talks to the daemon only through [`EnforcementDaemon`], one
//! method per capability. [`Fail2banClient`] spawns `fail2ban-client`;
//! [`MemoryDaemon`] simulates a daemon in-process for tests and dry runs.

use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{DaemonBackend, DaemonConfig};
use crate::names::JailName;

pub mod cli;
pub mod memory;
pub mod runner;

pub use crate::parser::status::{GlobalStatus, JailStatus};
pub use cli::Fail2banClient;
pub use memory::MemoryDaemon;
pub use runner::{CommandOutput, CommandRunner, RunnerError};

/// Classified daemon failures.
#[derive(Debug, Clone, Error)]
pub enum DaemonError {
    #[error("enforcement client not installed: {0}")]
    NotInstalled(String),
    #[error("enforcement service not running: {0}")]
    ServiceDown(String),
    /// Ambiguous not-OK: the command failed, or there was nothing to do.
    #[error("daemon replied not-OK: {0}")]
    NotOk(String),
    #[error("daemon command timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected daemon output: {0}")]
    Malformed(String),
    #[error("daemon command failed: {0}")]
    Command(String),
}

impl DaemonError {
    /// The daemon cannot be reached at all (as opposed to refusing a command).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::NotInstalled(_) | Self::ServiceDown(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotInstalled(_) => "not_installed",
            Self::ServiceDown(_) => "service_down",
            Self::NotOk(_) => "not_ok",
            Self::Timeout(_) => "timeout",
            Self::Malformed(_) => "malformed",
            Self::Command(_) => "command_failed",
        }
    }
}

/// Jail thresholds as the daemon reports them. Any may be unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JailSettings {
    pub max_retry: Option<i64>,
    pub ban_time: Option<i64>,
    pub find_time: Option<i64>,
}

/// Raw reply to a fire-and-observe command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonReply {
    pub output: String,
}

/// One method per daemon capability.
///
/// Control commands only report whether the daemon accepted them; whether
/// they took effect is only knowable by probing again.
#[async_trait]
pub trait EnforcementDaemon: Send + Sync {
    /// Names of the jails the daemon is currently running.
    async fn global_status(&self) -> Result<GlobalStatus, DaemonError>;

    /// Live status of one jail. `NotOk` when the daemon does not run it.
    async fn jail_status(&self, jail: &JailName) -> Result<JailStatus, DaemonError>;

    /// `maxretry`, `bantime` and `findtime`, each fetched independently.
    async fn jail_settings(&self, jail: &JailName) -> JailSettings;

    async fn start(&self, jail: &JailName) -> Result<DaemonReply, DaemonError>;

    async fn stop(&self, jail: &JailName) -> Result<DaemonReply, DaemonError>;

    async fn unban(&self, jail: &JailName, address: IpAddr) -> Result<DaemonReply, DaemonError>;

    async fn restart(&self) -> Result<DaemonReply, DaemonError>;

    /// `true` when the server answers.
    async fn ping(&self) -> Result<bool, DaemonError>;

    async fn version(&self) -> Result<String, DaemonError>;

    /// Short adapter name for logs and health output.
    fn backend_name(&self) -> &'static str;
}

/// Build the daemon adapter selected in configuration.
pub fn build(config: &DaemonConfig) -> Arc<dyn EnforcementDaemon> {
    match config.backend {
        DaemonBackend::Cli => Arc::new(Fail2banClient::from_config(config)),
        DaemonBackend::Memory => {
            tracing::warn!("using in-memory enforcement daemon; no real bans are enforced");
            Arc::new(MemoryDaemon::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_classification() {
        assert!(DaemonError::NotInstalled("x".into()).is_unreachable());
        assert!(DaemonError::ServiceDown("x".into()).is_unreachable());
        assert!(!DaemonError::NotOk("x".into()).is_unreachable());
        assert!(!DaemonError::Timeout(Duration::from_secs(1)).is_unreachable());
    }

    #[test]
    fn builds_selected_backend() {
        let mut config = DaemonConfig::default();
        assert_eq!(build(&config).backend_name(), "fail2ban-client");
        config.backend = DaemonBackend::Memory;
        assert_eq!(build(&config).backend_name(), "memory");
    }
}
