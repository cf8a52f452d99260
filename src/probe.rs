//! Runtime state probe.
//!
//! Turns the daemon's ambiguous answers into a definite state per jail:
//!
//! | daemon answer            | result                               |
//! |--------------------------|--------------------------------------|
//! | status parsed            | enabled, with bans and settings      |
//! | not-OK / does not exist  | disabled, not an error               |
//! | timeout                  | disabled, plus an operator warning   |
//! | anything else            | error, caller picks the fallback     |

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, warn};

use crate::daemon::{DaemonError, EnforcementDaemon};
use crate::names::JailName;
use crate::telemetry::{ProbeTimer, spans};

/// Whether a jail is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Enabled,
    Disabled,
}

impl RunState {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled { Self::Enabled } else { Self::Disabled }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }

    pub fn negate(self) -> Self {
        match self {
            Self::Enabled => Self::Disabled,
            Self::Disabled => Self::Enabled,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
        })
    }
}

/// Live state of one jail. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeJailState {
    pub enabled: bool,
    pub currently_banned: u64,
    pub banned_addresses: Vec<String>,
    pub total_banned: Option<u64>,
    pub currently_failed: u64,
    pub total_failed: u64,
    pub max_retry: Option<i64>,
    pub ban_time: Option<i64>,
    pub find_time: Option<i64>,
}

impl RuntimeJailState {
    /// A stopped jail: no live bans by definition.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_enabled(self.enabled)
    }

    /// Enforce `enabled == false => no bans`.
    fn normalized(mut self) -> Self {
        if !self.enabled {
            self.currently_banned = 0;
            self.banned_addresses.clear();
        }
        self
    }
}

/// A probe result plus anything the operator should hear about.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub state: RuntimeJailState,
    /// Set when the state is an assumption rather than an observation.
    pub warning: Option<String>,
}

/// Asks the daemon about single jails.
#[derive(Clone)]
pub struct RuntimeStateProbe {
    daemon: Arc<dyn EnforcementDaemon>,
    timeout: Duration,
}

impl RuntimeStateProbe {
    pub fn new(daemon: Arc<dyn EnforcementDaemon>, timeout: Duration) -> Self {
        Self { daemon, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe status only; settings are skipped. Used for verification.
    pub async fn probe(&self, jail: &JailName) -> Result<ProbeReport, DaemonError> {
        self.run(jail, false).instrument(spans::jail(jail.as_str())).await
    }

    /// Probe status and, for a running jail, its thresholds.
    pub async fn probe_detailed(&self, jail: &JailName) -> Result<ProbeReport, DaemonError> {
        self.run(jail, true).instrument(spans::jail(jail.as_str())).await
    }

    async fn run(&self, jail: &JailName, with_settings: bool) -> Result<ProbeReport, DaemonError> {
        let mut timer = ProbeTimer::new();

        // Adapters carry their own timeout; this one bounds in-process ones too.
        let status = match tokio::time::timeout(self.timeout, self.daemon.jail_status(jail)).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::Timeout(self.timeout)),
        };

        match status {
            Ok(status) => {
                let mut state = RuntimeJailState {
                    enabled: true,
                    currently_banned: status.currently_banned,
                    banned_addresses: status.banned_addresses,
                    total_banned: status.total_banned,
                    currently_failed: status.currently_failed,
                    total_failed: status.total_failed,
                    ..RuntimeJailState::default()
                };
                // The count line and the list can disagree mid-update; trust the list when present.
                if !state.banned_addresses.is_empty() {
                    state.currently_banned = state.banned_addresses.len() as u64;
                }
                if with_settings {
                    let settings = match tokio::time::timeout(self.timeout, self.daemon.jail_settings(jail)).await {
                        Ok(s) => s,
                        Err(_) => {
                            debug!(jail = %jail, "settings query timed out");
                            Default::default()
                        }
                    };
                    state.max_retry = settings.max_retry;
                    state.ban_time = settings.ban_time;
                    state.find_time = settings.find_time;
                }
                timer.finish("enabled");
                Ok(ProbeReport {
                    state: state.normalized(),
                    warning: None,
                })
            }
            Err(DaemonError::NotOk(msg)) => {
                debug!(jail = %jail, reply = %msg, "daemon does not run jail; treating as disabled");
                timer.finish("disabled");
                Ok(ProbeReport {
                    state: RuntimeJailState::disabled(),
                    warning: None,
                })
            }
            Err(DaemonError::Timeout(after)) => {
                let note = format!(
                    "status probe for jail '{jail}' timed out after {}ms; assuming disabled",
                    after.as_millis()
                );
                warn!(jail = %jail, timeout_ms = after.as_millis() as u64, "probe timed out; assuming disabled");
                timer.finish("timeout");
                Ok(ProbeReport {
                    state: RuntimeJailState::disabled(),
                    warning: Some(note),
                })
            }
            Err(e) => {
                debug!(jail = %jail, error = %e, "probe failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{JailSettings, MemoryDaemon};
    use std::time::Instant;

    fn jail(name: &str) -> JailName {
        JailName::parse(name).unwrap()
    }

    fn probe_over(daemon: &Arc<MemoryDaemon>, timeout_ms: u64) -> RuntimeStateProbe {
        RuntimeStateProbe::new(daemon.clone(), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn running_jail_reports_bans_and_settings() {
        let daemon = Arc::new(MemoryDaemon::new());
        daemon.add_jail("sshd", true);
        daemon.ban("sshd", "192.0.2.1");
        daemon.ban("sshd", "192.0.2.2");
        daemon.set_settings(
            "sshd",
            JailSettings {
                max_retry: Some(5),
                ban_time: Some(600),
                find_time: None,
            },
        );

        let report = probe_over(&daemon, 1000).probe_detailed(&jail("sshd")).await.unwrap();
        assert!(report.warning.is_none());
        assert!(report.state.enabled);
        assert_eq!(report.state.currently_banned, 2);
        assert_eq!(report.state.banned_addresses, vec!["192.0.2.1", "192.0.2.2"]);
        assert_eq!(report.state.max_retry, Some(5));
        assert_eq!(report.state.find_time, None);
    }

    #[tokio::test]
    async fn not_ok_means_disabled() {
        let daemon = Arc::new(MemoryDaemon::new());
        daemon.add_jail("nginx-404", false);
        let report = probe_over(&daemon, 1000).probe(&jail("nginx-404")).await.unwrap();
        assert_eq!(report.state.run_state(), RunState::Disabled);
        assert_eq!(report.state.currently_banned, 0);
        assert!(report.warning.is_none());
    }

    #[tokio::test]
    async fn timeout_assumes_disabled_within_bound() {
        let daemon = Arc::new(MemoryDaemon::new());
        daemon.add_jail("slow", true);
        daemon.ban("slow", "192.0.2.5");
        daemon.stall("slow", Duration::from_secs(5));

        let start = Instant::now();
        let report = probe_over(&daemon, 100).probe(&jail("slow")).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!report.state.enabled);
        assert!(report.state.banned_addresses.is_empty());
        assert!(report.warning.unwrap().contains("assuming disabled"));
    }

    #[tokio::test]
    async fn other_failures_propagate() {
        let daemon = Arc::new(MemoryDaemon::new());
        daemon.add_jail("sshd", true);
        daemon.fail_status("sshd", Some(DaemonError::Malformed("garbage".into())));
        let err = probe_over(&daemon, 1000).probe(&jail("sshd")).await.unwrap_err();
        assert!(matches!(err, DaemonError::Malformed(_)));

        daemon.fail_status("sshd", None);
        daemon.set_running(false);
        let err = probe_over(&daemon, 1000).probe(&jail("sshd")).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[test]
    fn run_state_helpers() {
        assert_eq!(RunState::Enabled.negate(), RunState::Disabled);
        assert_eq!(RunState::Disabled.to_string(), "DISABLED");
        assert_eq!(serde_json::to_value(RunState::Enabled).unwrap(), "ENABLED");
    }
}
