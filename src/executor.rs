//! Control actions with post-condition verification.
//!
//! Every action walks `Idle -> Dispatched -> Verifying -> Succeeded|Failed`.
//! The daemon's reply never decides success on its own; a fresh probe after
//! a settle delay does. A not-OK reply is absorbed when the jail ends up in
//! the state it was in before the command, which is what a redundant
//! start or stop looks like.

use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info, warn};

use crate::audit::AuditLog;
use crate::config::ActionsConfig;
use crate::daemon::{DaemonError, EnforcementDaemon};
use crate::discovery::{DiscoverySource, JailDiscovery};
use crate::error::{EngineError, EngineResult, PreflightFailure, VerificationFailure};
use crate::metrics;
use crate::names::{JailName, parse_address};
use crate::parser::excerpt;
use crate::probe::{ProbeReport, RunState, RuntimeJailState, RuntimeStateProbe};
use crate::telemetry::spans;

/// Daemon output kept in outcomes and failure details.
const RAW_OUTPUT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Dispatched,
    Verifying,
    Succeeded,
    Failed,
}

/// Result of a verified action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub success: bool,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_state: Option<RunState>,
    /// A not-OK reply was treated as "already in that state".
    pub nok_ignored: bool,
    pub phases: Vec<Phase>,
    pub message: String,
    pub raw_output: String,
}

/// How the dispatch step ended, when it did not end the action.
struct Dispatch {
    raw: String,
    nok: bool,
}

pub struct ActionExecutor {
    daemon: Arc<dyn EnforcementDaemon>,
    probe: RuntimeStateProbe,
    discovery: Arc<JailDiscovery>,
    audit: Arc<AuditLog>,
    settle_delay: Duration,
    restart_settle: Duration,
    restart_attempts: u32,
}

impl ActionExecutor {
    pub fn new(
        daemon: Arc<dyn EnforcementDaemon>,
        probe: RuntimeStateProbe,
        discovery: Arc<JailDiscovery>,
        audit: Arc<AuditLog>,
        config: &ActionsConfig,
    ) -> Self {
        Self {
            daemon,
            probe,
            discovery,
            audit,
            settle_delay: config.settle_delay(),
            restart_settle: config.restart_settle(),
            restart_attempts: config.restart_verify_attempts.max(1),
        }
    }

    pub async fn enable(&self, jail: &str, strict: bool) -> EngineResult<ActionOutcome> {
        self.set_state(jail, RunState::Enabled, strict).await
    }

    pub async fn disable(&self, jail: &str, strict: bool) -> EngineResult<ActionOutcome> {
        self.set_state(jail, RunState::Disabled, strict).await
    }

    /// Flip the jail's current state.
    pub async fn toggle(&self, jail: &str, strict: bool) -> EngineResult<ActionOutcome> {
        let name = JailName::parse(jail)?;
        let current = self.current_state(&name).await?;
        debug!(jail = %name, current = %current, "toggle");
        self.set_state(jail, current.negate(), strict).await
    }

    /// Start or stop a jail and verify it got there.
    pub async fn set_state(&self, jail: &str, target: RunState, strict: bool) -> EngineResult<ActionOutcome> {
        let action = match target {
            RunState::Enabled => "start",
            RunState::Disabled => "stop",
        };
        let name = JailName::parse(jail)?;
        let subject = self.audit.attempt(action, Some(name.as_str()), None).await;
        let span = spans::action(action, Some(name.as_str()), &subject.request_id.to_string());

        let result = self.transition(&name, action, target, strict).instrument(span).await;
        self.finish(&subject, action, &result).await;
        result
    }

    async fn transition(
        &self,
        name: &JailName,
        action: &'static str,
        target: RunState,
        strict: bool,
    ) -> EngineResult<ActionOutcome> {
        let mut phases = vec![Phase::Idle];
        let before = self.current_state(name).await?;

        if target.is_enabled() {
            self.preflight(name).await?;
        }

        phases.push(Phase::Dispatched);
        let reply = match target {
            RunState::Enabled => self.daemon.start(name).await,
            RunState::Disabled => self.daemon.stop(name).await,
        };
        let dispatch = absorb(reply, strict)?;

        phases.push(Phase::Verifying);
        tokio::time::sleep(self.settle_delay).await;
        let after = self.current_state(name).await?;

        // Second clause: a refused stop on a stopped jail (or start on a running one).
        if after == target || (dispatch.nok && after == before) {
            phases.push(Phase::Succeeded);
            let message = if dispatch.nok {
                format!("jail {name} already {after}; daemon reply ignored")
            } else {
                format!("jail {name} is now {after}")
            };
            info!(jail = %name, action, final_state = %after, nok_ignored = dispatch.nok, "action verified");
            return Ok(ActionOutcome {
                success: true,
                action,
                jail: Some(name.to_string()),
                final_state: Some(after),
                nok_ignored: dispatch.nok,
                phases,
                message,
                raw_output: dispatch.raw,
            });
        }

        phases.push(Phase::Failed);
        warn!(jail = %name, action, target = %target, actual = %after, "action did not converge");
        let likely_cause = match (target, dispatch.nok) {
            (RunState::Enabled, true) => {
                "daemon refused to start the jail; its filter, action or log path is probably invalid"
            }
            (RunState::Enabled, false) => {
                "jail stopped again right after starting; the daemon likely failed to open its log or filter"
            }
            (RunState::Disabled, true) => "daemon refused to stop a jail that is still running",
            (RunState::Disabled, false) => "daemon accepted the stop but the jail is still running",
        };
        Err(EngineError::ActionVerificationFailed(Box::new(VerificationFailure {
            action,
            subject: name.to_string(),
            target: target.to_string(),
            actual: after.to_string(),
            raw_output: dispatch.raw,
            likely_cause: likely_cause.to_string(),
            suggested_check: format!(
                "run `fail2ban-client status {name}` and look for errors about '{name}' in the daemon log"
            ),
        })))
    }

    /// Refuse to start a jail whose filter file is missing.
    async fn preflight(&self, name: &JailName) -> EngineResult<()> {
        let discovery = match self.discovery.discover().await {
            Ok(d) if d.source == DiscoverySource::Config => d,
            Ok(_) => {
                debug!(jail = %name, "no readable configuration; skipping filter check");
                return Ok(());
            }
            Err(e) => {
                debug!(jail = %name, error = %e, "discovery failed; skipping filter check");
                return Ok(());
            }
        };
        let def = discovery.definition(name);
        let filter = def.map_or_else(|| name.to_string(), |d| d.filter.clone());
        let lookup = self.discovery.find_filter(&filter).await;
        if lookup.found.is_some() {
            return Ok(());
        }

        let config_file = def
            .and_then(|d| d.source_file.as_ref())
            .map(|p| p.display().to_string());
        warn!(jail = %name, filter = %lookup.filter, "filter missing; start refused");
        Err(EngineError::Preflight(Box::new(PreflightFailure {
            jail: name.to_string(),
            suggested_check: format!(
                "create {} or fix the `filter =` line for [{name}]{}",
                lookup
                    .searched
                    .first()
                    .map_or_else(|| format!("filter.d/{}.conf", lookup.filter), |p| p.display().to_string()),
                config_file
                    .as_deref()
                    .map(|f| format!(" in {f}"))
                    .unwrap_or_default(),
            ),
            filter: lookup.filter,
            config_file,
            searched: lookup
                .searched
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        })))
    }

    /// Remove one address from a jail's ban list and check it is gone.
    pub async fn unban(&self, jail: &str, address: &str) -> EngineResult<ActionOutcome> {
        let name = JailName::parse(jail)?;
        let ip = parse_address(address)?;
        let addr = ip.to_string();
        let subject = self
            .audit
            .attempt("unban", Some(name.as_str()), Some(&addr))
            .await;
        let span = spans::action("unban", Some(name.as_str()), &subject.request_id.to_string());

        let result = self.unban_inner(&name, ip).instrument(span).await;
        self.finish(&subject, "unban", &result).await;
        result
    }

    async fn unban_inner(&self, name: &JailName, ip: IpAddr) -> EngineResult<ActionOutcome> {
        let mut phases = vec![Phase::Idle, Phase::Dispatched];
        // "Not banned" comes back as not-OK; the probe below settles it.
        let dispatch = absorb(self.daemon.unban(name, ip).await, false)?;

        phases.push(Phase::Verifying);
        tokio::time::sleep(self.settle_delay).await;
        let state = self.state(name).await?;

        if !is_listed(&state, ip) {
            phases.push(Phase::Succeeded);
            return Ok(ActionOutcome {
                success: true,
                action: "unban",
                jail: Some(name.to_string()),
                final_state: Some(state.run_state()),
                nok_ignored: dispatch.nok,
                phases,
                message: if dispatch.nok {
                    format!("{ip} was not banned in {name}")
                } else {
                    format!("{ip} unbanned from {name}")
                },
                raw_output: dispatch.raw,
            });
        }

        phases.push(Phase::Failed);
        Err(EngineError::ActionVerificationFailed(Box::new(VerificationFailure {
            action: "unban",
            subject: name.to_string(),
            target: format!("{ip} not banned"),
            actual: format!("{ip} still banned"),
            raw_output: dispatch.raw,
            likely_cause: "the daemon re-banned the address or ignored the unban".to_string(),
            suggested_check: format!("run `fail2ban-client status {name}` and check the banned IP list"),
        })))
    }

    /// Restart the daemon and wait until it answers pings again.
    pub async fn restart(&self) -> EngineResult<ActionOutcome> {
        let subject = self.audit.attempt("restart", None, None).await;
        let span = spans::action("restart", None, &subject.request_id.to_string());
        let result = self.restart_inner().instrument(span).await;
        self.finish(&subject, "restart", &result).await;
        result
    }

    async fn restart_inner(&self) -> EngineResult<ActionOutcome> {
        let mut phases = vec![Phase::Idle, Phase::Dispatched];
        let raw = match self.daemon.restart().await {
            Ok(reply) => reply.output,
            Err(DaemonError::NotInstalled(msg)) => {
                return Err(EngineError::EnforcementUnavailable(msg));
            }
            // The socket goes away mid-restart; only the pings below tell.
            Err(e) => {
                debug!(error = %e, "restart reply was an error; polling anyway");
                e.to_string()
            }
        };

        phases.push(Phase::Verifying);
        for attempt in 1..=self.restart_attempts {
            tokio::time::sleep(self.restart_settle).await;
            match self.daemon.ping().await {
                Ok(true) => {
                    phases.push(Phase::Succeeded);
                    info!(attempt, "daemon answering after restart");
                    return Ok(ActionOutcome {
                        success: true,
                        action: "restart",
                        jail: None,
                        final_state: None,
                        nok_ignored: false,
                        phases,
                        message: format!("daemon restarted; answered ping on attempt {attempt}"),
                        raw_output: excerpt(&raw, RAW_OUTPUT_CHARS),
                    });
                }
                Ok(false) => debug!(attempt, "ping got no pong"),
                Err(e) => debug!(attempt, error = %e, "ping failed"),
            }
        }

        phases.push(Phase::Failed);
        Err(EngineError::ActionVerificationFailed(Box::new(VerificationFailure {
            action: "restart",
            subject: "service".to_string(),
            target: "responding".to_string(),
            actual: "not responding".to_string(),
            raw_output: excerpt(&raw, RAW_OUTPUT_CHARS),
            likely_cause: "the daemon did not come back; its configuration may fail to load".to_string(),
            suggested_check: "run `fail2ban-client -t` to test the configuration, then check the service manager logs"
                .to_string(),
        })))
    }

    async fn finish(
        &self,
        subject: &crate::audit::AuditSubject,
        action: &'static str,
        result: &EngineResult<ActionOutcome>,
    ) {
        match result {
            Ok(outcome) => {
                metrics::record_action(action, if outcome.nok_ignored { "nok_ignored" } else { "ok" });
                self.audit.outcome(subject, true, outcome.message.clone()).await;
            }
            Err(e) => {
                metrics::record_action(action, e.error_code());
                self.audit.outcome(subject, false, e.to_string()).await;
            }
        }
    }

    /// Observed state only. A timed-out probe's "disabled" is an assumption
    /// and must not confirm a write.
    async fn state(&self, name: &JailName) -> EngineResult<RuntimeJailState> {
        match self.probe.probe(name).await {
            Ok(ProbeReport {
                warning: Some(note), ..
            }) => {
                warn!(jail = %name, "state could not be observed; refusing to decide the action");
                Err(EngineError::EnforcementUnavailable(note))
            }
            Ok(report) => Ok(report.state),
            Err(e) if e.is_unreachable() => Err(EngineError::EnforcementUnavailable(e.to_string())),
            Err(e) => Err(EngineError::Internal(format!("status probe for {name} failed: {e}"))),
        }
    }

    async fn current_state(&self, name: &JailName) -> EngineResult<RunState> {
        Ok(self.state(name).await?.run_state())
    }
}

/// Fold a dispatch reply. Unreachable daemons end the action; not-OK is
/// kept for the verification step unless the caller asked for strictness.
/// Any other failure goes to verification with its text as raw output.
fn absorb(reply: Result<crate::daemon::DaemonReply, DaemonError>, strict: bool) -> EngineResult<Dispatch> {
    match reply {
        Ok(reply) => Ok(Dispatch {
            raw: excerpt(&reply.output, RAW_OUTPUT_CHARS),
            nok: false,
        }),
        Err(DaemonError::NotOk(msg)) if strict => Err(EngineError::IdempotentNoOp(msg)),
        Err(DaemonError::NotOk(msg)) => Ok(Dispatch {
            raw: excerpt(&msg, RAW_OUTPUT_CHARS),
            nok: true,
        }),
        Err(e) if e.is_unreachable() => Err(EngineError::EnforcementUnavailable(e.to_string())),
        // The command may still have taken effect.
        Err(e) => Ok(Dispatch {
            raw: excerpt(&e.to_string(), RAW_OUTPUT_CHARS),
            nok: false,
        }),
    }
}

fn is_listed(state: &RuntimeJailState, ip: IpAddr) -> bool {
    state
        .banned_addresses
        .iter()
        .any(|a| a.parse::<IpAddr>().map_or(a == &ip.to_string(), |parsed| parsed == ip))
}
