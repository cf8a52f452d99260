//! Reconciliation of configuration, live daemon state and host data.
//!
//! Membership comes from discovery only: every configured jail appears
//! exactly once, running or not, and nothing else appears. Live state is
//! fetched only for jails the daemon reports as active; a stopped jail has
//! no bans by definition.
//!
//! Each input arrives as a [`SubFetch`], and `serverStatus` is derived from
//! which of them came back whole.

pub mod classify;

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use crate::daemon::DaemonError;
use crate::discovery::{Discovery, DiscoverySource, JailDefinition};
use crate::host::HostStats;
use crate::names::JailName;
use crate::probe::{ProbeReport, RuntimeJailState};

pub use classify::{Category, Severity, classify};

/// Outcome of one sub-fetch feeding the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum SubFetch<T> {
    Ok(T),
    /// Usable, but an assumption or an old copy.
    Degraded(T, String),
    Unavailable(String),
}

impl<T> SubFetch<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ok(v) | Self::Degraded(v, _) => Some(v),
            Self::Unavailable(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ok(_) => None,
            Self::Degraded(_, r) | Self::Unavailable(r) => Some(r),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SubFetch<U> {
        match self {
            Self::Ok(v) => SubFetch::Ok(f(v)),
            Self::Degraded(v, r) => SubFetch::Degraded(f(v), r),
            Self::Unavailable(r) => SubFetch::Unavailable(r),
        }
    }
}

impl SubFetch<RuntimeJailState> {
    /// Fold a probe result: an assumed state is degraded, an error unavailable.
    pub fn from_probe(result: Result<ProbeReport, DaemonError>) -> Self {
        match result {
            Ok(ProbeReport {
                state,
                warning: None,
            }) => Self::Ok(state),
            Ok(ProbeReport {
                state,
                warning: Some(w),
            }) => Self::Degraded(state, w),
            Err(e) => Self::Unavailable(e.to_string()),
        }
    }
}

/// Derived health of the enforcement layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Daemon list obtained and every sub-fetch succeeded.
    Online,
    /// Some sub-fetches failed; the rest is shown.
    Partial,
    /// The daemon could not be reached.
    Offline,
}

/// One configured jail, merged with its live state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledJail {
    pub name: JailName,
    pub enabled: bool,
    pub currently_banned: u64,
    pub banned_addresses: Vec<String>,
    pub total_banned: Option<u64>,
    pub currently_failed: u64,
    pub total_failed: u64,
    pub max_retry: Option<i64>,
    pub ban_time: Option<i64>,
    pub find_time: Option<i64>,
    pub filter: String,
    pub category: Category,
    pub severity: Severity,
    /// Config file that declared the jail.
    pub source: Option<String>,
    /// `enabled =` as written in configuration, if set.
    pub configured_enabled: Option<bool>,
}

impl ReconciledJail {
    /// Merge one jail's definition and live state.
    pub fn build(name: &JailName, def: Option<&JailDefinition>, state: RuntimeJailState) -> Self {
        let filter = def
            .map(|d| d.filter.clone())
            .unwrap_or_else(|| name.as_str().to_string());
        let (category, severity) = classify(name.as_str(), &filter);
        let (banned_addresses, currently_banned) = if state.enabled {
            (state.banned_addresses, state.currently_banned)
        } else {
            (Vec::new(), 0)
        };
        Self {
            name: name.clone(),
            enabled: state.enabled,
            currently_banned,
            banned_addresses,
            total_banned: state.total_banned,
            currently_failed: state.currently_failed,
            total_failed: state.total_failed,
            max_retry: state.max_retry.or_else(|| def.and_then(|d| d.max_retry)),
            ban_time: state.ban_time.or_else(|| def.and_then(|d| d.ban_time)),
            find_time: state.find_time.or_else(|| def.and_then(|d| d.find_time)),
            filter,
            category,
            severity,
            source: def.and_then(|d| d.source_file.as_ref()).map(|p| p.display().to_string()),
            configured_enabled: def.and_then(|d| d.enabled),
        }
    }
}

/// The externally visible merge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledView {
    pub jails: Vec<ReconciledJail>,
    pub server_status: ServerStatus,
    pub host: Option<HostStats>,
    pub discovery_source: Option<DiscoverySource>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl ReconciledView {
    pub fn jail(&self, name: &str) -> Option<&ReconciledJail> {
        self.jails.iter().find(|j| j.name.as_str() == name)
    }

    /// A view with no configured jails, for when discovery itself failed.
    pub fn without_discovery(
        reason: String,
        daemon_unreachable: bool,
        host: Option<SubFetch<HostStats>>,
    ) -> Self {
        let mut errors = vec![reason];
        let mut warnings = Vec::new();
        let host = collect_host(host, &mut errors, &mut warnings);
        Self {
            jails: Vec::new(),
            server_status: if daemon_unreachable {
                ServerStatus::Offline
            } else {
                ServerStatus::Partial
            },
            host,
            discovery_source: None,
            errors,
            warnings,
            generated_at: Utc::now(),
        }
    }
}

/// `None` means host stats were not requested.
fn collect_host(
    host: Option<SubFetch<HostStats>>,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) -> Option<HostStats> {
    match host? {
        SubFetch::Ok(h) => Some(h),
        SubFetch::Degraded(h, reason) => {
            warnings.push(format!("host stats: {reason}"));
            Some(h)
        }
        SubFetch::Unavailable(reason) => {
            errors.push(format!("host stats unavailable: {reason}"));
            None
        }
    }
}

/// Merge discovery, the daemon's active list and per-jail probes.
///
/// `fetch` is called once per configured jail that is active, with at most
/// `concurrency` calls in flight. `host` is `None` when host stats were not
/// requested.
pub async fn assemble<F, Fut>(
    discovery: &Discovery,
    active: SubFetch<BTreeSet<JailName>>,
    fetch: F,
    host: Option<SubFetch<HostStats>>,
    concurrency: usize,
) -> ReconciledView
where
    F: Fn(JailName) -> Fut,
    Fut: Future<Output = SubFetch<RuntimeJailState>>,
{
    let mut errors = Vec::new();
    let mut warnings = discovery.warnings.clone();
    let mut degraded = false;

    let active_set = match &active {
        SubFetch::Ok(set) => Some(set),
        SubFetch::Degraded(set, reason) => {
            warnings.push(format!("active jail list: {reason}"));
            degraded = true;
            Some(set)
        }
        SubFetch::Unavailable(reason) => {
            errors.push(format!("enforcement daemon unreachable: {reason}"));
            None
        }
    };

    let mut states: HashMap<JailName, SubFetch<RuntimeJailState>> = HashMap::new();
    if let Some(active_set) = active_set {
        for name in active_set.difference(&discovery.names) {
            warnings.push(format!(
                "daemon runs jail '{name}' that no configuration source declares; not listed"
            ));
        }

        let targets: Vec<JailName> = discovery.names.intersection(active_set).cloned().collect();
        let fetch = &fetch;
        let results: Vec<(JailName, SubFetch<RuntimeJailState>)> = stream::iter(targets)
            .map(|name| async move {
                let result = fetch(name.clone()).await;
                (name, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        states.extend(results);
    }

    let mut jails = Vec::with_capacity(discovery.names.len());
    for name in &discovery.names {
        let def = discovery.definition(name);
        let state = match states.remove(name) {
            None => RuntimeJailState::disabled(),
            Some(SubFetch::Ok(state)) => {
                if !state.enabled {
                    warnings.push(format!(
                        "jail '{name}' was listed as active but its status reports it stopped"
                    ));
                }
                state
            }
            Some(SubFetch::Degraded(state, reason)) => {
                warnings.push(reason);
                degraded = true;
                state
            }
            Some(SubFetch::Unavailable(reason)) => {
                errors.push(format!("jail '{name}': {reason}"));
                // Listed as running, but no detail: keep it enabled without bans.
                RuntimeJailState {
                    enabled: true,
                    ..RuntimeJailState::disabled()
                }
            }
        };
        jails.push(ReconciledJail::build(name, def, state));
    }

    let host = collect_host(host, &mut errors, &mut warnings);

    let server_status = if active_set.is_none() {
        ServerStatus::Offline
    } else if !errors.is_empty() || degraded {
        ServerStatus::Partial
    } else {
        ServerStatus::Online
    };

    ReconciledView {
        jails,
        server_status,
        host,
        discovery_source: Some(discovery.source),
        errors,
        warnings,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn name(s: &str) -> JailName {
        JailName::parse(s).unwrap()
    }

    fn discovery(names: &[&str]) -> Discovery {
        let jails: BTreeMap<JailName, JailDefinition> = names
            .iter()
            .map(|n| {
                (
                    name(n),
                    JailDefinition {
                        name: name(n),
                        filter: n.to_string(),
                        source_file: None,
                        enabled: None,
                        max_retry: Some(5),
                        ban_time: Some(600),
                        find_time: None,
                        logpath: None,
                    },
                )
            })
            .collect();
        Discovery {
            names: jails.keys().cloned().collect(),
            jails,
            warnings: Vec::new(),
            source: DiscoverySource::Config,
        }
    }

    fn active(names: &[&str]) -> SubFetch<BTreeSet<JailName>> {
        SubFetch::Ok(names.iter().map(|n| name(n)).collect())
    }

    fn banned(addrs: &[&str]) -> RuntimeJailState {
        RuntimeJailState {
            enabled: true,
            currently_banned: addrs.len() as u64,
            banned_addresses: addrs.iter().map(|s| s.to_string()).collect(),
            ..RuntimeJailState::default()
        }
    }

    fn no_host() -> Option<SubFetch<HostStats>> {
        None
    }

    #[tokio::test]
    async fn membership_follows_discovery() {
        let d = discovery(&["nginx-404", "sshd"]);
        let view = assemble(
            &d,
            active(&["sshd", "ghost"]),
            |_| async { SubFetch::Ok(banned(&["192.0.2.1", "192.0.2.2"])) },
            no_host(),
            4,
        )
        .await;

        let names: Vec<_> = view.jails.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["nginx-404", "sshd"]);
        let sshd = view.jail("sshd").unwrap();
        assert!(sshd.enabled);
        assert_eq!(sshd.currently_banned, 2);
        assert_eq!(sshd.max_retry, Some(5));
        let nginx = view.jail("nginx-404").unwrap();
        assert!(!nginx.enabled);
        assert_eq!(nginx.currently_banned, 0);
        assert!(view.warnings.iter().any(|w| w.contains("ghost")));
    }

    #[tokio::test]
    async fn only_active_jails_are_fetched() {
        let d = discovery(&["a", "b", "c", "d"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let view = assemble(
            &d,
            active(&["b", "d"]),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    SubFetch::Ok(banned(&[]))
                }
            },
            Some(SubFetch::Ok(crate::host::collect().await.unwrap())),
            1,
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(view.server_status, ServerStatus::Online);
        assert!(view.host.is_some());
    }

    #[tokio::test]
    async fn unreachable_daemon_is_offline_but_keeps_membership() {
        let d = discovery(&["sshd"]);
        let view = assemble(
            &d,
            SubFetch::Unavailable("not installed".into()),
            |_| async { SubFetch::Ok(banned(&["192.0.2.9"])) },
            no_host(),
            4,
        )
        .await;
        assert_eq!(view.server_status, ServerStatus::Offline);
        assert_eq!(view.jails.len(), 1);
        assert!(!view.jails[0].enabled);
        assert_eq!(view.jails[0].currently_banned, 0);
    }

    #[tokio::test]
    async fn failed_or_assumed_probes_make_partial() {
        let d = discovery(&["slow", "broken", "ok"]);
        let view = assemble(
            &d,
            active(&["slow", "broken", "ok"]),
            |n: JailName| async move {
                match n.as_str() {
                    "slow" => SubFetch::Degraded(RuntimeJailState::disabled(), "timed out; assuming disabled".into()),
                    "broken" => SubFetch::Unavailable("unexpected daemon output".into()),
                    _ => SubFetch::Ok(banned(&["198.51.100.1"])),
                }
            },
            no_host(),
            2,
        )
        .await;
        assert_eq!(view.server_status, ServerStatus::Partial);
        assert!(!view.jail("slow").unwrap().enabled);
        assert!(view.jail("broken").unwrap().enabled);
        assert_eq!(view.jail("broken").unwrap().currently_banned, 0);
        assert_eq!(view.jail("ok").unwrap().currently_banned, 1);
        assert!(view.warnings.iter().any(|w| w.contains("assuming disabled")));
        assert!(view.errors.iter().any(|e| e.contains("broken")));
    }

    #[tokio::test]
    async fn host_failure_alone_is_partial() {
        let d = discovery(&["sshd"]);
        let view = assemble(
            &d,
            active(&["sshd"]),
            |_| async { SubFetch::Ok(banned(&[])) },
            Some(SubFetch::Unavailable("sysinfo failed".into())),
            4,
        )
        .await;
        assert_eq!(view.server_status, ServerStatus::Partial);
        assert!(view.host.is_none());
        assert!(view.errors[0].contains("host stats"));
    }

    #[test]
    fn disabled_state_drops_bans_when_built() {
        let d = discovery(&["sshd"]);
        let mut state = banned(&["192.0.2.1"]);
        state.enabled = false;
        let jail = ReconciledJail::build(&name("sshd"), d.definition(&name("sshd")), state);
        assert_eq!(jail.currently_banned, 0);
        assert!(jail.banned_addresses.is_empty());
    }

    #[test]
    fn serializes_camel_case() {
        let d = discovery(&["sshd"]);
        let jail = ReconciledJail::build(&name("sshd"), d.definition(&name("sshd")), banned(&[]));
        let json = serde_json::to_value(&jail).unwrap();
        assert_eq!(json["currentlyBanned"], 0);
        assert_eq!(json["category"], "ssh");
        assert_eq!(json["severity"], "high");
    }
}
