//! The engine: shared services, constructed once and handed to every caller.
//!
//! Read paths go through the TTL cache and degrade to partial or stale data.
//! Write paths go straight to the [`ActionExecutor`] and invalidate whatever
//! they may have changed.

use serde::Serialize;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agents::{AgentRegistry, AgentSnapshot, PushedJail};
use crate::audit::{AuditLog, AuditRecord};
use crate::bans::{ActiveBans, BanHistory, BanQueries};
use crate::cache::{FetchFailure, Served, TtlCache};
use crate::config::{ActionsConfig, CacheConfig, Config, DiscoveryConfig, ReconcileConfig};
use crate::daemon::{self, EnforcementDaemon};
use crate::db::Database;
use crate::discovery::JailDiscovery;
use crate::error::{EngineError, EngineResult};
use crate::executor::{ActionExecutor, ActionOutcome};
use crate::host::{self, HostStats};
use crate::names::JailName;
use crate::probe::RuntimeStateProbe;
use crate::reconcile::{self, ReconciledJail, ReconciledView, ServerStatus, SubFetch};

/// Longest history page served.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Values held by the engine cache.
#[derive(Clone)]
pub enum CacheValue {
    Jails(Arc<ReconciledView>),
    Jail(Arc<ReconciledJail>),
    Host(Arc<HostStats>),
    Bans(Arc<ActiveBans>),
    History(Arc<BanHistory>),
}

/// A view that is not worth caching over the last good one.
struct Offline(Arc<ReconciledView>);

impl fmt::Display for Offline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.errors.first() {
            Some(e) => f.write_str(e),
            None => f.write_str("enforcement daemon unreachable"),
        }
    }
}

/// Liveness report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: &'static str,
    pub server: String,
    pub backend: &'static str,
    pub daemon_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon_version: Option<String>,
    pub cache_entries: usize,
}

/// Everything needed to build an [`Engine`].
pub struct EngineParams {
    pub server_name: String,
    pub daemon: Arc<dyn EnforcementDaemon>,
    pub discovery: DiscoveryConfig,
    pub reconcile: ReconcileConfig,
    pub actions: ActionsConfig,
    pub cache: CacheConfig,
    pub probe_timeout: Duration,
    pub bans: BanQueries,
    pub audit: Arc<AuditLog>,
    pub agents: Option<AgentRegistry>,
}

struct Inner {
    server_name: String,
    daemon: Arc<dyn EnforcementDaemon>,
    discovery: Arc<JailDiscovery>,
    probe: RuntimeStateProbe,
    executor: ActionExecutor,
    cache: TtlCache<CacheValue>,
    ttl: CacheConfig,
    reconcile: ReconcileConfig,
    bans: BanQueries,
    audit: Arc<AuditLog>,
    agents: Option<AgentRegistry>,
}

/// Cheap to clone; all clones share the same services.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(params: EngineParams) -> Self {
        let discovery = Arc::new(JailDiscovery::new(&params.discovery, params.daemon.clone()));
        let probe = RuntimeStateProbe::new(params.daemon.clone(), params.probe_timeout);
        let executor = ActionExecutor::new(
            params.daemon.clone(),
            probe.clone(),
            discovery.clone(),
            params.audit.clone(),
            &params.actions,
        );
        let cache = TtlCache::new(
            Duration::from_secs(params.cache.stale_ttl_secs),
            params.cache.latency_budget(),
        );
        Self {
            inner: Arc::new(Inner {
                server_name: params.server_name,
                daemon: params.daemon,
                discovery,
                probe,
                executor,
                cache,
                ttl: params.cache,
                reconcile: params.reconcile,
                bans: params.bans,
                audit: params.audit,
                agents: params.agents,
            }),
        }
    }

    /// Build every service from configuration, opening the database and
    /// the audit file.
    pub async fn from_config(config: &Config) -> EngineResult<Self> {
        let daemon = daemon::build(&config.daemon);
        let audit = AuditLog::open(&config.audit).await.map_err(|e| {
            EngineError::Configuration(format!("cannot open audit log: {e}"))
        })?;
        let db = Database::new(&config.database.path).await?;
        let agents = AgentRegistry::new(db, config.agents.clone());

        Ok(Self::new(EngineParams {
            server_name: config.server.name.clone(),
            daemon,
            discovery: config.discovery.clone(),
            reconcile: config.reconcile.clone(),
            actions: config.actions.clone(),
            cache: config.cache.clone(),
            probe_timeout: config.daemon.probe_timeout(),
            bans: BanQueries::from_config(config.ledger.as_ref(), &config.event_log),
            audit: Arc::new(audit),
            agents: Some(agents),
        }))
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    pub fn cache(&self) -> &TtlCache<CacheValue> {
        &self.inner.cache
    }

    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn agents(&self) -> EngineResult<&AgentRegistry> {
        self.inner
            .agents
            .as_ref()
            .ok_or_else(|| EngineError::Configuration("agent registry disabled".to_string()))
    }

    fn ttl(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    /// Liveness plus whether the daemon answers.
    pub async fn health(&self) -> Health {
        let daemon = &self.inner.daemon;
        let budget = self.inner.probe.timeout();
        let reachable = matches!(tokio::time::timeout(budget, daemon.ping()).await, Ok(Ok(true)));
        let daemon_version = if reachable {
            match tokio::time::timeout(budget, daemon.version()).await {
                Ok(Ok(v)) => Some(v),
                _ => None,
            }
        } else {
            None
        };
        Health {
            status: "ok",
            server: self.inner.server_name.clone(),
            backend: daemon.backend_name(),
            daemon_reachable: reachable,
            daemon_version,
            cache_entries: self.inner.cache.len(),
        }
    }

    /// The reconciled jail list, cached.
    pub async fn list_jails(&self) -> Arc<ReconciledView> {
        let engine = self.clone();
        let served = self
            .inner
            .cache
            .get_or_fetch("jails", Self::ttl(self.inner.ttl.jail_list_ttl_secs), move || async move {
                engine.reconcile().await.map(CacheValue::Jails)
            })
            .await;

        match served {
            Ok(Served::Stale { value: CacheValue::Jails(view), reason }) => {
                let mut view = (*view).clone();
                view.warnings
                    .push(format!("serving last known state from cache: {reason}"));
                if view.server_status == ServerStatus::Online {
                    view.server_status = ServerStatus::Partial;
                }
                Arc::new(view)
            }
            Ok(served) => match served.into_value() {
                CacheValue::Jails(view) => view,
                _ => self.unavailable_view("cache held the wrong value for jails"),
            },
            Err(FetchFailure::Failed(Offline(view))) => view,
            Err(other) => self.unavailable_view(&other.to_string()),
        }
    }

    fn unavailable_view(&self, reason: &str) -> Arc<ReconciledView> {
        Arc::new(ReconciledView::without_discovery(
            format!("jail list unavailable: {reason}"),
            false,
            None,
        ))
    }

    /// One reconciliation pass, uncached.
    async fn reconcile(&self) -> Result<Arc<ReconciledView>, Offline> {
        let inner = &self.inner;
        let host = async {
            if !inner.reconcile.include_host_stats {
                return None;
            }
            Some(match self.host_stats().await {
                Ok(h) => SubFetch::Ok((*h).clone()),
                Err(e) => SubFetch::Unavailable(e.to_string()),
            })
        };
        let active = async {
            match tokio::time::timeout(inner.probe.timeout(), inner.daemon.global_status()).await {
                Ok(Ok(status)) => SubFetch::Ok(
                    status
                        .jail_names
                        .iter()
                        .filter_map(|n| JailName::parse(n).ok())
                        .collect::<BTreeSet<_>>(),
                ),
                Ok(Err(e)) => SubFetch::Unavailable(e.to_string()),
                Err(_) => SubFetch::Unavailable(format!(
                    "global status timed out after {}ms",
                    inner.probe.timeout().as_millis()
                )),
            }
        };
        // Independent sources; the pass costs the slowest, not the sum.
        let (host, active, discovered) = tokio::join!(host, active, inner.discovery.discover());

        let discovery = match discovered {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "jail discovery failed");
                let unreachable = active.value().is_none();
                let view = ReconciledView::without_discovery(e.to_string(), unreachable, host);
                return Err(Offline(Arc::new(view)));
            }
        };

        let probe = inner.probe.clone();
        let view = reconcile::assemble(
            &discovery,
            active,
            |name: JailName| {
                let probe = probe.clone();
                async move { SubFetch::from_probe(probe.probe_detailed(&name).await) }
            },
            host,
            inner.reconcile.probe_concurrency,
        )
        .await;

        debug!(
            jails = view.jails.len(),
            status = ?view.server_status,
            errors = view.errors.len(),
            warnings = view.warnings.len(),
            "reconciled"
        );
        let view = Arc::new(view);
        if view.server_status == ServerStatus::Offline {
            Err(Offline(view))
        } else {
            Ok(view)
        }
    }

    /// One configured jail with its live state.
    pub async fn get_jail(&self, jail: &str) -> EngineResult<Arc<ReconciledJail>> {
        let name = JailName::parse(jail)?;
        let key = format!("jail:{name}");
        let engine = self.clone();
        let lookup = name.clone();
        let served = self
            .inner
            .cache
            .get_or_fetch(&key, Self::ttl(self.inner.ttl.jail_detail_ttl_secs), move || async move {
                engine.fetch_jail(&lookup).await.map(CacheValue::Jail)
            })
            .await;

        match served {
            Ok(served) => match served.into_value() {
                CacheValue::Jail(j) => Ok(j),
                _ => Err(EngineError::Internal(format!("cache held the wrong value for {key}"))),
            },
            Err(FetchFailure::Failed(e)) => Err(e),
            Err(other) => Err(EngineError::EnforcementUnavailable(other.to_string())),
        }
    }

    async fn fetch_jail(&self, name: &JailName) -> EngineResult<Arc<ReconciledJail>> {
        let discovery = self.inner.discovery.discover().await?;
        let Some(def) = discovery.definition(name) else {
            return Err(EngineError::not_found("jail", name.as_str()));
        };
        let state = match self.inner.probe.probe_detailed(name).await {
            Ok(report) => report.state,
            Err(e) if e.is_unreachable() => {
                return Err(EngineError::EnforcementUnavailable(e.to_string()));
            }
            Err(e) => return Err(EngineError::Internal(format!("status probe for {name} failed: {e}"))),
        };
        Ok(Arc::new(ReconciledJail::build(name, Some(def), state)))
    }

    fn invalidate_jail(&self, jail: &str) {
        let cache = &self.inner.cache;
        cache.invalidate("jails");
        cache.invalidate(&format!("jail:{jail}"));
        cache.invalidate("bans:*");
    }

    pub async fn enable(&self, jail: &str, strict: bool) -> EngineResult<ActionOutcome> {
        let result = self.inner.executor.enable(jail, strict).await;
        self.invalidate_jail(jail);
        result
    }

    pub async fn disable(&self, jail: &str, strict: bool) -> EngineResult<ActionOutcome> {
        let result = self.inner.executor.disable(jail, strict).await;
        self.invalidate_jail(jail);
        result
    }

    pub async fn toggle(&self, jail: &str, strict: bool) -> EngineResult<ActionOutcome> {
        let result = self.inner.executor.toggle(jail, strict).await;
        self.invalidate_jail(jail);
        result
    }

    pub async fn unban(&self, jail: &str, address: &str) -> EngineResult<ActionOutcome> {
        let result = self.inner.executor.unban(jail, address).await;
        self.invalidate_jail(jail);
        result
    }

    /// Restart the daemon. Every cache entry is dropped once it answers again.
    pub async fn restart_service(&self) -> EngineResult<ActionOutcome> {
        let result = self.inner.executor.restart().await;
        if result.is_ok() {
            self.inner.cache.clear();
        } else {
            self.inner.cache.invalidate("jail*");
        }
        result
    }

    /// Bans in force per the ledger.
    pub async fn active_bans(&self, jail: Option<&str>) -> EngineResult<Arc<ActiveBans>> {
        let jail = jail.map(JailName::parse).transpose()?;
        let key = format!("bans:active:{}", jail.as_ref().map_or("all", JailName::as_str));
        let bans = self.inner.bans.clone();
        let served = self
            .inner
            .cache
            .get_or_fetch(&key, Self::ttl(self.inner.ttl.bans_ttl_secs), move || async move {
                let list = bans.active_bans(jail.as_ref().map(JailName::as_str)).await;
                Ok::<_, Infallible>(CacheValue::Bans(Arc::new(list)))
            })
            .await;
        match served.map(Served::into_value) {
            Ok(CacheValue::Bans(b)) => Ok(b),
            Ok(_) => Err(EngineError::Internal(format!("cache held the wrong value for {key}"))),
            Err(e) => Err(EngineError::EnforcementUnavailable(e.to_string())),
        }
    }

    /// Recent ban events from the daemon log, newest first.
    pub async fn ban_history(&self, jail: Option<&str>, limit: usize) -> EngineResult<Arc<BanHistory>> {
        let jail = jail.map(JailName::parse).transpose()?;
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        let key = format!(
            "bans:history:{}:{limit}",
            jail.as_ref().map_or("all", JailName::as_str)
        );
        let bans = self.inner.bans.clone();
        let served = self
            .inner
            .cache
            .get_or_fetch(&key, Self::ttl(self.inner.ttl.history_ttl_secs), move || async move {
                let history = bans.ban_history(jail.as_ref().map(JailName::as_str), limit).await;
                Ok::<_, Infallible>(CacheValue::History(Arc::new(history)))
            })
            .await;
        match served.map(Served::into_value) {
            Ok(CacheValue::History(h)) => Ok(h),
            Ok(_) => Err(EngineError::Internal(format!("cache held the wrong value for {key}"))),
            Err(e) => Err(EngineError::EnforcementUnavailable(e.to_string())),
        }
    }

    pub async fn log_tail(&self, lines: usize) -> Result<Vec<String>, String> {
        self.inner.bans.log_tail(lines).await
    }

    pub async fn host_stats(&self) -> EngineResult<Arc<HostStats>> {
        let served = self
            .inner
            .cache
            .get_or_fetch("host", Self::ttl(self.inner.ttl.host_ttl_secs), || async {
                host::collect().await.map(|h| CacheValue::Host(Arc::new(h)))
            })
            .await;
        match served.map(Served::into_value) {
            Ok(CacheValue::Host(h)) => Ok(h),
            Ok(_) => Err(EngineError::Internal("cache held the wrong value for host".to_string())),
            Err(e) => Err(EngineError::Internal(format!("host stats unavailable: {e}"))),
        }
    }

    pub fn audit_recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.inner.audit.recent(limit)
    }

    /// What this instance pushes upstream in agent mode.
    pub async fn snapshot(&self, name: Option<String>, log_lines: usize) -> AgentSnapshot {
        let view = self.list_jails().await;
        let bans = match self.active_bans(None).await {
            Ok(b) => b.bans.clone(),
            Err(e) => {
                debug!(error = %e, "no bans for snapshot");
                Vec::new()
            }
        };
        let log_tail = if log_lines == 0 {
            Vec::new()
        } else {
            self.log_tail(log_lines).await.unwrap_or_else(|e| {
                debug!(error = %e, "no log tail for snapshot");
                Vec::new()
            })
        };
        AgentSnapshot {
            name,
            jails: view.jails.iter().map(PushedJail::from).collect(),
            bans,
            log_tail,
        }
    }

    /// Periodic housekeeping: expired cache entries and limiter state.
    pub fn sweep(&self) -> usize {
        let removed = self.inner.cache.sweep();
        if let Some(agents) = &self.inner.agents {
            agents.maintain();
        }
        if removed > 0 {
            debug!(removed, "cache sweep");
        }
        removed
    }

    /// Close long-lived resources.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.inner.cache.clear();
        if let Some(agents) = &self.inner.agents {
            agents.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bans::EventLog;
    use crate::daemon::MemoryDaemon;

    fn engine(dir: &std::path::Path, daemon: Arc<MemoryDaemon>) -> Engine {
        std::fs::write(dir.join("jail.conf"), "[sshd]\nenabled = true\n\n[nginx-404]\n").unwrap();
        Engine::new(EngineParams {
            server_name: "test".into(),
            daemon,
            discovery: DiscoveryConfig {
                config_dir: dir.to_path_buf(),
                ..DiscoveryConfig::default()
            },
            reconcile: ReconcileConfig {
                include_host_stats: false,
                ..ReconcileConfig::default()
            },
            actions: ActionsConfig {
                settle_delay_ms: 1,
                ..ActionsConfig::default()
            },
            cache: CacheConfig::default(),
            probe_timeout: Duration::from_millis(500),
            bans: BanQueries::new(None, EventLog::new(dir.join("f2b.log"), 4096)),
            audit: Arc::new(AuditLog::in_memory(10)),
            agents: None,
        })
    }

    #[tokio::test]
    async fn list_is_cached_until_an_action_invalidates_it() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(MemoryDaemon::new());
        daemon.add_jail("sshd", true);
        daemon.add_jail("nginx-404", false);
        let e = engine(dir.path(), daemon.clone());

        let first = e.list_jails().await;
        let second = e.list_jails().await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(daemon.count_calls("status"), 2);

        e.disable("sshd", false).await.unwrap();
        let third = e.list_jails().await;
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(!third.jail("sshd").unwrap().enabled);
    }

    #[tokio::test]
    async fn reconcile_sources_are_fetched_together() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(MemoryDaemon::new());
        daemon.add_jail("sshd", true);
        daemon.stall_list(Duration::from_millis(300));
        let e = engine(dir.path(), daemon);
        // No config: discovery asks the daemon too, so both sources stall.
        std::fs::remove_file(dir.path().join("jail.conf")).unwrap();

        let started = std::time::Instant::now();
        let view = e.list_jails().await;
        assert!(started.elapsed() < Duration::from_millis(550));
        assert!(view.jail("sshd").unwrap().enabled);
    }

    #[tokio::test]
    async fn offline_daemon_still_lists_configured_jails() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(MemoryDaemon::new());
        daemon.set_installed(false);
        let e = engine(dir.path(), daemon);
        let view = e.list_jails().await;
        assert_eq!(view.server_status, ServerStatus::Offline);
        assert_eq!(view.jails.len(), 2);
        assert!(view.jails.iter().all(|j| !j.enabled));
        assert!(e.cache().get("jails").is_none());
    }

    #[tokio::test]
    async fn unknown_jail_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(MemoryDaemon::new());
        let e = engine(dir.path(), daemon);
        assert!(matches!(
            e.get_jail("postfix").await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
        assert!(matches!(
            e.get_jail("bad name").await.unwrap_err(),
            EngineError::Validation { .. }
        ));
    }

    #[tokio::test]
    async fn ban_queries_degrade_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path(), Arc::new(MemoryDaemon::new()));
        let bans = e.active_bans(Some("sshd")).await.unwrap();
        assert!(bans.bans.is_empty());
        assert!(!bans.errors.is_empty());
        let history = e.ban_history(None, 10).await.unwrap();
        assert!(history.events.is_empty());
        assert!(e.agents().is_err());
    }
}
