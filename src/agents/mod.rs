//! Agent registry and push protocol.
//!
//! Remote enforcement points push periodic snapshots to a central instance.
//! Trust is bootstrapped on first contact: the first push for an unknown id
//! registers it and fixes its secret, and every later push must present the
//! same secret. Anyone who reaches the push endpoint before the legitimate
//! agent claims the id, so deployments that cannot accept that should
//! pre-register agents with [`AgentRegistry::register`].
//!
//! Secrets are stored as Argon2 hashes. Hashing and verification run on the
//! blocking pool.

mod limit;
mod payload;
mod secret;

pub use limit::PushLimiter;
pub use payload::{AgentSnapshot, PushedJail, digest};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, warn};

use crate::config::AgentsConfig;
use crate::db::{AgentRecord, Database, SnapshotRecord};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::telemetry::spans;

const MAX_AGENT_ID_LEN: usize = 64;
const MAX_SECRET_LEN: usize = 256;

/// Agent as reported by the registry queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentServer {
    pub id: String,
    pub name: Option<String>,
    pub last_address: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Pushed within the configured online window.
    pub online: bool,
    pub jail_count: usize,
    pub active_jails: usize,
    pub banned_count: u64,
}

/// One agent with its latest snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDetail {
    #[serde(flatten)]
    pub agent: AgentServer,
    pub snapshot: Option<AgentSnapshot>,
}

/// A stored history entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub received_at: DateTime<Utc>,
    pub digest: String,
    pub snapshot: AgentSnapshot,
}

/// Reply to an accepted push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReceipt {
    pub accepted: bool,
    /// This push created the agent.
    pub registered: bool,
    pub digest: String,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_snapshot(agent: &str, raw: &str) -> Option<AgentSnapshot> {
    match serde_json::from_str(raw) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(agent = %agent, error = %e, "stored snapshot does not parse");
            None
        }
    }
}

fn validate_id(id: &str) -> EngineResult<()> {
    if id.is_empty() || id.len() > MAX_AGENT_ID_LEN {
        return Err(EngineError::validation(
            "agentId",
            format!("must be 1 to {MAX_AGENT_ID_LEN} characters"),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(EngineError::validation("agentId", format!("{id:?} has invalid characters")));
    }
    Ok(())
}

fn validate_secret(secret: &str) -> EngineResult<()> {
    if secret.is_empty() || secret.len() > MAX_SECRET_LEN {
        return Err(EngineError::validation(
            "agentSecret",
            format!("must be 1 to {MAX_SECRET_LEN} bytes"),
        ));
    }
    Ok(())
}

async fn hash(secret: &str) -> EngineResult<String> {
    let secret = secret.to_string();
    tokio::task::spawn_blocking(move || secret::hash_secret(&secret))
        .await
        .map_err(|e| EngineError::Internal(format!("hashing task failed: {e}")))?
        .map_err(|e| EngineError::Internal(format!("secret hashing failed: {e}")))
}

async fn verify(secret: &str, stored: &str) -> EngineResult<bool> {
    let secret = secret.to_string();
    let stored = stored.to_string();
    tokio::task::spawn_blocking(move || secret::verify_secret(&secret, &stored))
        .await
        .map_err(|e| EngineError::Internal(format!("verification task failed: {e}")))?
        .map_err(|e| EngineError::Internal(format!("stored secret hash is unusable: {e}")))
}

/// Registry of pushing agents, persisted in the engine database.
pub struct AgentRegistry {
    db: Database,
    limiter: PushLimiter,
    config: AgentsConfig,
}

impl AgentRegistry {
    pub fn new(db: Database, config: AgentsConfig) -> Self {
        Self {
            db,
            limiter: PushLimiter::new(config.max_pushes_per_minute),
            config,
        }
    }

    fn server(&self, record: &AgentRecord, snapshot: Option<&AgentSnapshot>, now: i64) -> AgentServer {
        AgentServer {
            id: record.id.clone(),
            name: record.name.clone(),
            last_address: record.last_address.clone(),
            first_seen_at: timestamp(record.first_seen_at),
            last_seen_at: timestamp(record.last_seen_at),
            online: now - record.last_seen_at < self.config.online_window_secs,
            jail_count: snapshot.map_or(0, |s| s.jails.len()),
            active_jails: snapshot.map_or(0, AgentSnapshot::active_jails),
            banned_count: snapshot.map_or(0, AgentSnapshot::banned_count),
        }
    }

    fn detail(&self, record: &AgentRecord, now: i64) -> AgentDetail {
        let snapshot = record
            .last_snapshot
            .as_deref()
            .and_then(|raw| parse_snapshot(&record.id, raw));
        AgentDetail {
            agent: self.server(record, snapshot.as_ref(), now),
            snapshot,
        }
    }

    /// Create an agent or replace its secret.
    ///
    /// This is the pre-provisioning path: an operator-chosen secret is
    /// installed before the agent's first push.
    pub async fn register(
        &self,
        id: &str,
        secret: &str,
        name: Option<&str>,
        address: Option<&str>,
    ) -> EngineResult<AgentServer> {
        validate_id(id)?;
        validate_secret(secret)?;
        let hashed = hash(secret).await?;
        let now = Utc::now().timestamp();
        let repo = self.db.agents();
        let created = repo.upsert_secret(id, &hashed, name, now).await?;
        if address.is_some() {
            repo.touch(id, None, address, now).await?;
        }
        info!(agent = %id, created, "agent registered");

        let record = repo
            .find(id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("agent {id} vanished after register")))?;
        Ok(self.detail(&record, now).agent)
    }

    /// `false` for unknown ids as well as wrong secrets.
    pub async fn verify_secret(&self, id: &str, secret: &str) -> EngineResult<bool> {
        match self.db.agents().find(id).await? {
            Some(record) => verify(secret, &record.secret_hash).await,
            None => Ok(false),
        }
    }

    /// Authenticate a push, registering the agent on first contact, and
    /// store its snapshot. A rejected push changes nothing.
    pub async fn push(
        &self,
        id: &str,
        secret: &str,
        address: Option<&str>,
        snapshot: AgentSnapshot,
    ) -> EngineResult<PushReceipt> {
        let result = self
            .push_inner(id, secret, address, snapshot)
            .instrument(spans::agent(id, address))
            .await;
        metrics::record_agent_push(match &result {
            Ok(r) if r.registered => "registered",
            Ok(_) => "accepted",
            Err(e) => e.error_code(),
        });
        result
    }

    async fn push_inner(
        &self,
        id: &str,
        secret: &str,
        address: Option<&str>,
        snapshot: AgentSnapshot,
    ) -> EngineResult<PushReceipt> {
        validate_id(id)?;
        validate_secret(secret)?;
        let snapshot = snapshot.validate(&self.config)?;

        let repo = self.db.agents();
        let now = Utc::now().timestamp();
        let name = snapshot.name.as_deref();

        let registered = match repo.find(id).await? {
            Some(record) => {
                self.authenticate(id, secret, &record).await?;
                false
            }
            None => {
                let hashed = hash(secret).await?;
                if repo.insert_new(id, &hashed, name, address, now).await? {
                    warn!(agent = %id, "registered unknown agent on first push (bootstrap trust)");
                    true
                } else {
                    // Lost a race with a concurrent first push.
                    let record = repo.find(id).await?.ok_or_else(|| {
                        EngineError::Internal(format!("agent {id} vanished during push"))
                    })?;
                    self.authenticate(id, secret, &record).await?;
                    false
                }
            }
        };

        // Only authenticated pushes draw on the agent's quota, so a caller
        // without the secret cannot starve the real agent.
        if !self.limiter.check(id) {
            return Err(EngineError::RateLimited(format!(
                "agent {id} exceeded {} pushes per minute",
                self.config.max_pushes_per_minute
            )));
        }

        repo.touch(id, name, address, now).await?;
        let payload = serde_json::to_string(&snapshot)
            .map_err(|e| EngineError::Internal(format!("snapshot encoding failed: {e}")))?;
        let digest = digest(&payload);
        repo.store_snapshot(id, &payload, &digest, now, self.config.history_limit)
            .await?;

        info!(
            jails = snapshot.jails.len(),
            bans = snapshot.bans.len(),
            registered,
            "snapshot stored"
        );
        Ok(PushReceipt {
            accepted: true,
            registered,
            digest,
        })
    }

    async fn authenticate(&self, id: &str, secret: &str, record: &AgentRecord) -> EngineResult<()> {
        if verify(secret, &record.secret_hash).await? {
            Ok(())
        } else {
            warn!(agent = %id, "push rejected: secret mismatch");
            Err(EngineError::Authentication(id.to_string()))
        }
    }

    /// Every agent, most recently seen first.
    pub async fn list_agents(&self) -> EngineResult<Vec<AgentServer>> {
        let now = Utc::now().timestamp();
        let records = self.db.agents().list().await?;
        Ok(records.iter().map(|r| self.detail(r, now).agent).collect())
    }

    pub async fn get_agent(&self, id: &str) -> EngineResult<AgentDetail> {
        let record = self
            .db
            .agents()
            .find(id)
            .await?
            .ok_or_else(|| EngineError::not_found("agent", id))?;
        Ok(self.detail(&record, Utc::now().timestamp()))
    }

    /// Stored snapshots, newest first.
    pub async fn snapshot_history(&self, id: &str, limit: u32) -> EngineResult<Vec<SnapshotEntry>> {
        let repo = self.db.agents();
        if repo.find(id).await?.is_none() {
            return Err(EngineError::not_found("agent", id));
        }
        let rows: Vec<SnapshotRecord> = repo.history(id, limit.min(self.config.history_limit)).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let snapshot = parse_snapshot(&row.agent_id, &row.payload)?;
                Some(SnapshotEntry {
                    received_at: timestamp(row.received_at),
                    digest: row.digest,
                    snapshot,
                })
            })
            .collect())
    }

    /// Forget an agent and its history.
    pub async fn remove(&self, id: &str) -> EngineResult<()> {
        if self.db.agents().delete(id).await? {
            info!(agent = %id, "agent removed");
            Ok(())
        } else {
            Err(EngineError::not_found("agent", id))
        }
    }

    /// Periodic housekeeping for the push limiter.
    pub fn maintain(&self) {
        self.limiter.cleanup();
    }

    /// Close the registry database so its WAL is checkpointed.
    pub async fn close(&self) {
        self.db.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Category;

    async fn registry(config: AgentsConfig) -> AgentRegistry {
        AgentRegistry::new(Database::new(":memory:").await.unwrap(), config)
    }

    fn snapshot(banned: &[&str]) -> AgentSnapshot {
        AgentSnapshot {
            name: Some("edge".into()),
            jails: vec![PushedJail {
                name: "sshd".into(),
                enabled: true,
                currently_banned: banned.len() as u64,
                banned_addresses: banned.iter().map(|s| s.to_string()).collect(),
                total_banned: None,
                category: Some(Category::Ssh),
                severity: None,
            }],
            bans: Vec::new(),
            log_tail: vec!["line".into()],
        }
    }

    #[tokio::test]
    async fn first_push_registers_and_wrong_secret_is_rejected() {
        let reg = registry(AgentsConfig::default()).await;

        let receipt = reg
            .push("edge-01", "abc", Some("192.0.2.50"), snapshot(&["192.0.2.1"]))
            .await
            .unwrap();
        assert!(receipt.accepted);
        assert!(receipt.registered);

        let err = reg
            .push("edge-01", "xyz", None, snapshot(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));

        let detail = reg.get_agent("edge-01").await.unwrap();
        let snap = detail.snapshot.unwrap();
        assert_eq!(snap.jails[0].banned_addresses, vec!["192.0.2.1"]);
        assert_eq!(detail.agent.banned_count, 1);
        assert_eq!(detail.agent.last_address.as_deref(), Some("192.0.2.50"));
        assert_eq!(reg.snapshot_history("edge-01", 10).await.unwrap().len(), 1);

        assert!(reg.verify_secret("edge-01", "abc").await.unwrap());
        assert!(!reg.verify_secret("edge-01", "xyz").await.unwrap());
        assert!(!reg.verify_secret("nobody", "abc").await.unwrap());
    }

    #[tokio::test]
    async fn later_pushes_overwrite_latest_and_extend_history() {
        let reg = registry(AgentsConfig {
            history_limit: 2,
            ..AgentsConfig::default()
        })
        .await;
        for n in 0..3 {
            let banned: Vec<String> = (0..n).map(|i| format!("192.0.2.{i}")).collect();
            let banned: Vec<&str> = banned.iter().map(String::as_str).collect();
            let receipt = reg.push("edge-01", "abc", None, snapshot(&banned)).await.unwrap();
            assert_eq!(receipt.registered, n == 0);
        }
        let history = reg.snapshot_history("edge-01", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].snapshot.banned_count(), 2);

        let agents = reg.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert!(agents[0].online);
        assert_eq!(agents[0].name.as_deref(), Some("edge"));
    }

    #[tokio::test]
    async fn pre_registered_secret_wins_over_first_push() {
        let reg = registry(AgentsConfig::default()).await;
        reg.register("edge-02", "provisioned", Some("edge two"), None)
            .await
            .unwrap();
        let err = reg
            .push("edge-02", "attacker", None, snapshot(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
        assert!(reg.get_agent("edge-02").await.unwrap().snapshot.is_none());
        assert!(reg.push("edge-02", "provisioned", None, snapshot(&[])).await.is_ok());
    }

    #[tokio::test]
    async fn floods_are_rate_limited() {
        let reg = registry(AgentsConfig {
            max_pushes_per_minute: 2,
            ..AgentsConfig::default()
        })
        .await;
        assert!(reg.push("edge-01", "abc", None, snapshot(&[])).await.is_ok());
        assert!(reg.push("edge-01", "abc", None, snapshot(&[])).await.is_ok());
        let err = reg.push("edge-01", "abc", None, snapshot(&[])).await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimited(_)));
    }

    #[tokio::test]
    async fn rejected_pushes_do_not_spend_the_agent_quota() {
        let reg = registry(AgentsConfig {
            max_pushes_per_minute: 2,
            ..AgentsConfig::default()
        })
        .await;
        reg.register("edge-01", "abc", None, None).await.unwrap();
        for _ in 0..3 {
            let err = reg
                .push("edge-01", "wrong-secret", None, snapshot(&[]))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Authentication(_)));
        }
        assert!(reg.push("edge-01", "abc", None, snapshot(&[])).await.is_ok());
        assert!(reg.push("edge-01", "abc", None, snapshot(&[])).await.is_ok());
        let err = reg.push("edge-01", "abc", None, snapshot(&[])).await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimited(_)));
    }

    #[tokio::test]
    async fn inflated_ban_counts_do_not_break_reads() {
        let reg = registry(AgentsConfig::default()).await;
        let mut snap = snapshot(&["192.0.2.1"]);
        let mut other = snap.jails[0].clone();
        other.name = "nginx-404".into();
        snap.jails[0].currently_banned = u64::MAX;
        other.currently_banned = u64::MAX;
        snap.jails.push(other);
        reg.push("edge-01", "abc", None, snap).await.unwrap();

        let detail = reg.get_agent("edge-01").await.unwrap();
        assert_eq!(detail.agent.banned_count, 2);
        assert_eq!(reg.list_agents().await.unwrap()[0].banned_count, 2);
    }

    #[tokio::test]
    async fn closed_registry_refuses_queries() {
        let reg = registry(AgentsConfig::default()).await;
        reg.push("edge-01", "abc", None, snapshot(&[])).await.unwrap();
        reg.close().await;
        assert!(reg.list_agents().await.is_err());
    }

    #[tokio::test]
    async fn online_window_is_exclusive() {
        let reg = registry(AgentsConfig {
            online_window_secs: 0,
            ..AgentsConfig::default()
        })
        .await;
        reg.push("edge-01", "abc", None, snapshot(&[])).await.unwrap();
        assert!(!reg.list_agents().await.unwrap()[0].online);
    }

    #[tokio::test]
    async fn invalid_ids_and_unknown_agents() {
        let reg = registry(AgentsConfig::default()).await;
        let err = reg.push("bad id", "abc", None, snapshot(&[])).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        let err = reg.push("edge", "", None, snapshot(&[])).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        assert!(matches!(
            reg.get_agent("ghost").await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
        assert!(matches!(
            reg.snapshot_history("ghost", 5).await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
        assert!(reg.remove("ghost").await.is_err());
    }
}
