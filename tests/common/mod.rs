//! Integration test common infrastructure.
//!
//! Builds an [`Engine`] over a temporary fail2ban configuration tree and an
//! in-memory daemon, so tests can script the daemon and watch the engine.

#![allow(dead_code)]

use jailwarden::audit::AuditLog;
use jailwarden::bans::{BanLedger, BanQueries, EventLog};
use jailwarden::config::{ActionsConfig, AgentsConfig, CacheConfig, DiscoveryConfig, ReconcileConfig};
use jailwarden::agents::AgentRegistry;
use jailwarden::daemon::MemoryDaemon;
use jailwarden::db::Database;
use jailwarden::{Engine, EngineParams};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const JAIL_CONF: &str = "\
[DEFAULT]
bantime = 10m

[sshd]
enabled = true
port = ssh
maxretry = 5

[nginx-404]
enabled = true
filter = nginx-404
";

/// A host under test: config tree, simulated daemon and the engine on top.
pub struct TestHost {
    pub dir: TempDir,
    pub daemon: Arc<MemoryDaemon>,
    pub engine: Engine,
}

pub struct TestHostBuilder {
    jail_conf: String,
    ledger: bool,
    agents: Option<AgentsConfig>,
    cache: CacheConfig,
}

impl Default for TestHostBuilder {
    fn default() -> Self {
        Self {
            jail_conf: JAIL_CONF.to_string(),
            ledger: false,
            agents: None,
            cache: CacheConfig::default(),
        }
    }
}

impl TestHostBuilder {
    pub fn jail_conf(mut self, text: &str) -> Self {
        self.jail_conf = text.to_string();
        self
    }

    /// Create an empty fail2ban ledger next to the config tree.
    pub fn with_ledger(mut self) -> Self {
        self.ledger = true;
        self
    }

    pub fn with_agents(mut self, config: AgentsConfig) -> Self {
        self.agents = Some(config);
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub async fn build(self) -> TestHost {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "jail.conf", &self.jail_conf);
        write(dir.path(), "filter.d/sshd.conf", "[Definition]\nfailregex = ^Failed\n");
        write(dir.path(), "filter.d/nginx-404.conf", "[Definition]\nfailregex = 404\n");

        let ledger = if self.ledger {
            let path = dir.path().join("fail2ban.sqlite3");
            create_ledger(&path).await;
            Some(BanLedger::open(&path))
        } else {
            None
        };
        let events = EventLog::new(dir.path().join("fail2ban.log"), 64 * 1024);

        let agents = match self.agents {
            Some(config) => {
                let db = Database::new(":memory:").await.expect("database");
                Some(AgentRegistry::new(db, config))
            }
            None => None,
        };

        let daemon = Arc::new(MemoryDaemon::new());
        let engine = Engine::new(EngineParams {
            server_name: "test-host".to_string(),
            daemon: daemon.clone(),
            discovery: DiscoveryConfig {
                config_dir: dir.path().to_path_buf(),
                ..DiscoveryConfig::default()
            },
            reconcile: ReconcileConfig {
                include_host_stats: false,
                ..ReconcileConfig::default()
            },
            actions: ActionsConfig {
                settle_delay_ms: 5,
                restart_settle_ms: 5,
                ..ActionsConfig::default()
            },
            cache: self.cache,
            probe_timeout: Duration::from_millis(300),
            bans: BanQueries::new(ledger, events),
            audit: Arc::new(AuditLog::in_memory(100)),
            agents,
        });

        TestHost {
            dir,
            daemon,
            engine,
        }
    }
}

impl TestHost {
    pub fn builder() -> TestHostBuilder {
        TestHostBuilder::default()
    }

    /// Default host with `sshd` running and `nginx-404` stopped.
    pub async fn standard() -> Self {
        let host = Self::builder().build().await;
        host.daemon.add_jail("sshd", true);
        host.daemon.add_jail("nginx-404", false);
        host
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        write(self.dir.path(), rel, content);
    }
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, content).expect("write");
}

/// Minimal fail2ban ledger schema with one table of bans.
pub async fn create_ledger(path: &Path) {
    use sqlx::Connection;
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let mut conn = sqlx::SqliteConnection::connect(&url)
        .await
        .expect("ledger connect");
    sqlx::query(
        "CREATE TABLE bips (ip TEXT, jail TEXT, timeofban INTEGER, bantime INTEGER, bancount INTEGER, data TEXT)",
    )
    .execute(&mut conn)
    .await
    .expect("ledger schema");
    conn.close().await.expect("ledger close");
}

pub async fn ledger_insert(path: &Path, jail: &str, ip: &str, time_of_ban: i64, ban_time: i64) {
    use sqlx::Connection;
    let url = format!("sqlite://{}", path.display());
    let mut conn = sqlx::SqliteConnection::connect(&url)
        .await
        .expect("ledger connect");
    sqlx::query("INSERT INTO bips (ip, jail, timeofban, bantime, bancount, data) VALUES (?, ?, ?, ?, 1, '{}')")
        .bind(ip)
        .bind(jail)
        .bind(time_of_ban)
        .bind(ban_time)
        .execute(&mut conn)
        .await
        .expect("ledger insert");
    conn.close().await.expect("ledger close");
}
