//! Core configuration types and loading.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration. Every section has defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Read-only ban ledger (fail2ban's own SQLite database).
    pub ledger: Option<LedgerConfig>,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    /// Agent mode: push our own snapshot to a central instance.
    pub push: Option<PushConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server identity and listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Name reported in health responses and pushed snapshots.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// API listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Prometheus metrics HTTP port (default: 9090, 0 disables).
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            listen: default_listen(),
            metrics_port: None,
            log_format: LogFormat::default(),
        }
    }
}

fn default_server_name() -> String {
    "jailwarden".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8087))
}

/// HTTP API access control.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Bearer token required on control routes. Unset means no check.
    pub token: Option<String>,
}

/// Which daemon adapter to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonBackend {
    /// Spawn `fail2ban-client`.
    #[default]
    Cli,
    /// In-process simulation (dry runs, staging).
    Memory,
}

/// Enforcement daemon access.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub backend: DaemonBackend,
    /// Client binary name or absolute path.
    #[serde(default = "default_client_binary")]
    pub client_binary: String,
    /// Program file names the command runner may execute.
    #[serde(default = "default_allowed_binaries")]
    pub allowed_binaries: Vec<String>,
    /// Extra arguments placed before every command (e.g. `-s <socket>`).
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Timeout for control commands, in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Timeout for a single jail status probe, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Cap on captured stdout/stderr per command, in bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Cap on concurrently running external processes.
    #[serde(default = "default_max_concurrent_processes")]
    pub max_concurrent_processes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backend: DaemonBackend::default(),
            client_binary: default_client_binary(),
            allowed_binaries: default_allowed_binaries(),
            extra_args: Vec::new(),
            command_timeout_ms: default_command_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_concurrent_processes: default_max_concurrent_processes(),
        }
    }
}

impl DaemonConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_client_binary() -> String {
    "fail2ban-client".to_string()
}

fn default_allowed_binaries() -> Vec<String> {
    vec!["fail2ban-client".to_string()]
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_concurrent_processes() -> usize {
    8
}

/// Jail discovery from static configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// fail2ban configuration root.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Section names that never denote a jail (compared case-insensitively).
    #[serde(default = "default_reserved_sections")]
    pub reserved_sections: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            reserved_sections: default_reserved_sections(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/fail2ban")
}

fn default_reserved_sections() -> Vec<String> {
    ["DEFAULT", "INCLUDES", "Definition", "Init"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Reconciliation pass tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Per-jail probes in flight at once.
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    /// Gather host stats as part of the jail list.
    #[serde(default = "default_true")]
    pub include_host_stats: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            probe_concurrency: default_probe_concurrency(),
            include_host_stats: true,
        }
    }
}

fn default_probe_concurrency() -> usize {
    4
}

/// Control action timing.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionsConfig {
    /// Wait between dispatch and verification probe, in milliseconds.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Wait between restart verification pings, in milliseconds.
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
    /// Pings attempted after a restart before giving up.
    #[serde(default = "default_restart_verify_attempts")]
    pub restart_verify_attempts: u32,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            restart_settle_ms: default_restart_settle_ms(),
            restart_verify_attempts: default_restart_verify_attempts(),
        }
    }
}

impl ActionsConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_restart_settle_ms() -> u64 {
    1_000
}

fn default_restart_verify_attempts() -> u32 {
    10
}

/// Cache TTLs per resource class.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_jail_list_ttl")]
    pub jail_list_ttl_secs: u64,
    #[serde(default = "default_jail_list_ttl")]
    pub jail_detail_ttl_secs: u64,
    #[serde(default = "default_host_ttl")]
    pub host_ttl_secs: u64,
    #[serde(default = "default_bans_ttl")]
    pub bans_ttl_secs: u64,
    #[serde(default = "default_history_ttl")]
    pub history_ttl_secs: u64,
    /// Lifetime of the stale shadow copy written next to every value.
    #[serde(default = "default_stale_ttl")]
    pub stale_ttl_secs: u64,
    /// How long a reader waits for the live path before taking the stale copy.
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            jail_list_ttl_secs: default_jail_list_ttl(),
            jail_detail_ttl_secs: default_jail_list_ttl(),
            host_ttl_secs: default_host_ttl(),
            bans_ttl_secs: default_bans_ttl(),
            history_ttl_secs: default_history_ttl(),
            stale_ttl_secs: default_stale_ttl(),
            latency_budget_ms: default_latency_budget_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }
}

fn default_jail_list_ttl() -> u64 {
    5
}

fn default_host_ttl() -> u64 {
    15
}

fn default_bans_ttl() -> u64 {
    30
}

fn default_history_ttl() -> u64 {
    60
}

fn default_stale_ttl() -> u64 {
    600
}

fn default_latency_budget_ms() -> u64 {
    8_000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Read-only ban ledger.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Path to fail2ban's SQLite database.
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("/var/lib/fail2ban/fail2ban.sqlite3")
}

/// Daemon event log (ban history source).
#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    #[serde(default = "default_event_log_path")]
    pub path: PathBuf,
    /// Bytes read from the end of the log per query.
    #[serde(default = "default_tail_bytes")]
    pub tail_bytes: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: default_event_log_path(),
            tail_bytes: default_tail_bytes(),
        }
    }
}

fn default_event_log_path() -> PathBuf {
    PathBuf::from("/var/log/fail2ban.log")
}

fn default_tail_bytes() -> u64 {
    1024 * 1024
}

/// Audit log.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// JSON-lines file. Unset keeps records in memory and in the trace log only.
    pub path: Option<PathBuf>,
    /// Records kept in memory for the audit endpoint.
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            recent_capacity: default_recent_capacity(),
        }
    }
}

fn default_recent_capacity() -> usize {
    500
}

/// Registry database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "jailwarden.db".to_string()
}

/// Agent registry and push endpoint limits.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    /// An agent counts as online if it pushed within this window.
    #[serde(default = "default_online_window")]
    pub online_window_secs: i64,
    /// Snapshots kept per agent.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
    #[serde(default = "default_max_pushes_per_minute")]
    pub max_pushes_per_minute: u32,
    #[serde(default = "default_max_payload_jails")]
    pub max_payload_jails: usize,
    #[serde(default = "default_max_payload_bans")]
    pub max_payload_bans: usize,
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            online_window_secs: default_online_window(),
            history_limit: default_history_limit(),
            max_pushes_per_minute: default_max_pushes_per_minute(),
            max_payload_jails: default_max_payload_jails(),
            max_payload_bans: default_max_payload_bans(),
            max_log_lines: default_max_log_lines(),
        }
    }
}

fn default_online_window() -> i64 {
    120
}

fn default_history_limit() -> u32 {
    50
}

fn default_max_pushes_per_minute() -> u32 {
    30
}

fn default_max_payload_jails() -> usize {
    500
}

fn default_max_payload_bans() -> usize {
    10_000
}

fn default_max_log_lines() -> usize {
    200
}

/// Agent mode upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Base URL of the central instance (e.g. `https://central:8087`).
    pub url: String,
    pub server_id: String,
    pub secret: String,
    pub name: Option<String>,
    #[serde(default = "default_push_interval")]
    pub interval_secs: u64,
    /// Log lines included per snapshot.
    #[serde(default = "default_push_log_lines")]
    pub log_lines: usize,
}

fn default_push_interval() -> u64 {
    30
}

fn default_push_log_lines() -> usize {
    50
}

pub(super) fn default_true() -> bool {
    true
}
