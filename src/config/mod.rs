//! Configuration loading and management.
//!
//! - [`types`]: config struct definitions and TOML loading
//! - [`validation`]: startup checks that collect every problem at once

mod types;
pub mod validation;

pub use types::{
    ActionsConfig, AgentsConfig, ApiConfig, AuditConfig, CacheConfig, Config, ConfigError,
    DaemonBackend, DaemonConfig, DatabaseConfig, DiscoveryConfig, EventLogConfig, LedgerConfig,
    LogFormat, PushConfig, ReconcileConfig, ServerConfig,
};
