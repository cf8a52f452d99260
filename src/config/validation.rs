//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use std::path::Path;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("daemon.{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("daemon.max_concurrent_processes must be at least 1")]
    NoProcessSlots,
    #[error("reconcile.probe_concurrency must be at least 1")]
    NoProbeConcurrency,
    #[error("daemon.probe_timeout_ms ({probe}) must be below cache.latency_budget_ms ({budget})")]
    ProbeExceedsBudget { probe: u64, budget: u64 },
    #[error("daemon.client_binary '{0}' is not listed in daemon.allowed_binaries")]
    ClientNotAllowed(String),
    #[error("cache.stale_ttl_secs must be at least the longest fresh TTL ({0}s)")]
    StaleShorterThanFresh(u64),
    #[error("push.url must start with http:// or https://, got '{0}'")]
    InvalidPushUrl(String),
    #[error("push.{0} must not be empty")]
    EmptyPushField(&'static str),
    #[error("database.path parent directory does not exist: {0}")]
    DatabasePathInvalid(String),
    #[error("audit.path parent directory does not exist: {0}")]
    AuditPathInvalid(String),
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let daemon = &config.daemon;
    if daemon.command_timeout_ms == 0 {
        errors.push(ValidationError::ZeroTimeout("command_timeout_ms"));
    }
    if daemon.probe_timeout_ms == 0 {
        errors.push(ValidationError::ZeroTimeout("probe_timeout_ms"));
    }
    if daemon.max_concurrent_processes == 0 {
        errors.push(ValidationError::NoProcessSlots);
    }
    if config.reconcile.probe_concurrency == 0 {
        errors.push(ValidationError::NoProbeConcurrency);
    }
    if daemon.probe_timeout_ms >= config.cache.latency_budget_ms {
        errors.push(ValidationError::ProbeExceedsBudget {
            probe: daemon.probe_timeout_ms,
            budget: config.cache.latency_budget_ms,
        });
    }

    let client_name = Path::new(&daemon.client_binary)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&daemon.client_binary);
    if !daemon.allowed_binaries.iter().any(|b| b == client_name) {
        errors.push(ValidationError::ClientNotAllowed(daemon.client_binary.clone()));
    }

    let cache = &config.cache;
    let longest_fresh = [
        cache.jail_list_ttl_secs,
        cache.jail_detail_ttl_secs,
        cache.host_ttl_secs,
        cache.bans_ttl_secs,
        cache.history_ttl_secs,
    ]
    .into_iter()
    .max()
    .unwrap_or(0);
    if cache.stale_ttl_secs < longest_fresh {
        errors.push(ValidationError::StaleShorterThanFresh(longest_fresh));
    }

    if let Some(ref push) = config.push {
        if !(push.url.starts_with("http://") || push.url.starts_with("https://")) {
            errors.push(ValidationError::InvalidPushUrl(push.url.clone()));
        }
        if push.server_id.trim().is_empty() {
            errors.push(ValidationError::EmptyPushField("server_id"));
        }
        if push.secret.trim().is_empty() {
            errors.push(ValidationError::EmptyPushField("secret"));
        }
    }

    if config.database.path != ":memory:" {
        let db_path = Path::new(&config.database.path);
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            errors.push(ValidationError::DatabasePathInvalid(config.database.path.clone()));
        }
    }

    if let Some(ref path) = config.audit.path
        && let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        errors.push(ValidationError::AuditPathInvalid(path.display().to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
