//! Snapshot payload pushed by agents.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bans::ActiveBan;
use crate::config::AgentsConfig;
use crate::error::{EngineError, EngineResult};
use crate::names::is_valid_jail_name;
use crate::reconcile::{Category, ReconciledJail, Severity};

/// Longest display name accepted from an agent.
const MAX_NAME_LEN: usize = 128;
/// Log lines longer than this are cut.
const MAX_LOG_LINE_LEN: usize = 2048;

/// One jail as an agent sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedJail {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub currently_banned: u64,
    #[serde(default)]
    pub banned_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_banned: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl From<&ReconciledJail> for PushedJail {
    fn from(jail: &ReconciledJail) -> Self {
        Self {
            name: jail.name.to_string(),
            enabled: jail.enabled,
            currently_banned: jail.currently_banned,
            banned_addresses: jail.banned_addresses.clone(),
            total_banned: jail.total_banned,
            category: Some(jail.category),
            severity: Some(jail.severity),
        }
    }
}

/// Body of `POST /api/agents/push`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub jails: Vec<PushedJail>,
    #[serde(default)]
    pub bans: Vec<ActiveBan>,
    #[serde(default)]
    pub log_tail: Vec<String>,
}

impl AgentSnapshot {
    /// Enforce size caps and jail naming, and normalise what can be.
    pub fn validate(mut self, limits: &AgentsConfig) -> EngineResult<Self> {
        if self.jails.len() > limits.max_payload_jails {
            return Err(EngineError::validation(
                "jails",
                format!("{} jails exceeds the limit of {}", self.jails.len(), limits.max_payload_jails),
            ));
        }
        if self.bans.len() > limits.max_payload_bans {
            return Err(EngineError::validation(
                "bans",
                format!("{} bans exceeds the limit of {}", self.bans.len(), limits.max_payload_bans),
            ));
        }
        if self.log_tail.len() > limits.max_log_lines {
            return Err(EngineError::validation(
                "logTail",
                format!(
                    "{} lines exceeds the limit of {}",
                    self.log_tail.len(),
                    limits.max_log_lines
                ),
            ));
        }
        if let Some(name) = &self.name
            && name.chars().count() > MAX_NAME_LEN
        {
            return Err(EngineError::validation(
                "name",
                format!("longer than {MAX_NAME_LEN} characters"),
            ));
        }
        if let Some(bad) = self.jails.iter().find(|j| !is_valid_jail_name(&j.name)) {
            return Err(EngineError::validation(
                "jails",
                format!("invalid jail name {:?}", bad.name),
            ));
        }

        for jail in &mut self.jails {
            if jail.enabled {
                // A count is only believed as far as the addresses back it.
                jail.currently_banned = jail.currently_banned.min(jail.banned_addresses.len() as u64);
            } else {
                jail.currently_banned = 0;
                jail.banned_addresses.clear();
            }
        }
        for line in &mut self.log_tail {
            if line.len() > MAX_LOG_LINE_LEN {
                let mut cut = MAX_LOG_LINE_LEN;
                while !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                line.truncate(cut);
            }
        }
        Ok(self)
    }

    pub fn banned_count(&self) -> u64 {
        self.jails
            .iter()
            .fold(0u64, |total, j| total.saturating_add(j.currently_banned))
    }

    pub fn active_jails(&self) -> usize {
        self.jails.iter().filter(|j| j.enabled).count()
    }
}

/// Hex SHA-256 of the stored payload.
pub fn digest(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jail(name: &str, enabled: bool, bans: &[&str]) -> PushedJail {
        PushedJail {
            name: name.to_string(),
            enabled,
            currently_banned: bans.len() as u64,
            banned_addresses: bans.iter().map(|s| s.to_string()).collect(),
            total_banned: None,
            category: None,
            severity: None,
        }
    }

    #[test]
    fn parses_minimal_body() {
        let snap: AgentSnapshot =
            serde_json::from_str(r#"{"jails":[{"name":"sshd","enabled":true}]}"#).unwrap();
        assert_eq!(snap.jails.len(), 1);
        assert!(snap.bans.is_empty());
        assert!(snap.log_tail.is_empty());
    }

    #[test]
    fn caps_are_enforced() {
        let limits = AgentsConfig {
            max_payload_jails: 1,
            ..AgentsConfig::default()
        };
        let snap = AgentSnapshot {
            jails: vec![jail("a", true, &[]), jail("b", true, &[])],
            ..AgentSnapshot::default()
        };
        let err = snap.validate(&limits).unwrap_err();
        assert_eq!(err.error_code(), "validation_error");

        let limits = AgentsConfig {
            max_log_lines: 1,
            ..AgentsConfig::default()
        };
        let snap = AgentSnapshot {
            log_tail: vec!["a".into(), "b".into()],
            ..AgentSnapshot::default()
        };
        assert!(snap.validate(&limits).is_err());
    }

    #[test]
    fn rejects_bad_jail_names() {
        let snap = AgentSnapshot {
            jails: vec![jail("ssh d", true, &[])],
            ..AgentSnapshot::default()
        };
        assert!(snap.validate(&AgentsConfig::default()).is_err());
    }

    #[test]
    fn disabled_jails_lose_their_bans() {
        let snap = AgentSnapshot {
            jails: vec![jail("sshd", false, &["192.0.2.1"]), jail("nginx-404", true, &["192.0.2.2"])],
            log_tail: vec!["x".repeat(5000)],
            ..AgentSnapshot::default()
        };
        let snap = snap.validate(&AgentsConfig::default()).unwrap();
        assert_eq!(snap.jails[0].currently_banned, 0);
        assert!(snap.jails[0].banned_addresses.is_empty());
        assert_eq!(snap.banned_count(), 1);
        assert_eq!(snap.active_jails(), 1);
        assert_eq!(snap.log_tail[0].len(), MAX_LOG_LINE_LEN);
    }

    #[test]
    fn inflated_counts_are_clamped_to_listed_addresses() {
        let mut huge = jail("sshd", true, &["192.0.2.1"]);
        huge.currently_banned = u64::MAX;
        let mut bare = jail("nginx-404", true, &[]);
        bare.currently_banned = u64::MAX;
        let snap = AgentSnapshot {
            jails: vec![huge, bare],
            ..AgentSnapshot::default()
        };
        let snap = snap.validate(&AgentsConfig::default()).unwrap();
        assert_eq!(snap.jails[0].currently_banned, 1);
        assert_eq!(snap.jails[1].currently_banned, 0);
        assert_eq!(snap.banned_count(), 1);
    }

    #[test]
    fn banned_count_saturates() {
        let mut a = jail("a", true, &[]);
        a.currently_banned = u64::MAX;
        let mut b = jail("b", true, &[]);
        b.currently_banned = u64::MAX;
        let snap = AgentSnapshot {
            jails: vec![a, b],
            ..AgentSnapshot::default()
        };
        assert_eq!(snap.banned_count(), u64::MAX);
    }

    #[test]
    fn digest_is_stable_hex() {
        let d = digest("{}");
        assert_eq!(d.len(), 64);
        assert_eq!(d, digest("{}"));
        assert_ne!(d, digest("[]"));
    }
}
