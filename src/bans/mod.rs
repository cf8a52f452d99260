//! Ban queries.
//!
//! Two independent sources, never merged: the ledger says what is banned
//! now, the event log says what happened. A missing source yields an empty
//! list plus an error note instead of a failed request.

mod history;
mod ledger;

pub use history::EventLog;
pub use ledger::{ActiveBan, BanLedger};

use serde::Serialize;
use tracing::debug;

use crate::config::{EventLogConfig, LedgerConfig};
use crate::parser::BanEvent;

/// Current bans, or why there are none to show.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBans {
    pub bans: Vec<ActiveBan>,
    pub errors: Vec<String>,
}

/// Recent ban events, newest first.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BanHistory {
    pub events: Vec<BanEvent>,
    pub errors: Vec<String>,
}

/// Query front for both ban sources.
#[derive(Clone)]
pub struct BanQueries {
    ledger: Option<BanLedger>,
    events: EventLog,
}

impl BanQueries {
    pub fn new(ledger: Option<BanLedger>, events: EventLog) -> Self {
        Self { ledger, events }
    }

    pub fn from_config(ledger: Option<&LedgerConfig>, events: &EventLogConfig) -> Self {
        Self::new(
            ledger.map(|l| BanLedger::open(&l.path)),
            EventLog::new(events.path.clone(), events.tail_bytes),
        )
    }

    /// Bans in force now, optionally for one jail.
    pub async fn active_bans(&self, jail: Option<&str>) -> ActiveBans {
        let Some(ledger) = &self.ledger else {
            return ActiveBans {
                bans: Vec::new(),
                errors: vec!["ban ledger not configured".to_string()],
            };
        };
        match ledger.active(jail, chrono::Utc::now().timestamp()).await {
            Ok(bans) => ActiveBans {
                bans,
                errors: Vec::new(),
            },
            Err(e) => {
                debug!(path = %ledger.path().display(), error = %e, "ban ledger unavailable");
                ActiveBans {
                    bans: Vec::new(),
                    errors: vec![format!("ban ledger unavailable: {e}")],
                }
            }
        }
    }

    pub async fn ban_history(&self, jail: Option<&str>, limit: usize) -> BanHistory {
        match self.events.history(jail, limit).await {
            Ok(events) => BanHistory {
                events,
                errors: Vec::new(),
            },
            Err(e) => BanHistory {
                events: Vec::new(),
                errors: vec![format!(
                    "event log {} unreadable: {e}",
                    self.events.path().display()
                )],
            },
        }
    }

    /// Raw log lines for agent snapshots.
    pub async fn log_tail(&self, lines: usize) -> Result<Vec<String>, String> {
        self.events
            .tail(lines)
            .await
            .map_err(|e| format!("event log {} unreadable: {e}", self.events.path().display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_sources_degrade_to_notes() {
        let q = BanQueries::new(None, EventLog::new("/nonexistent/f2b.log", 1024));
        let active = q.active_bans(None).await;
        assert!(active.bans.is_empty());
        assert_eq!(active.errors, vec!["ban ledger not configured"]);

        let history = q.ban_history(Some("sshd"), 10).await;
        assert!(history.events.is_empty());
        assert!(history.errors[0].contains("unreadable"));
        assert!(q.log_tail(5).await.is_err());
    }

    #[tokio::test]
    async fn unreadable_ledger_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let q = BanQueries::new(
            Some(BanLedger::open(&dir.path().join("absent.sqlite3"))),
            EventLog::new(dir.path().join("f2b.log"), 1024),
        );
        let active = q.active_bans(Some("sshd")).await;
        assert!(active.errors[0].starts_with("ban ledger unavailable"));
    }
}
