//! Audit trail for control actions.
//!
//! Every control request produces an `attempt` record before dispatch and an
//! `outcome` record afterwards, sharing one request id. Records go to an
//! optional JSON-lines file, to the `audit` tracing target, and to a bounded
//! in-memory ring served by the API.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuditConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditPhase {
    Attempt,
    Outcome,
}

/// One audit line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub phase: AuditPhase,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jail: Option<String>,
    /// Secondary subject, e.g. the unbanned address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Subject of an audited request.
#[derive(Debug, Clone)]
pub struct AuditSubject {
    pub request_id: Uuid,
    pub action: String,
    pub jail: Option<String>,
    pub target: Option<String>,
}

pub struct AuditLog {
    file: tokio::sync::Mutex<Option<File>>,
    recent: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl AuditLog {
    /// Ring-only log; nothing is written to disk.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            file: tokio::sync::Mutex::new(None),
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub async fn open(config: &AuditConfig) -> std::io::Result<Self> {
        let log = Self::in_memory(config.recent_capacity);
        if let Some(path) = &config.path {
            *log.file.lock().await = Some(Self::open_file(path).await?);
        }
        Ok(log)
    }

    async fn open_file(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path).await
    }

    /// Record that an action is about to be dispatched.
    pub async fn attempt(
        &self,
        action: &str,
        jail: Option<&str>,
        target: Option<&str>,
    ) -> AuditSubject {
        let subject = AuditSubject {
            request_id: Uuid::new_v4(),
            action: action.to_string(),
            jail: jail.map(str::to_string),
            target: target.map(str::to_string),
        };
        self.append(&subject, AuditPhase::Attempt, None, None).await;
        subject
    }

    /// Record how an attempted action ended.
    pub async fn outcome(&self, subject: &AuditSubject, success: bool, detail: impl Into<String>) {
        self.append(subject, AuditPhase::Outcome, Some(success), Some(detail.into()))
            .await;
    }

    async fn append(
        &self,
        subject: &AuditSubject,
        phase: AuditPhase,
        success: Option<bool>,
        detail: Option<String>,
    ) {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            request_id: subject.request_id,
            timestamp: Utc::now(),
            phase,
            action: subject.action.clone(),
            jail: subject.jail.clone(),
            target: subject.target.clone(),
            success,
            detail,
        };

        info!(
            target: "audit",
            request_id = %record.request_id,
            phase = ?record.phase,
            action = %record.action,
            jail = record.jail.as_deref().unwrap_or("-"),
            success = ?record.success,
            detail = record.detail.as_deref().unwrap_or(""),
            "audit"
        );

        let mut file = self.file.lock().await;
        if let Some(f) = file.as_mut() {
            match serde_json::to_string(&record) {
                Ok(mut line) => {
                    line.push('\n');
                    let written = match f.write_all(line.as_bytes()).await {
                        Ok(()) => f.flush().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        warn!(error = %e, "failed to write audit record");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode audit record"),
            }
        }
        drop(file);

        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }
}
