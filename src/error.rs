//! Unified error handling for jailwarden.
//!
//! Layer-specific errors stay beside the code that raises them
//! (`RunnerError`, `DaemonError`, `DiscoveryError`, `DbError`); this module
//! holds the engine-level taxonomy every caller sees, with metric labels and
//! the HTTP mapping used by the API.

use crate::daemon::DaemonError;
use crate::db::DbError;
use crate::discovery::DiscoveryError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Diagnostic detail for an action whose post-condition did not hold.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationFailure {
    pub action: &'static str,
    /// Jail name, or `service` for daemon-wide actions.
    pub subject: String,
    pub target: String,
    pub actual: String,
    pub raw_output: String,
    pub likely_cause: String,
    pub suggested_check: String,
}

/// Diagnostic detail for a start refused before dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightFailure {
    pub jail: String,
    pub filter: String,
    pub config_file: Option<String>,
    pub searched: Vec<String>,
    pub suggested_check: String,
}

/// Engine errors, one variant per failure class callers must tell apart.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("enforcement daemon unavailable: {0}")]
    EnforcementUnavailable(String),

    /// A not-OK reply that is consistent with the jail already being in the
    /// requested state. Only surfaced when the caller asked for strict mode.
    #[error("daemon answered not-OK (already in desired state?): {0}")]
    IdempotentNoOp(String),

    #[error("{} on {} did not converge: wanted {}, observed {}", .0.action, .0.subject, .0.target, .0.actual)]
    ActionVerificationFailed(Box<VerificationFailure>),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("authentication failed for agent {0}")]
    Authentication(String),

    #[error("pre-flight check failed for {}: filter {} not found", .0.jail, .0.filter)]
    Preflight(Box<PreflightFailure>),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::EnforcementUnavailable(_) => "enforcement_unavailable",
            Self::IdempotentNoOp(_) => "idempotent_noop",
            Self::ActionVerificationFailed(_) => "action_verification_failed",
            Self::Validation { .. } => "validation_error",
            Self::Authentication(_) => "authentication_error",
            Self::Preflight(_) => "preflight_failed",
            Self::NotFound { .. } => "not_found",
            Self::RateLimited(_) => "rate_limited",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status used by the API layer.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) | Self::Storage(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::EnforcementUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::IdempotentNoOp(_) => StatusCode::CONFLICT,
            Self::ActionVerificationFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Preflight(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Structured detail for the JSON error body, if the variant has any.
    pub fn detail(&self) -> Option<Value> {
        match self {
            Self::ActionVerificationFailed(f) => serde_json::to_value(f.as_ref()).ok(),
            Self::Preflight(f) => serde_json::to_value(f.as_ref()).ok(),
            Self::Validation { field, .. } => Some(json!({ "field": field })),
            _ => None,
        }
    }
}

impl From<DaemonError> for EngineError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::NotOk(msg) => Self::IdempotentNoOp(msg),
            DaemonError::Malformed(msg) => Self::Internal(format!("malformed daemon output: {msg}")),
            other => Self::EnforcementUnavailable(other.to_string()),
        }
    }
}

impl From<DiscoveryError> for EngineError {
    fn from(err: DiscoveryError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, code = self.error_code(), "request failed");
        }
        let mut body = json!({
            "error": self.error_code(),
            "message": self.to_string(),
        });
        if let Some(detail) = self.detail() {
            body["detail"] = detail;
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::RunState;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineError::validation("jail", "bad").error_code(),
            "validation_error"
        );
        assert_eq!(
            EngineError::Authentication("a1".into()).error_code(),
            "authentication_error"
        );
        assert_eq!(EngineError::Internal("x".into()).error_code(), "internal_error");
    }

    #[test]
    fn test_daemon_error_mapping() {
        let nok: EngineError = DaemonError::NotOk("NOK: ('sshd',)".into()).into();
        assert!(matches!(nok, EngineError::IdempotentNoOp(_)));

        let down: EngineError = DaemonError::ServiceDown("socket".into()).into();
        assert!(matches!(down, EngineError::EnforcementUnavailable(_)));
        assert_eq!(down.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_verification_detail_is_serialized() {
        let err = EngineError::ActionVerificationFailed(Box::new(VerificationFailure {
            action: "stop",
            subject: "sshd".into(),
            target: RunState::Disabled.to_string(),
            actual: RunState::Enabled.to_string(),
            raw_output: "Jail stopped".into(),
            likely_cause: "daemon ignored the command".into(),
            suggested_check: "fail2ban-client status sshd".into(),
        }));
        let detail = err.detail().unwrap();
        assert_eq!(detail["target"], "DISABLED");
        assert_eq!(detail["actual"], "ENABLED");
        assert_eq!(detail["suggestedCheck"], "fail2ban-client status sshd");
        assert!(err.to_string().contains("did not converge"));
    }
}
