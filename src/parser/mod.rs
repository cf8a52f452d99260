//! Parsers for enforcement daemon output and configuration text.
//!
//! Every structural parser is a plain `fn(&str) -> Result<T, ParseError>`.
//! Callers go through [`safe_parse`], which always hands back a value (the
//! parsed one or the supplied default) plus an optional error note, so a
//! parse failure never escapes as an error of its own.
//!
//! [`classify_error`] must run before any structural parser: feeding an
//! error message to a status parser is meaningless.

pub mod classify;
pub mod events;
pub mod ini;
pub mod status;

pub use classify::{Classification, ErrorKind, classify_error};
pub use events::{BanAction, BanEvent, parse_event_line, parse_event_log};
pub use ini::{IniDocument, IniSection, parse_sections};
pub use status::{
    parse_global_status, parse_jail_status, parse_ping, parse_setting_value, parse_unban_reply,
    parse_version,
};

use thiserror::Error;

/// Structural parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty output")]
    Empty,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("unrecognised output: {0}")]
    Unrecognised(String),
}

/// Result of a [`safe_parse`] call: always a value, sometimes a note.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome<T> {
    pub value: T,
    pub error: Option<String>,
}

impl<T> ParseOutcome<T> {
    /// Convert back into a `Result`, for callers that must propagate.
    pub fn into_result(self) -> Result<T, String> {
        match self.error {
            None => Ok(self.value),
            Some(e) => Err(e),
        }
    }
}

/// Run `parser` over `input`, falling back to `default` on failure.
pub fn safe_parse<T, F>(parser: F, input: &str, default: T) -> ParseOutcome<T>
where
    F: FnOnce(&str) -> Result<T, ParseError>,
{
    match parser(input) {
        Ok(value) => ParseOutcome { value, error: None },
        Err(e) => {
            tracing::debug!(error = %e, bytes = input.len(), "parser fell back to default");
            ParseOutcome {
                value: default,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Truncate text for inclusion in error messages and audit records.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push('…');
    out
}
