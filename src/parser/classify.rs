//! Error classification for raw daemon output.
//!
//! fail2ban-client reports most failures as free text on stderr with a
//! non-zero exit status. A handful of fixed signatures tell the interesting
//! cases apart; they are matched case-insensitively in one pass with an
//! Aho-Corasick automaton.

use super::excerpt;
use aho_corasick::AhoCorasick;
use serde::Serialize;
use std::sync::LazyLock;

/// Exit status shells use for "command not found".
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Failure class of a daemon invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Client binary missing.
    CommandNotFound,
    /// Client present, server not reachable.
    ServiceDown,
    /// Ambiguous not-OK: failed, or already in the desired state.
    NotOk,
    /// Output did not have the expected shape.
    Malformed,
    /// Non-zero exit without a known signature.
    Failed,
}

/// Outcome of [`classify_error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub is_error: bool,
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl Classification {
    fn ok() -> Self {
        Self {
            is_error: false,
            kind: None,
            message: String::new(),
        }
    }

    fn error(kind: ErrorKind, message: String) -> Self {
        Self {
            is_error: true,
            kind: Some(kind),
            message,
        }
    }
}

/// Signatures in priority order; a lower index wins when several match.
const SIGNATURES: &[(&str, ErrorKind)] = &[
    ("command not found", ErrorKind::CommandNotFound),
    ("fail2ban-client: not found", ErrorKind::CommandNotFound),
    ("failed to access socket path", ErrorKind::ServiceDown),
    ("is fail2ban running", ErrorKind::ServiceDown),
    ("unable to contact server", ErrorKind::ServiceDown),
    ("connection refused", ErrorKind::ServiceDown),
    ("could not find server", ErrorKind::ServiceDown),
    ("nok:", ErrorKind::NotOk),
    ("does not exist", ErrorKind::NotOk),
    ("unknownjailexception", ErrorKind::NotOk),
];

static MATCHER: LazyLock<Option<AhoCorasick>> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(SIGNATURES.iter().map(|(p, _)| *p))
        .map_err(|e| tracing::error!(error = %e, "failed to build signature matcher"))
        .ok()
});

/// Find the highest-priority signature present in `text`.
fn match_signature(text: &str) -> Option<ErrorKind> {
    match MATCHER.as_ref() {
        Some(ac) => ac
            .find_overlapping_iter(text)
            .map(|m| m.pattern().as_usize())
            .min()
            .map(|idx| SIGNATURES[idx].1),
        None => {
            let lower = text.to_ascii_lowercase();
            SIGNATURES
                .iter()
                .find(|(p, _)| lower.contains(p))
                .map(|(_, k)| *k)
        }
    }
}

/// First non-empty line of stderr, else of stdout.
fn headline(stdout: &str, stderr: &str) -> String {
    let first = |s: &str| {
        s.lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| excerpt(l, 240))
    };
    first(stderr).or_else(|| first(stdout)).unwrap_or_default()
}

/// Classify one daemon invocation from its raw output and exit status.
///
/// `exit_status` is `None` when the process was killed by a signal.
pub fn classify_error(stdout: &str, stderr: &str, exit_status: Option<i32>) -> Classification {
    // Status output can mention these phrases legitimately (file lists,
    // journal matches), so stdout only counts on a failed exit.
    let failed_exit = exit_status != Some(0);

    if exit_status == Some(EXIT_COMMAND_NOT_FOUND) {
        return Classification::error(ErrorKind::CommandNotFound, headline(stdout, stderr));
    }

    let from_stderr = match_signature(stderr);
    let from_stdout = if failed_exit { match_signature(stdout) } else { None };
    let kind = match (from_stderr, from_stdout) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    match kind {
        Some(kind) => Classification::error(kind, headline(stdout, stderr)),
        None if failed_exit => Classification::error(ErrorKind::Failed, headline(stdout, stderr)),
        None => Classification::ok(),
    }
}
