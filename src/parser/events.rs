//! Event-log line parser for ban history.
//!
//! Matches the daemon's action lines:
//!
//! ```text
//! 2024-05-02 13:37:01,512 fail2ban.actions        [811]: NOTICE  [sshd] Ban 192.0.2.10
//! 2024-05-02 13:47:01,771 fail2ban.actions        [811]: NOTICE  [sshd] Unban 192.0.2.10
//! 2024-05-02 14:00:00,004 fail2ban.actions        [811]: NOTICE  [sshd] Restore Ban 192.0.2.11
//! ```
//!
//! Log timestamps are host-local; they are converted to UTC on parse.

use super::ParseError;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static EVENT_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})(?:,\d+)?\s+fail2ban\.\S+\s*(?:\[\d+\])?:\s+\w+\s+\[(?P<jail>[^\]]+)\]\s+(?P<action>Restore Ban|Ban|Unban)\s+(?P<addr>\S+)",
    )
    .map_err(|e| tracing::error!(error = %e, "failed to compile event-line pattern"))
    .ok()
});

/// What happened to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BanAction {
    Ban,
    Unban,
    /// Ban re-applied from the ledger after a daemon restart.
    Restore,
}

/// One historical ban event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BanEvent {
    pub jail: String,
    pub address: String,
    pub action: BanAction,
    pub timestamp: DateTime<Utc>,
}

fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    // DST gaps have no local mapping; treat the wall clock as UTC then.
    match Local.from_local_datetime(&naive).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

/// Parse one log line. Non-action lines yield `Unrecognised`.
pub fn parse_event_line(line: &str) -> Result<BanEvent, ParseError> {
    let re = EVENT_LINE
        .as_ref()
        .ok_or_else(|| ParseError::Unrecognised("event pattern unavailable".to_string()))?;
    let caps = re
        .captures(line.trim_end())
        .ok_or_else(|| ParseError::Unrecognised(super::excerpt(line, 80)))?;

    let ts = &caps["ts"];
    let naive = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").map_err(|_| {
        ParseError::InvalidValue {
            field: "timestamp",
            value: ts.to_string(),
        }
    })?;

    let action = match &caps["action"] {
        "Ban" => BanAction::Ban,
        "Unban" => BanAction::Unban,
        _ => BanAction::Restore,
    };

    Ok(BanEvent {
        jail: caps["jail"].to_string(),
        address: caps["addr"].to_string(),
        action,
        timestamp: local_to_utc(naive),
    })
}

/// Parse every action line in a log excerpt, in file order.
pub fn parse_event_log(raw: &str) -> Result<Vec<BanEvent>, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(raw
        .lines()
        .filter_map(|line| parse_event_line(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_naive(event: &BanEvent) -> String {
        event
            .timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    #[test]
    fn parses_ban_line() {
        let line = "2024-05-02 13:37:01,512 fail2ban.actions        [811]: NOTICE  [sshd] Ban 192.0.2.10";
        let event = parse_event_line(line).unwrap();
        assert_eq!(event.jail, "sshd");
        assert_eq!(event.address, "192.0.2.10");
        assert_eq!(event.action, BanAction::Ban);
        assert_eq!(local_naive(&event), "2024-05-02 13:37:01");
    }

    #[test]
    fn parses_unban_and_restore() {
        let unban = parse_event_line(
            "2024-05-02 13:47:01,771 fail2ban.actions [811]: NOTICE [nginx-404] Unban 2001:db8::7",
        )
        .unwrap();
        assert_eq!(unban.action, BanAction::Unban);
        assert_eq!(unban.jail, "nginx-404");
        assert_eq!(unban.address, "2001:db8::7");

        let restore = parse_event_line(
            "2024-05-02 14:00:00,004 fail2ban.actions        [811]: NOTICE  [sshd] Restore Ban 192.0.2.11",
        )
        .unwrap();
        assert_eq!(restore.action, BanAction::Restore);
        assert_eq!(restore.address, "192.0.2.11");
    }

    #[test]
    fn ignores_non_action_lines() {
        let found = "2024-05-02 13:37:00,100 fail2ban.filter         [811]: INFO    [sshd] Found 192.0.2.10 - 2024-05-02 13:37:00";
        assert!(matches!(parse_event_line(found), Err(ParseError::Unrecognised(_))));
        assert!(parse_event_line("random text").is_err());
    }

    #[test]
    fn parses_log_excerpt_in_order() {
        let raw = "\
2024-05-02 13:37:00,100 fail2ban.filter         [811]: INFO    [sshd] Found 192.0.2.10 - 2024-05-02 13:37:00
2024-05-02 13:37:01,512 fail2ban.actions        [811]: NOTICE  [sshd] Ban 192.0.2.10
2024-05-02 13:47:01,771 fail2ban.actions        [811]: NOTICE  [sshd] Unban 192.0.2.10
";
        let events = parse_event_log(raw).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, BanAction::Ban);
        assert_eq!(events[1].action, BanAction::Unban);
        assert!(events[0].timestamp < events[1].timestamp);
        assert_eq!(parse_event_log(""), Err(ParseError::Empty));
    }
}
