//! Parsers for `fail2ban-client` status and query replies.
//!
//! Status replies are rendered as a tree:
//!
//! ```text
//! Status for the jail: sshd
//! |- Filter
//! |  |- Currently failed: 0
//! |  |- Total failed:     5
//! |  `- File list:        /var/log/auth.log
//! `- Actions
//!    |- Currently banned: 2
//!    |- Total banned:     10
//!    `- Banned IP list:   192.0.2.1 192.0.2.7
//! ```
//!
//! Only the `key: value` leaves matter; the tree glyphs are stripped.

use super::ParseError;
use serde::Serialize;

/// Parsed `fail2ban-client status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatus {
    pub jail_count: usize,
    pub jail_names: Vec<String>,
}

/// Parsed `fail2ban-client status <jail>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JailStatus {
    pub currently_failed: u64,
    pub total_failed: u64,
    pub file_list: Vec<String>,
    pub currently_banned: u64,
    pub total_banned: Option<u64>,
    /// Unique, in the order the daemon listed them.
    pub banned_addresses: Vec<String>,
}

/// Split a tree line into a lowercase key and its value.
fn leaf(line: &str) -> Option<(String, &str)> {
    let stripped = line.trim_start_matches(|c: char| matches!(c, '|' | '`' | '-' | ' ' | '\t'));
    let (key, value) = stripped.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_ascii_lowercase(), value.trim()))
}

fn parse_count(field: &'static str, value: &str) -> Result<u64, ParseError> {
    value.parse::<u64>().map_err(|_| ParseError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

fn dedupe_in_order<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(*s))
        .map(str::to_string)
        .collect()
}

/// Parse the global status reply.
pub fn parse_global_status(raw: &str) -> Result<GlobalStatus, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut count = None;
    let mut names = None;
    for line in raw.lines() {
        let Some((key, value)) = leaf(line) else {
            continue;
        };
        match key.as_str() {
            "number of jail" | "number of jails" => {
                count = Some(parse_count("Number of jail", value)?);
            }
            "jail list" => {
                names = Some(dedupe_in_order(value.split(',').map(str::trim)));
            }
            _ => {}
        }
    }

    let jail_names = names.ok_or(ParseError::MissingField("Jail list"))?;
    let jail_count = match count {
        Some(c) => c as usize,
        None => jail_names.len(),
    };
    Ok(GlobalStatus {
        jail_count,
        jail_names,
    })
}

/// Parse a single-jail status reply.
pub fn parse_jail_status(raw: &str) -> Result<JailStatus, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut status = JailStatus::default();
    let mut saw_banned = false;
    for line in raw.lines() {
        let Some((key, value)) = leaf(line) else {
            continue;
        };
        match key.as_str() {
            "currently failed" => status.currently_failed = parse_count("Currently failed", value)?,
            "total failed" => status.total_failed = parse_count("Total failed", value)?,
            "file list" | "journal matches" => {
                status.file_list = value.split_whitespace().map(str::to_string).collect();
            }
            "currently banned" => {
                status.currently_banned = parse_count("Currently banned", value)?;
                saw_banned = true;
            }
            "total banned" => status.total_banned = Some(parse_count("Total banned", value)?),
            "banned ip list" => {
                status.banned_addresses = dedupe_in_order(value.split_whitespace());
            }
            _ => {}
        }
    }

    if !saw_banned {
        return Err(ParseError::MissingField("Currently banned"));
    }
    Ok(status)
}

/// Parse a `get <jail> <setting>` reply into an integer.
pub fn parse_setting_value(raw: &str) -> Result<i64, ParseError> {
    let token = raw
        .split_whitespace()
        .next()
        .ok_or(ParseError::Empty)?;
    token.parse::<i64>().map_err(|_| ParseError::InvalidValue {
        field: "setting",
        value: token.to_string(),
    })
}

/// Parse a `ping` reply; `true` when the server answered.
pub fn parse_ping(raw: &str) -> Result<bool, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(raw.to_ascii_lowercase().contains("pong"))
}

/// Parse a `version` reply.
pub fn parse_version(raw: &str) -> Result<String, ParseError> {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or(ParseError::Empty)?;
    let version = line
        .trim_start_matches("Fail2Ban")
        .trim()
        .trim_start_matches('v')
        .trim();
    if version.is_empty() || !version.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(ParseError::Unrecognised(line.to_string()));
    }
    Ok(version.to_string())
}

/// Parse an `unbanip` reply into the number of addresses released.
pub fn parse_unban_reply(raw: &str) -> Result<u64, ParseError> {
    let token = raw
        .split_whitespace()
        .next()
        .ok_or(ParseError::Empty)?;
    parse_count("unbanip", token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLOBAL: &str = "Status\n|- Number of jail:\t2\n`- Jail list:\tsshd, nginx-404\n";

    const SSHD: &str = "Status for the jail: sshd\n\
|- Filter\n\
|  |- Currently failed:\t1\n\
|  |- Total failed:\t17\n\
|  `- File list:\t/var/log/auth.log\n\
`- Actions\n\
   |- Currently banned:\t2\n\
   |- Total banned:\t9\n\
   `- Banned IP list:\t192.0.2.1 198.51.100.7 192.0.2.1\n";

    #[test]
    fn parses_global_status() {
        let status = parse_global_status(GLOBAL).unwrap();
        assert_eq!(status.jail_count, 2);
        assert_eq!(status.jail_names, vec!["sshd", "nginx-404"]);
    }

    #[test]
    fn parses_empty_jail_list() {
        let status = parse_global_status("Status\n|- Number of jail:\t0\n`- Jail list:\t\n").unwrap();
        assert_eq!(status.jail_count, 0);
        assert!(status.jail_names.is_empty());
    }

    #[test]
    fn global_status_requires_jail_list() {
        assert_eq!(
            parse_global_status("Status\n|- Number of jail:\t2\n"),
            Err(ParseError::MissingField("Jail list"))
        );
        assert_eq!(parse_global_status("   "), Err(ParseError::Empty));
    }

    #[test]
    fn parses_jail_status_and_dedupes_addresses() {
        let status = parse_jail_status(SSHD).unwrap();
        assert_eq!(status.currently_failed, 1);
        assert_eq!(status.total_failed, 17);
        assert_eq!(status.file_list, vec!["/var/log/auth.log"]);
        assert_eq!(status.currently_banned, 2);
        assert_eq!(status.total_banned, Some(9));
        assert_eq!(status.banned_addresses, vec!["192.0.2.1", "198.51.100.7"]);
    }

    #[test]
    fn jail_status_with_journal_backend() {
        let raw = "Status for the jail: sshd\n|- Filter\n|  |- Currently failed:\t0\n|  |- Total failed:\t0\n|  `- Journal matches:\t_SYSTEMD_UNIT=sshd.service + _COMM=sshd\n`- Actions\n   |- Currently banned:\t0\n   |- Total banned:\t0\n   `- Banned IP list:\t\n";
        let status = parse_jail_status(raw).unwrap();
        assert_eq!(status.currently_banned, 0);
        assert!(status.banned_addresses.is_empty());
        assert_eq!(status.file_list.len(), 3);
    }

    #[test]
    fn jail_status_rejects_garbage_counts() {
        let raw = "`- Actions\n   |- Currently banned:\tmany\n";
        assert!(matches!(
            parse_jail_status(raw),
            Err(ParseError::InvalidValue { field: "Currently banned", .. })
        ));
        assert_eq!(
            parse_jail_status("Status for the jail: x\n"),
            Err(ParseError::MissingField("Currently banned"))
        );
    }

    #[test]
    fn parses_scalars() {
        assert_eq!(parse_setting_value("600\n"), Ok(600));
        assert_eq!(parse_setting_value("-1"), Ok(-1));
        assert!(parse_setting_value("ten").is_err());
        assert_eq!(parse_ping("Server replied: pong"), Ok(true));
        assert_eq!(parse_version("1.0.2\n"), Ok("1.0.2".to_string()));
        assert_eq!(parse_version("Fail2Ban v0.11.2"), Ok("0.11.2".to_string()));
        assert!(parse_version("hello").is_err());
        assert_eq!(parse_unban_reply("1\n"), Ok(1));
        assert_eq!(parse_unban_reply("0"), Ok(0));
    }
}
