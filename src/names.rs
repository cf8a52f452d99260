//! Validated identifiers that end up as daemon process arguments.
//!
//! Jail names are passed to `fail2ban-client` as argv entries, so anything
//! outside `[A-Za-z0-9._-]` is rejected before any external call is made.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Longest jail name accepted. fail2ban itself has no limit, but section
/// names past this length only show up in hostile input.
pub const MAX_JAIL_NAME_LEN: usize = 64;

/// A jail name that matches `[A-Za-z0-9._-]+`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JailName(String);

impl JailName {
    /// Validate and wrap a jail name.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        if raw.is_empty() {
            return Err(EngineError::validation("jail", "name is empty"));
        }
        if raw.len() > MAX_JAIL_NAME_LEN {
            return Err(EngineError::validation(
                "jail",
                format!("name longer than {MAX_JAIL_NAME_LEN} characters"),
            ));
        }
        if let Some(bad) = raw.chars().find(|c| !is_jail_char(*c)) {
            return Err(EngineError::validation(
                "jail",
                format!("character {bad:?} is not allowed in {raw:?}"),
            ));
        }
        // A leading dash would be read as a CLI flag.
        if raw.starts_with('-') {
            return Err(EngineError::validation("jail", "name may not start with '-'"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Check a name without allocating.
pub fn is_valid_jail_name(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_JAIL_NAME_LEN
        && !raw.starts_with('-')
        && raw.chars().all(is_jail_char)
}

fn is_jail_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

impl fmt::Display for JailName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JailName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JailName {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JailName> for String {
    fn from(name: JailName) -> Self {
        name.0
    }
}

/// Parse a ban address. Only literal IPv4/IPv6 addresses are accepted.
pub fn parse_address(raw: &str) -> Result<IpAddr, EngineError> {
    raw.trim()
        .parse::<IpAddr>()
        .map_err(|_| EngineError::validation("address", format!("{raw:?} is not an IP address")))
}
