//! Jail classification by service keyword.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Ssh,
    Web,
    Mail,
    Ftp,
    Database,
    Dns,
    Vpn,
    Recidive,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// First matching row wins, so more specific services come first.
const KEYWORDS: &[(Category, &[&str])] = &[
    (Category::Recidive, &["recidive"]),
    (Category::Ssh, &["ssh", "dropbear"]),
    (
        Category::Mail,
        &[
            "postfix", "dovecot", "exim", "sendmail", "courier", "cyrus", "qmail", "sasl", "smtp",
            "imap", "pop3", "sieve", "roundcube", "sogo",
        ],
    ),
    (Category::Ftp, &["ftp"]),
    (
        Category::Database,
        &["mysql", "mariadb", "postgres", "mongo", "redis", "mssql"],
    ),
    (Category::Vpn, &["openvpn", "wireguard", "ipsec", "strongswan", "vpn"]),
    (Category::Dns, &["named", "bind9", "dns", "unbound"]),
    (
        Category::Web,
        &[
            "nginx", "apache", "lighttpd", "http", "php", "wordpress", "drupal", "nextcloud",
            "owncloud", "haproxy", "traefik", "caddy", "botsearch", "badbots", "webmin", "404",
        ],
    ),
];

impl Category {
    /// Base severity for a category.
    pub fn severity(self) -> Severity {
        match self {
            Self::Recidive => Severity::Critical,
            Self::Ssh | Self::Database | Self::Vpn => Severity::High,
            Self::Mail | Self::Web | Self::Ftp => Severity::Medium,
            Self::Dns | Self::Other => Severity::Low,
        }
    }
}

/// Category and severity for a jail, from its name and filter.
pub fn classify(jail: &str, filter: &str) -> (Category, Severity) {
    let haystack = format!("{} {}", jail.to_ascii_lowercase(), filter.to_ascii_lowercase());
    let category = KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| haystack.contains(w)))
        .map(|(c, _)| *c)
        .unwrap_or(Category::Other);

    let mut severity = category.severity();
    // Credential-guessing jails rank one step higher than the service default.
    if severity < Severity::High && (haystack.contains("auth") || haystack.contains("login")) {
        severity = match severity {
            Severity::Low => Severity::Medium,
            _ => Severity::High,
        };
    }
    (category, severity)
}
