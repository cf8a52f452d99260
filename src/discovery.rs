//! Jail discovery from static configuration.
//!
//! Configuration, not the running daemon, decides which jails exist. Sources
//! are read in fixed priority order:
//!
//! 1. `jail.conf` (package defaults)
//! 2. `jail.d/*.conf`, then `jail.d/*.local`, each sorted by file name
//! 3. `jail.local`
//!
//! Every non-reserved section header with a valid name is a jail. Later
//! sources refine attributes of jails already seen. If not a single source
//! can be read, the daemon's own jail list is used instead.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::daemon::EnforcementDaemon;
use crate::names::{JailName, is_valid_jail_name};
use crate::parser::{IniSection, parse_sections, safe_parse};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no configuration source readable under {dir} and daemon jail list unavailable: {daemon}")]
    NoSources { dir: String, daemon: String },
}

/// Where the configured set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Config,
    /// Fallback: the daemon's live list (only the running subset).
    Daemon,
}

/// Static attributes of one configured jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailDefinition {
    pub name: JailName,
    /// Filter name with any `[options]` suffix removed.
    pub filter: String,
    /// First file that declared the jail.
    pub source_file: Option<PathBuf>,
    pub enabled: Option<bool>,
    pub max_retry: Option<i64>,
    pub ban_time: Option<i64>,
    pub find_time: Option<i64>,
    pub logpath: Option<String>,
}

impl JailDefinition {
    fn new(name: JailName, source_file: Option<PathBuf>) -> Self {
        Self {
            filter: name.as_str().to_string(),
            name,
            source_file,
            enabled: None,
            max_retry: None,
            ban_time: None,
            find_time: None,
            logpath: None,
        }
    }
}

/// Result of one discovery pass.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub names: BTreeSet<JailName>,
    pub jails: BTreeMap<JailName, JailDefinition>,
    pub warnings: Vec<String>,
    pub source: DiscoverySource,
}

impl Discovery {
    pub fn definition(&self, name: &JailName) -> Option<&JailDefinition> {
        self.jails.get(name)
    }
}

/// Outcome of looking for a filter definition on disk.
#[derive(Debug, Clone)]
pub struct FilterLookup {
    pub filter: String,
    pub found: Option<PathBuf>,
    pub searched: Vec<PathBuf>,
}

/// Settings inherited from `[DEFAULT]` sections.
#[derive(Debug, Default)]
struct Defaults {
    max_retry: Option<i64>,
    ban_time: Option<i64>,
    find_time: Option<i64>,
}

/// Parse a fail2ban time value: plain seconds, or unit-suffixed parts such
/// as `10m` or `1h30m`. Interpolations like `%(bantime)s` yield `None`.
pub fn parse_time_value(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n);
    }
    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut any = false;
    for c in raw.chars().filter(|c| !c.is_whitespace()) {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return None,
        };
        let n: i64 = digits.parse().ok()?;
        total = total.checked_add(n.checked_mul(unit)?)?;
        digits.clear();
        any = true;
    }
    if !digits.is_empty() {
        let n: i64 = digits.parse().ok()?;
        total = total.checked_add(n)?;
        any = true;
    }
    any.then_some(total)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// `nginx-404[mode=aggressive]` -> `nginx-404`.
fn strip_filter_options(raw: &str) -> &str {
    raw.split('[').next().unwrap_or(raw).trim()
}

/// Scans configuration for the authoritative set of configured jails.
pub struct JailDiscovery {
    config_dir: PathBuf,
    reserved: Vec<String>,
    daemon: Arc<dyn EnforcementDaemon>,
}

impl JailDiscovery {
    pub fn new(config: &DiscoveryConfig, daemon: Arc<dyn EnforcementDaemon>) -> Self {
        Self {
            config_dir: config.config_dir.clone(),
            reserved: config
                .reserved_sections
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            daemon,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn is_reserved(&self, section: &str) -> bool {
        let lower = section.to_ascii_lowercase();
        self.reserved.iter().any(|r| *r == lower)
    }

    /// Source files in priority order. Missing directories yield nothing.
    async fn sources(&self) -> Vec<PathBuf> {
        let mut out = vec![self.config_dir.join("jail.conf")];

        let jail_d = self.config_dir.join("jail.d");
        let mut confs = Vec::new();
        let mut locals = Vec::new();
        match tokio::fs::read_dir(&jail_d).await {
            Ok(mut entries) => loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        match path.extension().and_then(|e| e.to_str()) {
                            Some("conf") => confs.push(path),
                            Some("local") => locals.push(path),
                            _ => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(dir = %jail_d.display(), error = %e, "stopped listing override directory");
                        break;
                    }
                }
            },
            Err(e) => debug!(dir = %jail_d.display(), error = %e, "override directory not listed"),
        }
        confs.sort();
        locals.sort();
        out.extend(confs);
        out.extend(locals);

        out.push(self.config_dir.join("jail.local"));
        out
    }

    /// Produce the configured jail set.
    pub async fn discover(&self) -> Result<Discovery, DiscoveryError> {
        let mut jails: BTreeMap<JailName, JailDefinition> = BTreeMap::new();
        let mut defaults = Defaults::default();
        let mut warnings = Vec::new();
        let mut readable = 0usize;

        for path in self.sources().await {
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "configuration source absent");
                    continue;
                }
                Err(e) => {
                    warnings.push(format!("cannot read {}: {e}", path.display()));
                    continue;
                }
            };
            readable += 1;

            let parsed = safe_parse(parse_sections, &text, Default::default());
            if parsed.error.is_some() {
                // Empty file: readable, but nothing to contribute.
                continue;
            }
            let doc = parsed.value;
            for (line, reason) in &doc.problems {
                warnings.push(format!("{}:{line}: {reason}", path.display()));
            }

            for section in &doc.sections {
                if section.name.eq_ignore_ascii_case("DEFAULT") {
                    apply_defaults(&mut defaults, section);
                    continue;
                }
                if self.is_reserved(&section.name) {
                    continue;
                }
                if !is_valid_jail_name(&section.name) {
                    warnings.push(format!(
                        "{}:{}: skipping section with invalid jail name '{}'",
                        path.display(),
                        section.line,
                        crate::parser::excerpt(&section.name, 40)
                    ));
                    continue;
                }
                let Ok(name) = JailName::parse(&section.name) else {
                    continue;
                };
                let def = jails
                    .entry(name.clone())
                    .or_insert_with(|| JailDefinition::new(name, Some(path.clone())));
                apply_section(def, section);
            }
        }

        if readable == 0 {
            return self.discover_from_daemon(warnings).await;
        }

        for def in jails.values_mut() {
            def.max_retry = def.max_retry.or(defaults.max_retry);
            def.ban_time = def.ban_time.or(defaults.ban_time);
            def.find_time = def.find_time.or(defaults.find_time);
        }

        for w in &warnings {
            warn!(warning = %w, "discovery warning");
        }
        debug!(jails = jails.len(), sources = readable, "discovered configured jails");

        Ok(Discovery {
            names: jails.keys().cloned().collect(),
            jails,
            warnings,
            source: DiscoverySource::Config,
        })
    }

    async fn discover_from_daemon(&self, mut warnings: Vec<String>) -> Result<Discovery, DiscoveryError> {
        let status = self.daemon.global_status().await.map_err(|e| DiscoveryError::NoSources {
            dir: self.config_dir.display().to_string(),
            daemon: e.to_string(),
        })?;

        warnings.push(format!(
            "no configuration source readable under {}; using the daemon's jail list (running jails only)",
            self.config_dir.display()
        ));
        info!(dir = %self.config_dir.display(), "falling back to daemon jail list for discovery");

        let mut jails = BTreeMap::new();
        for raw in status.jail_names {
            match JailName::parse(&raw) {
                Ok(name) => {
                    jails.insert(name.clone(), JailDefinition::new(name, None));
                }
                Err(_) => warnings.push(format!("daemon reported invalid jail name '{raw}'")),
            }
        }

        Ok(Discovery {
            names: jails.keys().cloned().collect(),
            jails,
            warnings,
            source: DiscoverySource::Daemon,
        })
    }

    /// Look for `filter.d/<filter>.conf` or `.local`.
    pub async fn find_filter(&self, filter: &str) -> FilterLookup {
        let filter = strip_filter_options(filter).to_string();
        if !is_valid_jail_name(&filter) {
            return FilterLookup {
                filter,
                found: None,
                searched: Vec::new(),
            };
        }
        let dir = self.config_dir.join("filter.d");
        let searched = vec![
            dir.join(format!("{filter}.conf")),
            dir.join(format!("{filter}.local")),
        ];
        let mut found = None;
        for candidate in &searched {
            if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
                found = Some(candidate.clone());
                break;
            }
        }
        FilterLookup {
            filter,
            found,
            searched,
        }
    }
}

fn apply_defaults(defaults: &mut Defaults, section: &IniSection) {
    if let Some(v) = section.get("maxretry").and_then(parse_time_value) {
        defaults.max_retry = Some(v);
    }
    if let Some(v) = section.get("bantime").and_then(parse_time_value) {
        defaults.ban_time = Some(v);
    }
    if let Some(v) = section.get("findtime").and_then(parse_time_value) {
        defaults.find_time = Some(v);
    }
}

fn apply_section(def: &mut JailDefinition, section: &IniSection) {
    if let Some(filter) = section.get("filter") {
        let stripped = strip_filter_options(filter);
        if !stripped.is_empty() && !stripped.contains("%(") {
            def.filter = stripped.to_string();
        }
    }
    if let Some(v) = section.get("enabled").and_then(parse_bool) {
        def.enabled = Some(v);
    }
    if let Some(v) = section.get("maxretry").and_then(parse_time_value) {
        def.max_retry = Some(v);
    }
    if let Some(v) = section.get("bantime").and_then(parse_time_value) {
        def.ban_time = Some(v);
    }
    if let Some(v) = section.get("findtime").and_then(parse_time_value) {
        def.find_time = Some(v);
    }
    if let Some(v) = section.get("logpath") {
        def.logpath = Some(v.to_string());
    }
}
