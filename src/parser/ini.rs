//! Tolerant INI reader for fail2ban-style configuration files.
//!
//! fail2ban configs are read by Python's `configparser`, so the reader
//! accepts what it accepts: `#`/`;` comments, `key = value` or
//! `key: value`, indented continuation lines, and case-insensitive keys.
//! Lines that cannot be understood are recorded as problems instead of
//! failing the whole file.

use super::ParseError;

/// One `[section]` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    /// 1-based line of the header.
    pub line: usize,
    /// Entries in file order; keys are lowercased.
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    /// Look up a key; the last assignment wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// All sections of one file, plus the lines that were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    pub sections: Vec<IniSection>,
    /// `(line number, reason)` for each line that was ignored.
    pub problems: Vec<(usize, String)>,
}

#[cfg(test)]
impl IniDocument {
    fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().rev().find(|s| s.name == name)
    }

    fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with(';')
}

/// Parse INI text into sections. Only fails on input with no content at all.
pub fn parse_sections(raw: &str) -> Result<IniDocument, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut doc = IniDocument::default();
    let mut current: Option<IniSection> = None;
    let mut last_key: Option<usize> = None;

    for (idx, line) in raw.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || is_comment(trimmed) {
            last_key = None;
            continue;
        }

        let indented = line.starts_with([' ', '\t']);
        if indented && let (Some(section), Some(pos)) = (current.as_mut(), last_key) {
            let value = &mut section.entries[pos].1;
            if !value.is_empty() {
                value.push('\n');
            }
            value.push_str(trimmed);
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix('[') {
            match rest.split_once(']') {
                Some((name, _)) if !name.trim().is_empty() => {
                    if let Some(done) = current.take() {
                        doc.sections.push(done);
                    }
                    current = Some(IniSection {
                        name: name.trim().to_string(),
                        line: lineno,
                        entries: Vec::new(),
                    });
                }
                _ => doc.problems.push((lineno, "malformed section header".to_string())),
            }
            last_key = None;
            continue;
        }

        let Some(section) = current.as_mut() else {
            doc.problems.push((lineno, "entry outside any section".to_string()));
            continue;
        };

        let split_at = trimmed.find(['=', ':']);
        match split_at {
            Some(pos) if pos > 0 => {
                let key = trimmed[..pos].trim().to_ascii_lowercase();
                let value = trimmed[pos + 1..].trim().to_string();
                section.entries.push((key, value));
                last_key = Some(section.entries.len() - 1);
            }
            _ => {
                doc.problems.push((lineno, format!("unparseable line: {}", super::excerpt(trimmed, 80))));
                last_key = None;
            }
        }
    }

    if let Some(done) = current.take() {
        doc.sections.push(done);
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JAIL_CONF: &str = r#"
# Default values
[INCLUDES]
before = paths-debian.conf

[DEFAULT]
bantime  = 10m
findtime : 10m
ignoreip = 127.0.0.1/8
           ::1

[sshd]
port    = ssh
logpath = %(sshd_log)s
backend = %(sshd_backend)s

; nginx
[nginx-404]
enabled = true
filter = nginx-404[mode=aggressive]
maxretry = 5
maxretry = 7
"#;

    #[test]
    fn extracts_sections_in_order() {
        let doc = parse_sections(JAIL_CONF).unwrap();
        let names: Vec<_> = doc.section_names().collect();
        assert_eq!(names, vec!["INCLUDES", "DEFAULT", "sshd", "nginx-404"]);
        assert!(doc.problems.is_empty());
    }

    #[test]
    fn keys_are_case_insensitive_and_last_wins() {
        let doc = parse_sections(JAIL_CONF).unwrap();
        let nginx = doc.section("nginx-404").unwrap();
        assert_eq!(nginx.get("MaxRetry"), Some("7"));
        assert_eq!(nginx.get("filter"), Some("nginx-404[mode=aggressive]"));
        assert_eq!(nginx.get("bantime"), None);
    }

    #[test]
    fn handles_colon_separator_and_continuations() {
        let doc = parse_sections(JAIL_CONF).unwrap();
        let defaults = doc.section("DEFAULT").unwrap();
        assert_eq!(defaults.get("findtime"), Some("10m"));
        assert_eq!(defaults.get("ignoreip"), Some("127.0.0.1/8\n::1"));
    }

    #[test]
    fn records_problems_without_failing() {
        let raw = "orphan = 1\n[ok]\nkey = v\nnot a pair\n[broken\n";
        let doc = parse_sections(raw).unwrap();
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.problems.len(), 3);
        assert_eq!(doc.problems[0].0, 1);
        assert_eq!(doc.section("ok").and_then(|s| s.get("key")), Some("v"));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(parse_sections("\n  \n"), Err(ParseError::Empty));
    }
}
