//! Ban history from the tail of the daemon's event log.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::parser::{BanEvent, parse_event_line};

/// The daemon's log file, read from the end.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    tail_bytes: u64,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, tail_bytes: u64) -> Self {
        Self {
            path: path.into(),
            tail_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last `tail_bytes` of the file, starting at a line boundary.
    async fn read_tail(&self) -> std::io::Result<String> {
        let mut file = File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        let start = len.saturating_sub(self.tail_bytes);
        file.seek(SeekFrom::Start(start)).await?;

        let mut buf = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut buf).await?;
        let text = String::from_utf8_lossy(&buf).into_owned();

        if start > 0 {
            // First line is almost certainly cut.
            return Ok(match text.find('\n') {
                Some(i) => text[i + 1..].to_string(),
                None => String::new(),
            });
        }
        Ok(text)
    }

    /// Ban, unban and restore events, newest first.
    pub async fn history(&self, jail: Option<&str>, limit: usize) -> std::io::Result<Vec<BanEvent>> {
        let text = self.read_tail().await?;
        Ok(text
            .lines()
            .rev()
            .filter_map(|line| parse_event_line(line).ok())
            .filter(|event| jail.is_none_or(|j| event.jail == j))
            .take(limit)
            .collect())
    }

    /// The last `lines` raw lines, oldest first.
    pub async fn tail(&self, lines: usize) -> std::io::Result<Vec<String>> {
        let text = self.read_tail().await?;
        let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = all.len().saturating_sub(lines);
        Ok(all[skip..].iter().map(|l| l.to_string()).collect())
    }
}
