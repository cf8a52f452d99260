//! Read-only access to fail2ban's own SQLite ban ledger.
//!
//! fail2ban 0.11+ keeps one row per (ip, jail) in `bips` with the most
//! recent ban; older versions only have the append-only `bans` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::db::DbError;

/// A ban that is still in force.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBan {
    pub jail: String,
    pub address: String,
    pub banned_at: DateTime<Utc>,
    /// Ban duration in seconds; negative means permanent.
    pub ban_time: i64,
    /// `None` for permanent bans.
    pub remaining_secs: Option<i64>,
    #[serde(default)]
    pub ban_count: i64,
}

type LedgerRow = (String, String, i64, i64, i64);

/// Handle on the daemon's ban database. Never written to.
#[derive(Clone)]
pub struct BanLedger {
    pool: SqlitePool,
    path: PathBuf,
}

impl BanLedger {
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

    /// Prepare a read-only pool. Nothing is opened until the first query, so
    /// a missing file shows up as a query error rather than a startup failure.
    pub fn open(path: &Path) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);
        Self {
            pool,
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bans in force at `now` (unix seconds), newest first.
    pub async fn active(&self, jail: Option<&str>, now: i64) -> Result<Vec<ActiveBan>, DbError> {
        let rows = match self.query_bips(jail, now).await {
            Ok(rows) => rows,
            Err(DbError::Sqlx(e)) if e.to_string().contains("no such table") => {
                debug!(path = %self.path.display(), "ledger has no bips table; using bans");
                self.query_bans(jail, now).await?
            }
            Err(e) => return Err(e),
        };

        Ok(rows
            .into_iter()
            .map(|(jail, address, time_of_ban, ban_time, ban_count)| ActiveBan {
                jail,
                address,
                banned_at: DateTime::from_timestamp(time_of_ban, 0).unwrap_or_default(),
                ban_time,
                remaining_secs: (ban_time >= 0).then(|| (time_of_ban + ban_time - now).max(0)),
                ban_count,
            })
            .collect())
    }

    async fn query_bips(&self, jail: Option<&str>, now: i64) -> Result<Vec<LedgerRow>, DbError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT jail, ip, timeofban, bantime, bancount
            FROM bips
            WHERE (bantime < 0 OR timeofban + bantime > ?)
              AND (? IS NULL OR jail = ?)
            ORDER BY timeofban DESC, jail ASC, ip ASC
            "#,
        )
        .bind(now)
        .bind(jail)
        .bind(jail)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn query_bans(&self, jail: Option<&str>, now: i64) -> Result<Vec<LedgerRow>, DbError> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT jail, ip, MAX(timeofban) AS timeofban, bantime, COUNT(*) AS bancount
            FROM bans
            WHERE (? IS NULL OR jail = ?)
            GROUP BY jail, ip
            HAVING bantime < 0 OR MAX(timeofban) + bantime > ?
            ORDER BY timeofban DESC, jail ASC, ip ASC
            "#,
        )
        .bind(jail)
        .bind(jail)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(path: &Path, with_bips: bool) {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
        let table = if with_bips { "bips" } else { "bans" };
        sqlx::query(&format!(
            "CREATE TABLE {table} (jail TEXT, ip TEXT, timeofban INTEGER, bantime INTEGER, bancount INTEGER, data TEXT)"
        ))
        .execute(&pool)
        .await
        .unwrap();
        for (jail, ip, at, dur) in [
            ("sshd", "192.0.2.1", 1_000, 600),
            ("sshd", "192.0.2.2", 100, 600),
            ("recidive", "192.0.2.3", 50, -1),
            ("nginx-404", "198.51.100.4", 900, 3600),
        ] {
            sqlx::query(&format!(
                "INSERT INTO {table} (jail, ip, timeofban, bantime, bancount) VALUES (?, ?, ?, ?, 1)"
            ))
            .bind(jail)
            .bind(ip)
            .bind(at)
            .bind(dur)
            .execute(&pool)
            .await
            .unwrap();
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn lists_only_bans_in_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail2ban.sqlite3");
        seed(&path, true).await;

        let ledger = BanLedger::open(&path);
        let bans = ledger.active(None, 1_200).await.unwrap();
        let addrs: Vec<_> = bans.iter().map(|b| b.address.as_str()).collect();
        assert_eq!(addrs, vec!["192.0.2.1", "198.51.100.4", "192.0.2.3"]);
        assert_eq!(bans[0].remaining_secs, Some(400));
        assert_eq!(bans[2].remaining_secs, None);

        let sshd = ledger.active(Some("sshd"), 1_200).await.unwrap();
        assert_eq!(sshd.len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_legacy_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.sqlite3");
        seed(&path, false).await;
        let bans = BanLedger::open(&path).active(Some("recidive"), 1_200).await.unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].ban_time, -1);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = BanLedger::open(&dir.path().join("absent.sqlite3"));
        assert!(ledger.active(None, 0).await.is_err());
        assert!(!dir.path().join("absent.sqlite3").exists());
    }
}
