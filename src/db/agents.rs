//! Agent repository.
//!
//! Raw persistence only. Authentication and the bootstrap-trust policy live
//! in [`crate::agents`].

use super::DbError;
use sqlx::SqlitePool;

/// A stored agent row.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub secret_hash: String,
    pub name: Option<String>,
    pub last_address: Option<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    /// Latest snapshot as JSON.
    pub last_snapshot: Option<String>,
}

type AgentRow = (String, String, Option<String>, Option<String>, i64, i64, Option<String>);

impl From<AgentRow> for AgentRecord {
    fn from(row: AgentRow) -> Self {
        let (id, secret_hash, name, last_address, first_seen_at, last_seen_at, last_snapshot) = row;
        Self {
            id,
            secret_hash,
            name,
            last_address,
            first_seen_at,
            last_seen_at,
            last_snapshot,
        }
    }
}

/// One entry of an agent's snapshot history.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub id: i64,
    pub agent_id: String,
    pub received_at: i64,
    pub digest: String,
    pub payload: String,
}

/// Repository for agent operations.
pub struct AgentRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AgentRepository<'a> {
    /// Create a new agent repository.
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, id: &str) -> Result<Option<AgentRecord>, DbError> {
        let row = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, secret_hash, name, last_address, first_seen_at, last_seen_at, last_snapshot
            FROM agents
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(AgentRecord::from))
    }

    /// Insert a new agent unless the id is already taken.
    ///
    /// Returns `true` if this call created the row. Concurrent first pushes
    /// for the same id race on the primary key; exactly one wins.
    pub async fn insert_new(
        &self,
        id: &str,
        secret_hash: &str,
        name: Option<&str>,
        address: Option<&str>,
        now: i64,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO agents (id, secret_hash, name, last_address, first_seen_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(secret_hash)
        .bind(name)
        .bind(address)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Refresh identity fields and last-seen time. `None` keeps the old value.
    pub async fn touch(
        &self,
        id: &str,
        name: Option<&str>,
        address: Option<&str>,
        now: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE agents
            SET name = COALESCE(?, name),
                last_address = COALESCE(?, last_address),
                last_seen_at = ?
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(address)
        .bind(now)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Create the agent, or replace the secret of an existing one.
    ///
    /// Returns `true` if the row was created.
    pub async fn upsert_secret(
        &self,
        id: &str,
        secret_hash: &str,
        name: Option<&str>,
        now: i64,
    ) -> Result<bool, DbError> {
        if self.insert_new(id, secret_hash, name, None, now).await? {
            return Ok(true);
        }
        sqlx::query(
            r#"
            UPDATE agents
            SET secret_hash = ?,
                name = COALESCE(?, name)
            WHERE id = ?
            "#,
        )
        .bind(secret_hash)
        .bind(name)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(false)
    }

    /// Overwrite the latest snapshot, append it to history, and prune history
    /// to `keep` entries, in one transaction.
    pub async fn store_snapshot(
        &self,
        id: &str,
        payload: &str,
        digest: &str,
        now: i64,
        keep: u32,
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE agents SET last_snapshot = ?, last_seen_at = ? WHERE id = ?
            "#,
        )
        .bind(payload)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::Internal(format!("agent {id} vanished during push")));
        }

        sqlx::query(
            r#"
            INSERT INTO agent_snapshots (agent_id, received_at, digest, payload)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(digest)
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM agent_snapshots
            WHERE agent_id = ?
              AND id NOT IN (
                  SELECT id FROM agent_snapshots
                  WHERE agent_id = ?
                  ORDER BY id DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(i64::from(keep))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// All agents, most recently seen first.
    pub async fn list(&self) -> Result<Vec<AgentRecord>, DbError> {
        let rows = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, secret_hash, name, last_address, first_seen_at, last_seen_at, last_snapshot
            FROM agents
            ORDER BY last_seen_at DESC, id ASC
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(AgentRecord::from).collect())
    }

    /// Snapshot history, newest first.
    pub async fn history(&self, id: &str, limit: u32) -> Result<Vec<SnapshotRecord>, DbError> {
        let rows = sqlx::query_as::<_, (i64, String, i64, String, String)>(
            r#"
            SELECT id, agent_id, received_at, digest, payload
            FROM agent_snapshots
            WHERE agent_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(id)
        .bind(i64::from(limit))
        .fetch_all(self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, agent_id, received_at, digest, payload)| SnapshotRecord {
                id,
                agent_id,
                received_at,
                digest,
                payload,
            })
            .collect())
    }

    /// Remove an agent and its history. Returns `true` if it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
