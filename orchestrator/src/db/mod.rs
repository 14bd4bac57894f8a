//! Typed accessors over the Postgres pool.
//!
//! Schema DDL and migrations are owned by the deployment; this module only
//! reads and writes the tables it is given. The store is the single writer
//! of `sandboxes.status`.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Persistent sandbox lifecycle state. Transitions are monotonic:
/// `active → destroyed` or `active → expired`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Active,
    Destroyed,
    Expired,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Active => "active",
            SandboxStatus::Destroyed => "destroyed",
            SandboxStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SandboxStatus::Active),
            "destroyed" => Some(SandboxStatus::Destroyed),
            "expired" => Some(SandboxStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Credential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_prefix: String,
    pub key_hash: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SandboxRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub credential_id: Uuid,
    pub status: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl SandboxRow {
    pub fn status(&self) -> Option<SandboxStatus> {
        SandboxStatus::parse(&self.status)
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, name, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Non-revoked, non-expired credentials sharing a key prefix. More than
    /// one row is possible; the caller hash-checks each candidate.
    pub async fn get_credentials_by_prefix(&self, prefix: &str) -> Result<Vec<Credential>> {
        let rows = sqlx::query_as::<_, Credential>(
            "SELECT id, user_id, key_prefix, key_hash, name, created_at,
                    expires_at, revoked_at, last_used_at
             FROM api_keys
             WHERE key_prefix = $1
               AND revoked_at IS NULL
               AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn touch_credential_last_used(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_sandbox(&self, id: Uuid) -> Result<Option<SandboxRow>> {
        let row = sqlx::query_as::<_, SandboxRow>(
            "SELECT id, user_id, credential_id, status, metadata, created_at, destroyed_at
             FROM sandboxes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert_sandbox(
        &self,
        id: Uuid,
        user_id: Uuid,
        credential_id: Uuid,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sandboxes (id, user_id, credential_id, status, metadata, created_at)
             VALUES ($1, $2, $3, 'active', $4, now())",
        )
        .bind(id)
        .bind(user_id)
        .bind(credential_id)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a sandbox out of `active`. Returns false when the row was not
    /// active (already destroyed/expired, or unknown) — transitions are
    /// monotonic so a second destroy is a no-op here.
    pub async fn update_sandbox_status(
        &self,
        id: Uuid,
        status: SandboxStatus,
    ) -> Result<bool> {
        let destroyed_at = match status {
            SandboxStatus::Active => None,
            SandboxStatus::Destroyed | SandboxStatus::Expired => Some(Utc::now()),
        };
        let result = sqlx::query(
            "UPDATE sandboxes SET status = $2, destroyed_at = $3
             WHERE id = $1 AND status = 'active'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(destroyed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_active_by_user(&self, user_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sandboxes WHERE user_id = $1 AND status = 'active'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_active_by_credential(&self, credential_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sandboxes WHERE credential_id = $1 AND status = 'active'",
        )
        .bind(credential_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_active_global(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sandboxes WHERE status = 'active'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Active sandboxes created before `cutoff`. The reaper narrows this
    /// further by each row's tier lifetime.
    pub async fn list_active_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SandboxRow>> {
        let rows = sqlx::query_as::<_, SandboxRow>(
            "SELECT id, user_id, credential_id, status, metadata, created_at, destroyed_at
             FROM sandboxes WHERE status = 'active' AND created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            SandboxStatus::Active,
            SandboxStatus::Destroyed,
            SandboxStatus::Expired,
        ] {
            assert_eq!(SandboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SandboxStatus::parse("paused"), None);
    }
}
