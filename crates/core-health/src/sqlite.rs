//! SQLite-backed health repository
//!
//! Durable storage using SQLite with WAL mode for concurrency. Optimistic
//! concurrency maps directly onto SQL: the version check rides in the UPDATE
//! predicate, so the compare-and-swap is a single statement.
//!
//! The schema is created with plain DDL at open; there is no migration
//! machinery here.

use crate::repository::HealthRepository;
use crate::{ConnectionStatus, ConsolidatedStatus, HealthStatus, Provider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tether_core_classify::ErrorKind;

/// SQLite-backed [`HealthRepository`]
pub struct SqliteHealthRepository {
    pool: SqlitePool,
}

impl SqliteHealthRepository {
    /// Open or create the database at `path` and ensure the schema exists
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .context("invalid sqlite path")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to sqlite database")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS connection_health (
                 user_id               TEXT    NOT NULL,
                 provider              TEXT    NOT NULL,
                 status                TEXT    NOT NULL,
                 consolidated          TEXT    NOT NULL,
                 consecutive_failures  INTEGER NOT NULL,
                 requires_reconnection INTEGER NOT NULL,
                 last_error_kind       TEXT,
                 last_error_message    TEXT,
                 token_expires_at      TEXT,
                 last_success_at       TEXT,
                 created_at            TEXT    NOT NULL,
                 updated_at            TEXT    NOT NULL,
                 version               INTEGER NOT NULL,
                 PRIMARY KEY (user_id, provider)
             )",
        )
        .execute(&pool)
        .await
        .context("failed to create connection_health table")?;

        Ok(Self { pool })
    }

    /// The underlying pool, for advanced embedding
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn timestamp(value: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("invalid timestamp in column {}", column))
        })
        .transpose()
}

fn row_to_record(row: &SqliteRow) -> Result<HealthStatus> {
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    let consolidated: String = row.try_get("consolidated")?;
    let last_error_kind: Option<String> = row.try_get("last_error_kind")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(HealthStatus {
        user_id: row.try_get("user_id")?,
        provider: Provider::from_str(&provider)?,
        status: ConnectionStatus::from_str(&status)?,
        consolidated: ConsolidatedStatus::from_str(&consolidated)?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        requires_reconnection: row.try_get::<i64, _>("requires_reconnection")? != 0,
        last_error_kind: last_error_kind
            .map(|s| ErrorKind::from_str(&s))
            .transpose()
            .context("invalid stored error kind")?,
        last_error_message: row.try_get("last_error_message")?,
        token_expires_at: timestamp(row.try_get("token_expires_at")?, "token_expires_at")?,
        last_success_at: timestamp(row.try_get("last_success_at")?, "last_success_at")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .context("invalid created_at")?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .context("invalid updated_at")?
            .with_timezone(&Utc),
        version: row.try_get::<i64, _>("version")? as u64,
    })
}

#[async_trait]
impl HealthRepository for SqliteHealthRepository {
    async fn load(&self, user_id: &str, provider: Provider) -> Result<Option<HealthStatus>> {
        let row = sqlx::query(
            "SELECT * FROM connection_health WHERE user_id = ? AND provider = ?",
        )
        .bind(user_id)
        .bind(provider.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn insert_if_absent(&self, record: HealthStatus) -> Result<HealthStatus> {
        sqlx::query(
            "INSERT INTO connection_health (
                 user_id, provider, status, consolidated, consecutive_failures,
                 requires_reconnection, last_error_kind, last_error_message,
                 token_expires_at, last_success_at, created_at, updated_at, version
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, provider) DO NOTHING",
        )
        .bind(&record.user_id)
        .bind(record.provider.to_string())
        .bind(record.status.to_string())
        .bind(record.consolidated.to_string())
        .bind(record.consecutive_failures as i64)
        .bind(record.requires_reconnection as i64)
        .bind(record.last_error_kind.map(|k| k.to_string()))
        .bind(&record.last_error_message)
        .bind(record.token_expires_at.map(|t| t.to_rfc3339()))
        .bind(record.last_success_at.map(|t| t.to_rfc3339()))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.version as i64)
        .execute(&self.pool)
        .await?;

        self.load(&record.user_id, record.provider)
            .await?
            .context("record vanished between insert and load")
    }

    async fn update(&self, record: &HealthStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE connection_health SET
                 status = ?, consolidated = ?, consecutive_failures = ?,
                 requires_reconnection = ?, last_error_kind = ?,
                 last_error_message = ?, token_expires_at = ?,
                 last_success_at = ?, updated_at = ?, version = version + 1
             WHERE user_id = ? AND provider = ? AND version = ?",
        )
        .bind(record.status.to_string())
        .bind(record.consolidated.to_string())
        .bind(record.consecutive_failures as i64)
        .bind(record.requires_reconnection as i64)
        .bind(record.last_error_kind.map(|k| k.to_string()))
        .bind(&record.last_error_message)
        .bind(record.token_expires_at.map(|t| t.to_rfc3339()))
        .bind(record.last_success_at.map(|t| t.to_rfc3339()))
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.user_id)
        .bind(record.provider.to_string())
        .bind(record.version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self) -> Result<Vec<HealthStatus>> {
        let rows = sqlx::query("SELECT * FROM connection_health")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn remove(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM connection_health WHERE user_id = ? AND provider = ?",
        )
        .bind(user_id)
        .bind(provider.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
