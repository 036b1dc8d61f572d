//! SQLite persistence: the settings record and pump-run history.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::{info, warn};

use hydro_core::SystemSettings;

/// Marks a settings row written by this service.
pub const SETTINGS_MAGIC: i64 = 0xABCD;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct PumpRun {
    pub started_at: i64,
    pub ended_at: i64,
    pub duration_secs: i64,
    pub cause: String,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Store {
    /// db_url examples:
    /// - "sqlite:/home/pi/hydro/hydro.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every in-memory connection is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Settings
    // ----------------------------

    /// Load the settings record.
    ///
    /// A missing row, a wrong magic number, an undecodable body or a record
    /// that fails validation is replaced by `fallback` (or the defaults),
    /// which is written back before returning.
    pub async fn load_settings(&self, fallback: Option<&SystemSettings>) -> Result<SystemSettings> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT magic, body FROM settings WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("load_settings failed")?;

        let rejected = match row {
            None => "no stored settings".to_string(),
            Some((magic, _)) if magic != SETTINGS_MAGIC => {
                format!("magic {magic:#06x} does not match {SETTINGS_MAGIC:#06x}")
            }
            Some((_, body)) => match serde_json::from_str::<SystemSettings>(&body) {
                Ok(settings) => match settings.validate() {
                    Ok(()) => return Ok(settings),
                    Err(e) => format!("stored settings invalid: {e:#}"),
                },
                Err(e) => format!("stored settings undecodable: {e}"),
            },
        };

        let settings = fallback.cloned().unwrap_or_default();
        warn!(reason = %rejected, "using default settings");
        self.save_settings(&settings).await?;
        Ok(settings)
    }

    pub async fn save_settings(&self, settings: &SystemSettings) -> Result<()> {
        let body = serde_json::to_string(settings).context("encode settings")?;
        sqlx::query(
            r#"
            INSERT INTO settings (id, magic, body, updated_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              magic=excluded.magic,
              body=excluded.body,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(SETTINGS_MAGIC)
        .bind(body)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .context("save_settings failed")?;
        info!(name = %settings.system_name, "settings saved");
        Ok(())
    }

    // ----------------------------
    // Pump runs
    // ----------------------------

    pub async fn insert_pump_run(&self, run: &PumpRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pump_runs (started_at, ended_at, duration_secs, cause)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.duration_secs)
        .bind(&run.cause)
        .execute(&self.pool)
        .await
        .context("insert_pump_run failed")?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn recent_pump_runs(&self, limit: i64) -> Result<Vec<PumpRun>> {
        sqlx::query_as(
            r#"
            SELECT started_at, ended_at, duration_secs, cause
            FROM pump_runs
            ORDER BY ended_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_pump_runs failed")
    }

    #[cfg(test)]
    async fn put_raw_settings(&self, magic: i64, body: &str) {
        sqlx::query(
            "INSERT OR REPLACE INTO settings (id, magic, body, updated_at) VALUES (1, ?, ?, 0)",
        )
        .bind(magic)
        .bind(body)
        .execute(&self.pool)
        .await
        .unwrap();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
