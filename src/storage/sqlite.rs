use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::ReportStore;
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::investigation::InvestigationReport;

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed report store
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database and run migrations
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Private in-memory database, for tests
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        // Each connection would get its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ReportStore for SqliteStorage {
    async fn save_report(&self, report: &InvestigationReport) -> StorageResult<()> {
        let body = serde_json::to_string(report)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO investigation_reports
                (id, query, kind, termination, confidence, root_cause,
                 total_iterations, started_at, concluded_at, report)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.id)
        .bind(&report.query)
        .bind(report.kind.as_str())
        .bind(report.termination.as_str())
        .bind(report.assessment.level.as_str())
        .bind(&report.root_cause)
        .bind(report.total_iterations as i64)
        .bind(timestamp(&report.started_at))
        .bind(timestamp(&report.concluded_at))
        .bind(&body)
        .execute(&self.pool)
        .await?;

        debug!(report_id = %report.id, "Report saved");
        Ok(())
    }

    async fn get_report(&self, id: &str) -> StorageResult<Option<InvestigationReport>> {
        let row: Option<ReportRow> =
            sqlx::query_as("SELECT id, report FROM investigation_reports WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => Ok(None),
        }
    }

    async fn recent_reports(&self, limit: u32) -> StorageResult<Vec<InvestigationReport>> {
        let rows: Vec<ReportRow> = sqlx::query_as(
            r#"
            SELECT id, report
            FROM investigation_reports
            ORDER BY concluded_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // A row that no longer deserializes is skipped rather than failing the listing.
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                InvestigationReport::try_from(row)
                    .map_err(|e| warn!(report_id = %id, error = %e, "Skipping unreadable report"))
                    .ok()
            })
            .collect())
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    id: String,
    report: String,
}

impl TryFrom<ReportRow> for InvestigationReport {
    type Error = StorageError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        Ok(serde_json::from_str(&row.report)?)
    }
}
