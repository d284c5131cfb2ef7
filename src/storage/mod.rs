//! Storage layer for concluded investigation reports.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::investigation::InvestigationReport;

/// Persistence for investigation reports.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Insert or replace a report, keyed by its id.
    async fn save_report(&self, report: &InvestigationReport) -> StorageResult<()>;

    /// Fetch one report by id.
    async fn get_report(&self, id: &str) -> StorageResult<Option<InvestigationReport>>;

    /// Most recently concluded reports, newest first.
    async fn recent_reports(&self, limit: u32) -> StorageResult<Vec<InvestigationReport>>;
}
