//! Status store trait.
//!
//! The store is the single source of truth shared by every worker. Each
//! mutation touches one row; there are no multi-row transactions, so a row
//! must only be written by the pipeline run that owns it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::RepositoryResult;
use crate::models::{
    HistoryRecord, NewStatusRecord, Status, StatusField, StatusRecord, StatusSummaryRow,
};

/// Persistent processing status of every submitted file.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` so one store can be shared by all
/// dispatcher workers.
#[async_trait]
pub trait StatusRepository: Send + Sync {
    /// Check that the backend is reachable.
    async fn health_check(&self) -> RepositoryResult<bool>;

    /// Insert a new row and return its generated id.
    async fn insert_status(&self, record: NewStatusRecord) -> RepositoryResult<i64>;

    /// Fetch one row by id.
    ///
    /// # Errors
    /// `RepositoryError::NotFound` when no row has this id.
    async fn get_status(&self, id: i64) -> RepositoryResult<StatusRecord>;

    /// `update dep_status set <col>=<val> where id=<id>`
    async fn update_status_field(&self, id: i64, field: StatusField) -> RepositoryResult<()>;

    /// Claim the transfer for a row.
    ///
    /// Sets `xfr_start_time = now` and `status = TRANSFERRING` only when
    /// `xfr_start_time IS NULL`. Returns `false` when another run already
    /// claimed it.
    async fn begin_transfer(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<bool>;

    /// Latest row carrying `koaid` for (instrument, level).
    async fn find_by_koaid(
        &self,
        instrument: &str,
        level: u8,
        koaid: &str,
    ) -> RepositoryResult<Option<StatusRecord>>;

    /// Latest row submitted for the original file name.
    async fn find_latest_by_ofname(
        &self,
        instrument: &str,
        level: u8,
        ofname: &str,
    ) -> RepositoryResult<Option<StatusRecord>>;

    /// Copy the row to `dep_status_history` and reset its lifecycle fields.
    ///
    /// Returns the id of the history row.
    async fn archive_to_history(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<i64>;

    /// History snapshots of a row, oldest first.
    async fn history_for(&self, id: i64) -> RepositoryResult<Vec<HistoryRecord>>;

    /// Oldest QUEUED row for a level.
    async fn next_queued(&self, level: u8) -> RepositoryResult<Option<StatusRecord>>;

    async fn list_by_status(&self, status: Status) -> RepositoryResult<Vec<StatusRecord>>;

    /// Counts of ERROR rows grouped by (instrument, status_code).
    async fn error_summary(&self) -> RepositoryResult<Vec<StatusSummaryRow>>;

    /// Counts of COMPLETE/TRANSFERRED rows with a non-empty status_code,
    /// grouped by (instrument, status_code).
    async fn warning_summary(&self) -> RepositoryResult<Vec<StatusSummaryRow>>;

    /// In-flight rows created before `older_than`, grouped by (instrument, status).
    async fn stuck_records(
        &self,
        older_than: DateTime<Utc>,
    ) -> RepositoryResult<Vec<StatusSummaryRow>>;

    /// Time of the last error digest sent.
    async fn last_error_notify(&self) -> RepositoryResult<Option<DateTime<Utc>>>;

    async fn record_error_notify(&self, at: DateTime<Utc>, message: &str) -> RepositoryResult<()>;

    /// Store the final header of an archived file as JSON, replacing any
    /// earlier copy for the same (instrument, koaid).
    async fn store_header(
        &self,
        instrument: &str,
        koaid: &str,
        header_json: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    async fn get_header(&self, instrument: &str, koaid: &str) -> RepositoryResult<Option<String>>;
}
