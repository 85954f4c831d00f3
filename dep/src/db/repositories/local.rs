//! In-memory status store.
//!
//! Suitable for unit tests and single-host runs. Rows, history snapshots,
//! archived headers and the notification log live behind one
//! `parking_lot::RwLock`, which makes each trait method atomic with respect
//! to the others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::db::repository::{ErrorContext, RepositoryError, RepositoryResult, StatusRepository};
use crate::models::{
    HistoryRecord, NewStatusRecord, Status, StatusField, StatusRecord, StatusSummaryRow,
};

/// In-memory status store.
///
/// # Example
/// ```ignore
/// let repo = LocalRepository::new();
/// let id = repo
///     .insert_status(NewStatusRecord::queued("HIRES", 0, "/s/sdata/h0001.fits"))
///     .await?;
/// assert_eq!(repo.status_count(), 1);
/// ```
#[derive(Clone, Default)]
pub struct LocalRepository {
    data: Arc<RwLock<LocalData>>,
}

struct LocalData {
    // BTreeMap keeps ids in insertion order for the "oldest first" queries.
    rows: BTreeMap<i64, StatusRecord>,
    history: HashMap<i64, Vec<HistoryRecord>>,
    notify_log: Vec<(DateTime<Utc>, String)>,
    headers: HashMap<(String, String), String>,

    next_status_id: i64,
    next_history_id: i64,

    is_healthy: bool,
}

impl Default for LocalData {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            history: HashMap::new(),
            notify_log: Vec::new(),
            headers: HashMap::new(),
            next_status_id: 1,
            next_history_id: 1,
            is_healthy: true,
        }
    }
}

impl LocalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle health for testing connection failures.
    pub fn set_healthy(&self, healthy: bool) {
        self.data.write().is_healthy = healthy;
    }

    pub fn clear(&self) {
        let mut data = self.data.write();
        *data = LocalData {
            is_healthy: data.is_healthy,
            ..Default::default()
        };
    }

    pub fn status_count(&self) -> usize {
        self.data.read().rows.len()
    }

    pub fn history_count(&self) -> usize {
        self.data.read().history.values().map(Vec::len).sum()
    }

    /// Every notification sent, oldest first.
    pub fn notify_log(&self) -> Vec<(DateTime<Utc>, String)> {
        self.data.read().notify_log.clone()
    }

    fn ensure_healthy(&self, operation: &str) -> RepositoryResult<()> {
        if self.data.read().is_healthy {
            Ok(())
        } else {
            Err(RepositoryError::connection_with_context(
                "local repository marked unhealthy",
                ErrorContext::new(operation),
            ))
        }
    }
}

/// Group rows by (instrument, key) and count, ordered by instrument then key.
fn summarize<'a, I>(rows: I) -> Vec<StatusSummaryRow>
where
    I: Iterator<Item = (&'a str, Option<String>)>,
{
    let mut counts: BTreeMap<(String, Option<String>), i64> = BTreeMap::new();
    for (instrument, key) in rows {
        *counts.entry((instrument.to_string(), key)).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|((instrument, status_code), count)| StatusSummaryRow {
            instrument,
            count,
            status_code,
        })
        .collect()
}

#[async_trait]
impl StatusRepository for LocalRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        Ok(self.data.read().is_healthy)
    }

    async fn insert_status(&self, record: NewStatusRecord) -> RepositoryResult<i64> {
        self.ensure_healthy("insert_status")?;
        let mut data = self.data.write();
        let id = data.next_status_id;
        data.next_status_id += 1;
        data.rows.insert(id, StatusRecord::from_new(id, record));
        Ok(id)
    }

    async fn get_status(&self, id: i64) -> RepositoryResult<StatusRecord> {
        self.ensure_healthy("get_status")?;
        self.data
            .read()
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::row_not_found("get_status", id))
    }

    async fn update_status_field(&self, id: i64, field: StatusField) -> RepositoryResult<()> {
        self.ensure_healthy("update_status_field")?;
        let mut data = self.data.write();
        let row = data
            .rows
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::row_not_found("update_status_field", id))?;
        row.apply(field);
        Ok(())
    }

    async fn begin_transfer(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<bool> {
        self.ensure_healthy("begin_transfer")?;
        let mut data = self.data.write();
        let row = data
            .rows
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::row_not_found("begin_transfer", id))?;
        if row.xfr_start_time.is_some() {
            return Ok(false);
        }
        row.xfr_start_time = Some(now);
        row.status = Status::Transferring;
        Ok(true)
    }

    async fn find_by_koaid(
        &self,
        instrument: &str,
        level: u8,
        koaid: &str,
    ) -> RepositoryResult<Option<StatusRecord>> {
        self.ensure_healthy("find_by_koaid")?;
        Ok(self
            .data
            .read()
            .rows
            .values()
            .rev()
            .find(|r| {
                r.instrument == instrument && r.level == level && r.koaid.as_deref() == Some(koaid)
            })
            .cloned())
    }

    async fn find_latest_by_ofname(
        &self,
        instrument: &str,
        level: u8,
        ofname: &str,
    ) -> RepositoryResult<Option<StatusRecord>> {
        self.ensure_healthy("find_latest_by_ofname")?;
        Ok(self
            .data
            .read()
            .rows
            .values()
            .rev()
            .find(|r| {
                r.instrument == instrument
                    && r.level == level
                    && r.ofname.as_deref() == Some(ofname)
            })
            .cloned())
    }

    async fn archive_to_history(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<i64> {
        self.ensure_healthy("archive_to_history")?;
        let mut data = self.data.write();
        let snapshot = data
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::row_not_found("archive_to_history", id))?;

        let history_id = data.next_history_id;
        data.next_history_id += 1;
        data.history.entry(id).or_default().push(HistoryRecord {
            history_id,
            archived_at: now,
            record: snapshot,
        });

        if let Some(row) = data.rows.get_mut(&id) {
            row.reset_for_reprocess(now);
        }
        Ok(history_id)
    }

    async fn history_for(&self, id: i64) -> RepositoryResult<Vec<HistoryRecord>> {
        self.ensure_healthy("history_for")?;
        Ok(self
            .data
            .read()
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn next_queued(&self, level: u8) -> RepositoryResult<Option<StatusRecord>> {
        self.ensure_healthy("next_queued")?;
        Ok(self
            .data
            .read()
            .rows
            .values()
            .filter(|r| r.level == level && r.status == Status::Queued)
            .min_by_key(|r| (r.creation_time, r.id))
            .cloned())
    }

    async fn list_by_status(&self, status: Status) -> RepositoryResult<Vec<StatusRecord>> {
        self.ensure_healthy("list_by_status")?;
        Ok(self
            .data
            .read()
            .rows
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn error_summary(&self) -> RepositoryResult<Vec<StatusSummaryRow>> {
        self.ensure_healthy("error_summary")?;
        let data = self.data.read();
        Ok(summarize(
            data.rows
                .values()
                .filter(|r| r.status == Status::Error)
                .map(|r| (r.instrument.as_str(), r.status_code.clone())),
        ))
    }

    async fn warning_summary(&self) -> RepositoryResult<Vec<StatusSummaryRow>> {
        self.ensure_healthy("warning_summary")?;
        let data = self.data.read();
        Ok(summarize(
            data.rows
                .values()
                .filter(|r| matches!(r.status, Status::Complete | Status::Transferred))
                .filter(|r| r.status_code.as_deref().is_some_and(|c| !c.is_empty()))
                .map(|r| (r.instrument.as_str(), r.status_code.clone())),
        ))
    }

    async fn stuck_records(
        &self,
        older_than: DateTime<Utc>,
    ) -> RepositoryResult<Vec<StatusSummaryRow>> {
        self.ensure_healthy("stuck_records")?;
        let data = self.data.read();
        Ok(summarize(
            data.rows
                .values()
                .filter(|r| r.status.is_in_flight() && r.creation_time < older_than)
                .map(|r| (r.instrument.as_str(), Some(r.status.to_string()))),
        ))
    }

    async fn last_error_notify(&self) -> RepositoryResult<Option<DateTime<Utc>>> {
        self.ensure_healthy("last_error_notify")?;
        Ok(self.data.read().notify_log.iter().map(|(at, _)| *at).max())
    }

    async fn record_error_notify(&self, at: DateTime<Utc>, message: &str) -> RepositoryResult<()> {
        self.ensure_healthy("record_error_notify")?;
        self.data.write().notify_log.push((at, message.to_string()));
        Ok(())
    }

    async fn store_header(
        &self,
        instrument: &str,
        koaid: &str,
        header_json: &str,
        _at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        self.ensure_healthy("store_header")?;
        self.data.write().headers.insert(
            (instrument.to_string(), koaid.to_string()),
            header_json.to_string(),
        );
        Ok(())
    }

    async fn get_header(&self, instrument: &str, koaid: &str) -> RepositoryResult<Option<String>> {
        self.ensure_healthy("get_header")?;
        Ok(self
            .data
            .read()
            .headers
            .get(&(instrument.to_string(), koaid.to_string()))
            .cloned())
    }
}
