//! Queue submission and the bounded worker pool.

mod support;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use koa_dep::db::{LocalRepository, RepositoryError, RepositoryResult, StatusRepository};
use koa_dep::models::{
    HistoryRecord, Instrument, NewStatusRecord, Status, StatusField, StatusRecord,
    StatusSummaryRow,
};
use koa_dep::services::{
    CachingDirectory, Dispatcher, Pipeline, Submission, TransferError, Transport,
};
use support::{hires_frame, program_directory, write_fits, Workspace};

/// Holds every transfer open for a while and remembers the peak overlap.
#[derive(Default)]
struct SlowTransport {
    active: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn transfer(&self, _output_dir: &Path, _instrument: Instrument) -> Result<(), TransferError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_submit_skips_repeat_broadcasts() {
    let ws = Workspace::new();
    let dispatcher = Dispatcher::new(ws.pipeline(), 0, 2, Duration::from_millis(10));
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));

    let Submission::Queued(id) = dispatcher.submit_file(Instrument::Hires, &raw).await.unwrap()
    else {
        panic!("first submission should be queued");
    };
    let record = ws.repo.get_status(id).await.unwrap();
    assert_eq!(record.status, Status::Queued);
    assert_eq!(record.ofname.as_deref(), raw.to_str());
    let staged = std::path::PathBuf::from(record.stage_file.unwrap());
    assert!(staged.starts_with(ws.path().join("stage/HIRES/queue")));
    assert_eq!(staged.file_name().unwrap(), "hires0001.fits");
    assert!(staged.is_file());

    let repeat = dispatcher.submit_file(Instrument::Hires, &raw).await.unwrap();
    assert!(matches!(repeat, Submission::Skipped { existing, .. } if existing == id));

    write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:01.00"));
    let changed = dispatcher.submit_file(Instrument::Hires, &raw).await.unwrap();
    assert!(matches!(changed, Submission::Queued(new) if new != id));
}

#[tokio::test]
async fn test_submit_skips_file_already_in_flight() {
    let ws = Workspace::new();
    let dispatcher = Dispatcher::new(ws.pipeline(), 0, 2, Duration::from_millis(10));
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let id = ws
        .repo
        .insert_status(
            NewStatusRecord::queued("HIRES", 0, raw.to_string_lossy().to_string())
                .with_status(Status::Processing),
        )
        .await
        .unwrap();

    let result = dispatcher.submit_file(Instrument::Hires, &raw).await.unwrap();
    assert!(matches!(result, Submission::Skipped { existing, .. } if existing == id));
    assert_eq!(ws.repo.status_count(), 1);
}

#[tokio::test]
async fn test_drain_bounds_concurrency() {
    let ws = Workspace::new();
    let transport = Arc::new(SlowTransport::default());
    let pipeline = ws.pipeline().with_transport(transport.clone());
    let dispatcher = Dispatcher::new(pipeline, 0, 2, Duration::from_millis(10));

    for n in 1..=5 {
        let raw = write_fits(
            &ws.sdata(),
            &format!("hires{:04}.fits", n),
            &hires_frame(&format!("10:00:0{}.00", n)),
        );
        dispatcher.submit_file(Instrument::Hires, &raw).await.unwrap();
    }

    let outcomes = dispatcher.drain().await.unwrap();
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|o| o.status == Status::Complete));
    assert_eq!(transport.done.load(Ordering::SeqCst), 5);
    assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    assert!(ws.repo.next_queued(0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_instrument_row_is_failed() {
    let ws = Workspace::new();
    let dispatcher = Dispatcher::new(ws.pipeline(), 0, 1, Duration::from_millis(10));
    let id = ws
        .repo
        .insert_status(NewStatusRecord::queued("WMKO", 0, "/s/x.fits"))
        .await
        .unwrap();

    assert!(dispatcher.claim_next().await.unwrap().is_none());
    let record = ws.repo.get_status(id).await.unwrap();
    assert_eq!(record.status, Status::Error);
    assert_eq!(record.status_code.as_deref(), Some("INVALID_INSTRUMENT"));
}

#[tokio::test]
async fn test_run_until_stops_on_shutdown() {
    let ws = Workspace::new();
    let dispatcher = Dispatcher::new(ws.pipeline(), 0, 2, Duration::from_millis(10));
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let Submission::Queued(id) = dispatcher.submit_file(Instrument::Hires, &raw).await.unwrap()
    else {
        panic!("submission should be queued");
    };

    dispatcher
        .run_until(tokio::time::sleep(Duration::from_millis(300)))
        .await;
    assert_eq!(ws.repo.get_status(id).await.unwrap().status, Status::Complete);
}

/// In-memory store whose queue read fails once `claims` rows were handed out.
struct FailingQueue {
    inner: LocalRepository,
    claims: AtomicUsize,
}

#[async_trait]
impl StatusRepository for FailingQueue {
    async fn health_check(&self) -> RepositoryResult<bool> {
        self.inner.health_check().await
    }

    async fn insert_status(&self, record: NewStatusRecord) -> RepositoryResult<i64> {
        self.inner.insert_status(record).await
    }

    async fn get_status(&self, id: i64) -> RepositoryResult<StatusRecord> {
        self.inner.get_status(id).await
    }

    async fn update_status_field(&self, id: i64, field: StatusField) -> RepositoryResult<()> {
        self.inner.update_status_field(id, field).await
    }

    async fn begin_transfer(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<bool> {
        self.inner.begin_transfer(id, now).await
    }

    async fn find_by_koaid(
        &self,
        instrument: &str,
        level: u8,
        koaid: &str,
    ) -> RepositoryResult<Option<StatusRecord>> {
        self.inner.find_by_koaid(instrument, level, koaid).await
    }

    async fn find_latest_by_ofname(
        &self,
        instrument: &str,
        level: u8,
        ofname: &str,
    ) -> RepositoryResult<Option<StatusRecord>> {
        self.inner.find_latest_by_ofname(instrument, level, ofname).await
    }

    async fn archive_to_history(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<i64> {
        self.inner.archive_to_history(id, now).await
    }

    async fn history_for(&self, id: i64) -> RepositoryResult<Vec<HistoryRecord>> {
        self.inner.history_for(id).await
    }

    async fn next_queued(&self, level: u8) -> RepositoryResult<Option<StatusRecord>> {
        let left = self.claims.load(Ordering::SeqCst);
        if left == 0 {
            return Err(RepositoryError::connection("queue unavailable"));
        }
        self.claims.store(left - 1, Ordering::SeqCst);
        self.inner.next_queued(level).await
    }

    async fn list_by_status(&self, status: Status) -> RepositoryResult<Vec<StatusRecord>> {
        self.inner.list_by_status(status).await
    }

    async fn error_summary(&self) -> RepositoryResult<Vec<StatusSummaryRow>> {
        self.inner.error_summary().await
    }

    async fn warning_summary(&self) -> RepositoryResult<Vec<StatusSummaryRow>> {
        self.inner.warning_summary().await
    }

    async fn stuck_records(
        &self,
        older_than: DateTime<Utc>,
    ) -> RepositoryResult<Vec<StatusSummaryRow>> {
        self.inner.stuck_records(older_than).await
    }

    async fn last_error_notify(&self) -> RepositoryResult<Option<DateTime<Utc>>> {
        self.inner.last_error_notify().await
    }

    async fn record_error_notify(&self, at: DateTime<Utc>, message: &str) -> RepositoryResult<()> {
        self.inner.record_error_notify(at, message).await
    }

    async fn store_header(
        &self,
        instrument: &str,
        koaid: &str,
        header_json: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        self.inner.store_header(instrument, koaid, header_json, at).await
    }

    async fn get_header(&self, instrument: &str, koaid: &str) -> RepositoryResult<Option<String>> {
        self.inner.get_header(instrument, koaid).await
    }
}

#[tokio::test]
async fn test_drain_waits_for_started_runs_when_queue_fails() {
    let ws = Workspace::new();
    let mut ids = Vec::new();
    for n in 1..=3 {
        let raw = write_fits(
            &ws.sdata(),
            &format!("hires{:04}.fits", n),
            &hires_frame(&format!("10:00:0{}.00", n)),
        );
        let id = ws
            .repo
            .insert_status(NewStatusRecord::queued("HIRES", 0, raw.to_string_lossy().to_string()))
            .await
            .unwrap();
        ids.push(id);
    }

    let repo: Arc<dyn StatusRepository> = Arc::new(FailingQueue {
        inner: ws.repo.clone(),
        claims: AtomicUsize::new(2),
    });
    let directory = Arc::new(CachingDirectory::from_directory(program_directory()));
    let pipeline = Pipeline::new(repo, directory, ws.path())
        .with_transport(Arc::new(SlowTransport::default()));
    let dispatcher = Dispatcher::new(pipeline, 0, 3, Duration::from_millis(10));

    let err = dispatcher.drain().await.unwrap_err();
    assert!(err.is_retryable());

    for id in &ids[..2] {
        assert_eq!(ws.repo.get_status(*id).await.unwrap().status, Status::Complete);
    }
    assert_eq!(ws.repo.get_status(ids[2]).await.unwrap().status, Status::Queued);
}
