//! End-to-end runs of the processing pipeline against the in-memory store.

mod support;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use koa_dep::db::StatusRepository;
use koa_dep::fits::FitsFile;
use koa_dep::models::{Instrument, NewStatusRecord, Status, StatusField};
use koa_dep::services::pipeline::{
    HeaderNormalizer, KeckNormalizer, KeyMap, LogLevel, RunLog, CODE_ERROR,
};
use koa_dep::services::{
    IngestNotifier, IngestRequest, RecordingTransport, RunRequest, StepError, TransferError,
};
use support::{hires_frame, write_fits, Workspace};

const KOAID: &str = "HI.20210304.36000.00";

#[derive(Default)]
struct FakeIngest {
    requests: Mutex<Vec<IngestRequest>>,
    reject: bool,
}

#[async_trait]
impl IngestNotifier for FakeIngest {
    async fn notify(&self, request: &IngestRequest) -> Result<(), TransferError> {
        self.requests.lock().push(request.clone());
        if self.reject {
            Err(TransferError::Rejected("ERROR ingest queue full".to_string()))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_level0_run_writes_products_and_completes() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));

    let outcome = ws
        .pipeline()
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;

    assert_eq!(outcome.status, Status::Complete, "{:?}", outcome.entries);
    assert_eq!(outcome.status_code, None);
    assert_eq!(outcome.koaid.as_deref(), Some(KOAID));
    assert!(outcome.is_complete());

    let lev0 = ws.path().join("HIRES/20210304/lev0");
    for name in [
        format!("{}.fits", KOAID),
        format!("{}.metadata.table", KOAID),
        format!("{}.metadata.md5sum", KOAID),
        format!("{}.md5sum", KOAID),
        format!("{}.xfr.table", KOAID),
        format!("{}.log", KOAID),
    ] {
        assert!(lev0.join(&name).is_file(), "missing {}", name);
    }
    assert!(ws.path().join("HIRES/20210304/README").is_file());

    let archived = FitsFile::open(&lev0.join(format!("{}.fits", KOAID))).unwrap();
    assert_eq!(archived.get_string("KOAID").as_deref(), Some("HI.20210304.36000.00.fits"));
    assert_eq!(archived.get_string("PROGID").as_deref(), Some("C123"));
    assert_eq!(archived.get_string("PROGPI").as_deref(), Some("Smith"));
    assert_eq!(archived.get_string("PROGTL1").as_deref(), Some("Stellar Populations"));
    assert_eq!(archived.get_string("SEMESTER").as_deref(), Some("2021A"));
    assert_eq!(archived.get_string("KOAIMTYP").as_deref(), Some("object"));
    assert_eq!(archived.get_string("OFNAME").as_deref(), Some("hires0001.fits"));
    assert_eq!(archived.get("TELNR").and_then(|v| v.as_i64()), Some(1));

    let table =
        std::fs::read_to_string(lev0.join(format!("{}.metadata.table", KOAID))).unwrap();
    let row = table.lines().nth(4).unwrap();
    assert!(row.contains("Stellar Populations"));
    assert!(row.contains(" 12 "));

    let xfr = std::fs::read_to_string(lev0.join(format!("{}.xfr.table", KOAID))).unwrap();
    assert!(xfr.contains(&format!("lev0/{}.fits", KOAID)));

    let record = ws
        .repo
        .get_status(outcome.status_id.unwrap())
        .await
        .unwrap();
    assert_eq!(record.status, Status::Complete);
    assert_eq!(record.koaid.as_deref(), Some(KOAID));
    assert_eq!(record.semid.as_deref(), Some("2021A_C123"));
    assert_eq!(record.koaimtyp.as_deref(), Some("object"));
    assert!(record.archsize_mb.unwrap() > 0.0);
    assert!(record.process_end_time.is_some());
    assert!(record.utdatetime.is_some());

    let header = ws.repo.get_header("HIRES", KOAID).await.unwrap().unwrap();
    assert!(header.contains("\"PROGPI\":\"Smith\""));
}

#[tokio::test]
async fn test_rerun_without_reprocess_is_duplicate() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let pipeline = ws.pipeline();

    let first = pipeline
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    assert_eq!(first.status, Status::Complete);
    let run_log = ws
        .path()
        .join(format!("HIRES/20210304/lev0/{}.log", KOAID));
    let archived_log = std::fs::read(&run_log).unwrap();

    let second = pipeline
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    assert_eq!(second.status, Status::Complete);
    assert_eq!(second.status_code.as_deref(), Some("DUPLICATE_KOAID"));
    assert_eq!(std::fs::read(&run_log).unwrap(), archived_log);
    assert_eq!(second.halted_at, Some("check_duplicate"));
    assert_ne!(second.status_id, first.status_id);

    let original = ws.repo.get_status(first.status_id.unwrap()).await.unwrap();
    assert_eq!(original.status, Status::Complete);
    assert_eq!(original.status_code, None);
    let repeat = ws.repo.get_status(second.status_id.unwrap()).await.unwrap();
    assert_eq!(repeat.koaid, None);
    assert_eq!(ws.repo.history_count(), 0);
}

#[tokio::test]
async fn test_reprocess_archives_one_history_row() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let pipeline = ws.pipeline();

    let first = pipeline
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    let id = first.status_id.unwrap();

    let again = pipeline
        .run(RunRequest::new(Instrument::Hires, 0, &raw).with_reprocess(true))
        .await;
    assert_eq!(again.status, Status::Complete, "{:?}", again.entries);
    assert_eq!(again.status_code, None);
    assert_eq!(again.status_id, Some(id));

    let history = ws.repo.history_for(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].record.status, Status::Complete);
    assert_eq!(ws.repo.status_count(), 1);
}

#[tokio::test]
async fn test_empty_file_is_invalid_and_quarantined() {
    let ws = Workspace::new();
    std::fs::create_dir_all(ws.sdata()).unwrap();
    let raw = ws.sdata().join("hires0002.fits");
    std::fs::write(&raw, b"").unwrap();

    let outcome = ws
        .pipeline()
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    assert_eq!(outcome.status, Status::Invalid);
    assert_eq!(outcome.status_code.as_deref(), Some("EMPTY_FILE"));
    assert_eq!(outcome.halted_at, Some("load_fits"));
    assert!(ws.path().join("HIRES/invalid/hires0002.fits").is_file());

    let record = ws.repo.get_status(outcome.status_id.unwrap()).await.unwrap();
    assert_eq!(record.status, Status::Invalid);
    assert_eq!(record.status_code.as_deref(), Some("EMPTY_FILE"));
}

#[tokio::test]
async fn test_missing_file_is_error() {
    let ws = Workspace::new();
    let outcome = ws
        .pipeline()
        .run(RunRequest::new(
            Instrument::Hires,
            0,
            ws.sdata().join("nothere.fits"),
        ))
        .await;
    assert_eq!(outcome.status, Status::Error);
    assert_eq!(outcome.status_code.as_deref(), Some("FILE_NOT_FOUND"));
}

#[tokio::test]
async fn test_wrong_instrument_is_invalid() {
    let ws = Workspace::new();
    let mut fits = hires_frame("10:00:00.00");
    fits.set("INSTRUME", "KCWI", "").unwrap();
    let raw = write_fits(&ws.sdata(), "kb0001.fits", &fits);

    let outcome = ws
        .pipeline()
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    assert_eq!(outcome.status, Status::Invalid);
    assert_eq!(outcome.status_code.as_deref(), Some("INSTRUMENT_MISMATCH"));
    assert!(ws.path().join("HIRES/invalid/kb0001.fits").is_file());
}

#[tokio::test]
async fn test_in_flight_row_is_not_taken_over() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let ofname = raw.to_string_lossy().to_string();
    let id = ws
        .repo
        .insert_status(
            NewStatusRecord::queued("HIRES", 0, ofname.as_str()).with_status(Status::Processing),
        )
        .await
        .unwrap();

    let outcome = ws
        .pipeline()
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    assert_eq!(outcome.status, Status::Error);
    assert_eq!(outcome.status_code.as_deref(), Some("ALREADY_PROCESSING"));
    assert_eq!(outcome.status_id, None);
    assert_eq!(
        ws.repo.get_status(id).await.unwrap().status,
        Status::Processing
    );
}

#[tokio::test]
async fn test_queued_row_is_adopted() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let ofname = raw.to_string_lossy().to_string();
    let id = ws
        .repo
        .insert_status(NewStatusRecord::queued("HIRES", 0, ofname.as_str()))
        .await
        .unwrap();

    let outcome = ws
        .pipeline()
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    assert_eq!(outcome.status_id, Some(id));
    assert_eq!(ws.repo.status_count(), 1);
}

#[tokio::test]
async fn test_transfer_and_ingest_notification() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let transport = Arc::new(RecordingTransport::new());
    let ingest = Arc::new(FakeIngest::default());
    let pipeline = ws
        .pipeline()
        .with_transport(transport.clone())
        .with_ingest_notifier(ingest.clone());

    let outcome = pipeline
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    assert_eq!(outcome.status, Status::Complete, "{:?}", outcome.entries);

    assert_eq!(
        transport.transfers(),
        vec![(ws.path().join("HIRES/20210304"), Instrument::Hires)]
    );
    let requests = ingest.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].koaid.as_deref(), Some(KOAID));
    assert_eq!(requests[0].level, 0);
    assert!(!requests[0].reingest);

    let record = ws.repo.get_status(outcome.status_id.unwrap()).await.unwrap();
    assert!(record.xfr_start_time.is_some());
    assert!(record.xfr_end_time.is_some());
    assert!(record.ipac_notify_time.is_some());
    assert!(record.ipac_response_time.is_some());
}

#[tokio::test]
async fn test_rejected_ingest_is_error() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let ingest = Arc::new(FakeIngest {
        reject: true,
        ..Default::default()
    });
    let pipeline = ws
        .pipeline()
        .with_transport(Arc::new(RecordingTransport::new()))
        .with_ingest_notifier(ingest);

    let outcome = pipeline
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;
    assert_eq!(outcome.status, Status::Error);
    assert_eq!(outcome.status_code.as_deref(), Some("INGEST_NOTIFY_ERROR"));
    assert_eq!(outcome.halted_at, Some("notify_ingest"));

    let record = ws.repo.get_status(outcome.status_id.unwrap()).await.unwrap();
    assert!(record.ipac_notify_time.is_some());
    assert!(record.ipac_response_time.is_none());
}

#[tokio::test]
async fn test_level1_collects_products() {
    let ws = Workspace::new();
    let reduced = ws.path().join("reduced");
    std::fs::create_dir_all(&reduced).unwrap();
    std::fs::write(reduced.join("KB.20210304.00001.00_icube.fits"), b"cube").unwrap();
    std::fs::write(reduced.join("KB.20210304.00001.00_icubes.fits"), b"cubes").unwrap();
    std::fs::write(reduced.join("KB.20210304.00002.00_icube.fits"), b"other").unwrap();

    let outcome = ws
        .pipeline()
        .run(
            RunRequest::new(Instrument::Kcwi, 1, &reduced).with_koaid("KB.20210304.00001.00"),
        )
        .await;
    assert_eq!(outcome.status, Status::Complete, "{:?}", outcome.entries);

    let lev1 = ws.path().join("KCWI/20210304/lev1");
    assert!(lev1.join("KB.20210304.00001.00_icube.fits").is_file());
    assert!(lev1.join("KB.20210304.00001.00_icubes.fits").is_file());
    assert!(!lev1.join("KB.20210304.00002.00_icube.fits").exists());
    let md5 = std::fs::read_to_string(lev1.join("KB.20210304.00001.00.md5sum")).unwrap();
    assert_eq!(md5.lines().count(), 2);

    let record = ws.repo.get_status(outcome.status_id.unwrap()).await.unwrap();
    assert_eq!(record.koaid.as_deref(), Some("KB.20210304.00001.00"));
    assert_eq!(record.level, 1);
}

#[tokio::test]
async fn test_level1_without_date_is_error() {
    let ws = Workspace::new();
    let outcome = ws
        .pipeline()
        .run(RunRequest::new(Instrument::Kcwi, 1, ws.path()))
        .await;
    assert_eq!(outcome.status, Status::Error);
    assert_eq!(outcome.status_code.as_deref(), Some("NO_UTDATE"));
    assert!(outcome
        .entries
        .iter()
        .any(|e| e.level == LogLevel::Error && e.code.as_deref() == Some("NO_UTDATE")));
}

/// HIRES rules with one hook replaced by a failure.
struct FailingNormalizer {
    inner: KeckNormalizer,
    panic_on_prefix: bool,
}

impl FailingNormalizer {
    fn new(panic_on_prefix: bool) -> Self {
        Self {
            inner: KeckNormalizer::new(Instrument::Hires),
            panic_on_prefix,
        }
    }
}

impl HeaderNormalizer for FailingNormalizer {
    fn instrument(&self) -> Instrument {
        self.inner.instrument()
    }

    fn keys(&self) -> KeyMap {
        self.inner.keys()
    }

    fn matches_instrument(&self, header: &FitsFile) -> bool {
        self.inner.matches_instrument(header)
    }

    fn prefix(&self, header: &FitsFile) -> Option<String> {
        if self.panic_on_prefix {
            panic!("prefix table out of date");
        }
        self.inner.prefix(header)
    }

    fn koaimtyp(&self, header: &FitsFile) -> Option<String> {
        self.inner.koaimtyp(header)
    }

    fn normalize(&self, _header: &mut FitsFile, _log: &mut RunLog) -> Result<(), StepError> {
        Err(StepError::Code("ELAPTIME table missing".to_string()))
    }
}

#[tokio::test]
async fn test_panicking_critical_step_is_code_error() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));

    let outcome = ws
        .pipeline()
        .with_normalizer(Arc::new(FailingNormalizer::new(true)))
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;

    assert_eq!(outcome.status, Status::Error);
    assert_eq!(outcome.status_code.as_deref(), Some(CODE_ERROR));
    assert_eq!(outcome.halted_at, Some("set_koaid"));
    assert_eq!(outcome.koaid, None);
    assert!(outcome
        .entries
        .iter()
        .any(|e| e.level == LogLevel::Error && e.message.contains("prefix table out of date")));

    let record = ws.repo.get_status(outcome.status_id.unwrap()).await.unwrap();
    assert_eq!(record.status, Status::Error);
    assert_eq!(record.status_code.as_deref(), Some(CODE_ERROR));
    assert!(!ws.path().join("HIRES/20210304/lev0").join(format!("{}.fits", KOAID)).exists());
}

#[tokio::test]
async fn test_code_error_in_optional_step_is_a_warning() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));

    let outcome = ws
        .pipeline()
        .with_normalizer(Arc::new(FailingNormalizer::new(false)))
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;

    assert_eq!(outcome.status, Status::Complete, "{:?}", outcome.entries);
    assert_eq!(outcome.status_code.as_deref(), Some("NORMALIZE_ERROR"));
    assert_eq!(outcome.halted_at, None);
    assert!(!outcome.entries.iter().any(|e| e.level == LogLevel::Error));
}

#[tokio::test]
async fn test_started_transfer_is_not_repeated() {
    let ws = Workspace::new();
    let raw = write_fits(&ws.sdata(), "hires0001.fits", &hires_frame("10:00:00.00"));
    let ofname = raw.to_string_lossy().to_string();
    let id = ws
        .repo
        .insert_status(NewStatusRecord::queued("HIRES", 0, ofname.as_str()))
        .await
        .unwrap();
    assert!(ws.repo.begin_transfer(id, Utc::now()).await.unwrap());
    ws.repo
        .update_status_field(id, StatusField::Status(Status::Queued))
        .await
        .unwrap();
    let started = ws.repo.get_status(id).await.unwrap().xfr_start_time;

    let transport = Arc::new(RecordingTransport::new());
    let outcome = ws
        .pipeline()
        .with_transport(transport.clone())
        .run(RunRequest::new(Instrument::Hires, 0, &raw))
        .await;

    assert_eq!(outcome.status_id, Some(id));
    assert_eq!(outcome.status, Status::Error);
    assert_eq!(outcome.status_code.as_deref(), Some("TRANSFER_GUARD"));
    assert_eq!(outcome.halted_at, Some("transfer"));
    assert!(transport.transfers().is_empty());

    let record = ws.repo.get_status(id).await.unwrap();
    assert_eq!(record.status, Status::Error);
    assert_eq!(record.xfr_start_time, started);
    assert!(record.xfr_end_time.is_none());
}
