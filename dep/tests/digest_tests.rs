//! Error digest throttling and report layout.

use std::sync::Arc;

use chrono::{Duration, Utc};

use koa_dep::db::{LocalRepository, StatusRepository};
use koa_dep::models::{NewStatusRecord, Status, StatusField};
use koa_dep::services::{CollectingNotifier, DigestOutcome, ErrorDigest};

async fn row(repo: &LocalRepository, instr: &str, status: Status, code: Option<&str>) -> i64 {
    let id = repo
        .insert_status(NewStatusRecord::queued(instr, 0, format!("/s/{}.fits", instr)))
        .await
        .unwrap();
    repo.update_status_field(id, StatusField::Status(status))
        .await
        .unwrap();
    repo.update_status_field(id, StatusField::StatusCode(code.map(str::to_string)))
        .await
        .unwrap();
    id
}

fn digest(repo: &LocalRepository, notifier: &Arc<CollectingNotifier>) -> ErrorDigest {
    ErrorDigest::new(Arc::new(repo.clone()), notifier.clone())
}

#[tokio::test]
async fn test_digest_reports_errors_warnings_and_stuck_rows() {
    let repo = LocalRepository::new();
    row(&repo, "HIRES", Status::Error, Some("FILE_NOT_FOUND")).await;
    row(&repo, "HIRES", Status::Error, Some("FILE_NOT_FOUND")).await;
    row(&repo, "KCWI", Status::Complete, Some("KOAIMTYP_UDF")).await;
    row(&repo, "KCWI", Status::Complete, None).await;
    repo.insert_status(
        NewStatusRecord::queued("NIRC2", 0, "/s/n.fits")
            .with_creation_time(Utc::now() - Duration::hours(1)),
    )
    .await
    .unwrap();

    let notifier = Arc::new(CollectingNotifier::new());
    let now = Utc::now();
    let outcome = digest(&repo, &notifier).run_digest(now).await.unwrap();

    let DigestOutcome::Sent { body } = outcome else {
        panic!("digest should be sent, got {:?}", outcome);
    };
    assert!(body.contains("\n===DEP Error summary:===\nHIRES       2     FILE_NOT_FOUND\n"));
    assert!(body.contains("\n===DEP Warning summary:===\nKCWI        1     KOAIMTYP_UDF\n"));
    assert!(body.contains("\n===DEP Stuck summary:===\nNIRC2       1     QUEUED\n"));
    assert_eq!(notifier.messages().len(), 1);
    assert_eq!(repo.notify_log(), vec![(now, body)]);
}

#[tokio::test]
async fn test_digest_is_throttled() {
    let repo = LocalRepository::new();
    row(&repo, "HIRES", Status::Error, Some("TRANSFER_ERROR")).await;
    let notifier = Arc::new(CollectingNotifier::new());
    let digest = digest(&repo, &notifier);

    let first = Utc::now();
    assert!(matches!(
        digest.run_digest(first).await.unwrap(),
        DigestOutcome::Sent { .. }
    ));
    assert_eq!(
        digest.run_digest(first + Duration::minutes(30)).await.unwrap(),
        DigestOutcome::Throttled { last: first }
    );
    assert!(matches!(
        digest.run_digest(first + Duration::hours(3)).await.unwrap(),
        DigestOutcome::Sent { .. }
    ));
    assert_eq!(notifier.messages().len(), 2);
}

#[tokio::test]
async fn test_warnings_alone_are_not_sent() {
    let repo = LocalRepository::new();
    row(&repo, "KCWI", Status::Complete, Some("KOAIMTYP_UDF")).await;
    let notifier = Arc::new(CollectingNotifier::new());

    assert_eq!(
        digest(&repo, &notifier).run_digest(Utc::now()).await.unwrap(),
        DigestOutcome::NothingToReport
    );
    assert!(notifier.messages().is_empty());
    assert!(repo.notify_log().is_empty());
}
