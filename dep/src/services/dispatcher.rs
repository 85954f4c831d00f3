//! Queue dispatcher.
//!
//! Polls the status store for QUEUED rows of one level and runs each through
//! the pipeline on its own task. A semaphore bounds the number of runs in
//! flight; queued rows simply wait in the store until a permit frees up.

use futures::FutureExt;
use log::{error, info, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::DispatcherSettings;
use crate::db::{file_md5, RepositoryError, RepositoryResult};
use crate::models::{Instrument, Koaid, NewStatusRecord, Status, StatusField, StatusRecord};
use crate::services::pipeline::{Pipeline, RunOutcome, RunRequest};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("{0} has no file name")]
    NoFileName(PathBuf),
    #[error("Unable to stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of [`Dispatcher::submit_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Queued(i64),
    /// The file was already submitted; `existing` is that row.
    Skipped { existing: i64, reason: String },
}

pub struct Dispatcher {
    pipeline: Pipeline,
    level: u8,
    max_workers: usize,
    poll_interval: Duration,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(pipeline: Pipeline, level: u8, max_workers: usize, poll_interval: Duration) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            pipeline,
            level,
            max_workers,
            poll_interval,
            semaphore: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub fn from_settings(pipeline: Pipeline, level: u8, settings: &DispatcherSettings) -> Self {
        Self::new(
            pipeline,
            level,
            settings.max_workers,
            Duration::from_secs(settings.poll_interval_sec),
        )
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Queue a newly written file unless it is a repeat broadcast.
    ///
    /// A repeat is a file whose latest row is still in flight without a
    /// staged copy, or whose staged copy has the same MD5. Anything else is
    /// copied to the stage area and queued.
    pub async fn submit_file(
        &self,
        instrument: Instrument,
        filepath: &Path,
    ) -> Result<Submission, DispatchError> {
        let repo = self.pipeline.repository().clone();
        let ofname = filepath.to_string_lossy().to_string();
        if let Some(latest) = repo
            .find_latest_by_ofname(instrument.name(), self.level, &ofname)
            .await?
        {
            match latest.stage_file.as_deref() {
                None if latest.status.is_in_flight() => {
                    return Ok(Submission::Skipped {
                        existing: latest.id,
                        reason: format!("{} already {}", ofname, latest.status),
                    });
                }
                Some(stage) => {
                    let same = match (file_md5(Path::new(stage)), file_md5(filepath)) {
                        (Ok(old), Ok(new)) => old == new,
                        _ => false,
                    };
                    if same {
                        return Ok(Submission::Skipped {
                            existing: latest.id,
                            reason: format!("{} has the same md5 as {}", ofname, stage),
                        });
                    }
                }
                None => {}
            }
        }

        let staged = self.stage_copy(instrument, filepath).await?;
        let record = NewStatusRecord::queued(instrument.name(), self.level, ofname.as_str())
            .with_stage_file(staged.to_string_lossy().to_string());
        let id = repo.insert_status(record).await?;
        info!("Queued {} as status record {}", ofname, id);
        Ok(Submission::Queued(id))
    }

    /// Copy a submitted file to `stage/{INSTR}/queue/{uuid}/{name}`.
    async fn stage_copy(
        &self,
        instrument: Instrument,
        filepath: &Path,
    ) -> Result<PathBuf, DispatchError> {
        let name = filepath
            .file_name()
            .ok_or_else(|| DispatchError::NoFileName(filepath.to_path_buf()))?;
        let dir = self
            .pipeline
            .rootdir()
            .join("stage")
            .join(instrument.name())
            .join("queue")
            .join(Uuid::new_v4().to_string());
        let staged = dir.join(name);
        let copied = match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => tokio::fs::copy(filepath, &staged).await,
            Err(e) => Err(e),
        };
        copied.map_err(|source| DispatchError::Stage {
            path: staged.clone(),
            source,
        })?;
        Ok(staged)
    }

    /// Claim the oldest QUEUED row and turn it into a run request.
    pub async fn claim_next(&self) -> RepositoryResult<Option<RunRequest>> {
        let repo = self.pipeline.repository().clone();
        loop {
            let Some(record) = repo.next_queued(self.level).await? else {
                return Ok(None);
            };
            repo.update_status_field(record.id, StatusField::Status(Status::Processing))
                .await?;
            match request_for(&record) {
                Ok(request) => return Ok(Some(request)),
                Err(code) => {
                    warn!("Status record {} cannot be processed: {}", record.id, code);
                    repo.update_status_field(record.id, StatusField::Status(Status::Error))
                        .await?;
                    repo.update_status_field(record.id, StatusField::StatusCode(Some(code)))
                        .await?;
                }
            }
        }
    }

    /// Run every row queued right now and wait for all of them.
    ///
    /// A queue read failure stops further claims, but runs already started
    /// are still awaited before the error is returned.
    pub async fn drain(&self) -> RepositoryResult<Vec<RunOutcome>> {
        let mut workers = JoinSet::new();
        let mut failure = None;
        loop {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };
            let request = match self.claim_next().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    error!("Unable to poll the queue: {}", e);
                    failure = Some(e);
                    break;
                }
            };
            let pipeline = self.pipeline.clone();
            workers.spawn(async move {
                let _permit = permit;
                pipeline.run(request).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Pipeline task failed: {}", e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Poll until `shutdown` completes, then wait for runs in flight.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut workers = JoinSet::new();
        info!(
            "Dispatcher started for lev{} with {} workers",
            self.level, self.max_workers
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let idle = match self.claim_next().await {
                Ok(Some(request)) => {
                    let pipeline = self.pipeline.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        pipeline.run(request).await
                    });
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!("Unable to poll the queue: {}", e);
                    true
                }
            };

            while let Some(Some(joined)) = workers.join_next().now_or_never() {
                log_joined(joined);
            }

            if idle {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!("Dispatcher stopping, waiting for {} runs", workers.len());
        while let Some(joined) = workers.join_next().await {
            log_joined(joined);
        }
    }
}

fn log_joined(joined: Result<RunOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => info!(
            "Status record {:?} finished {}{}",
            outcome.status_id,
            outcome.status,
            outcome
                .status_code
                .as_deref()
                .map(|c| format!(" ({})", c))
                .unwrap_or_default()
        ),
        Err(e) => error!("Pipeline task failed: {}", e),
    }
}

/// Request for a claimed row, or the status code explaining why not.
fn request_for(record: &StatusRecord) -> Result<RunRequest, String> {
    let instrument: Instrument = record
        .instrument
        .parse()
        .map_err(|_| "INVALID_INSTRUMENT".to_string())?;
    let filepath = record
        .stage_file
        .as_deref()
        .or(record.ofname.as_deref())
        .ok_or_else(|| "NO_INPUT_FILE".to_string())?;

    let mut request = RunRequest::new(instrument, record.level, filepath).with_status_id(record.id);
    if record.level > 0 {
        if let Some(koaid) = &record.koaid {
            if let Ok(parsed) = koaid.parse::<Koaid>() {
                request = request.with_utdate(parsed.date());
            }
            request = request.with_koaid(koaid.as_str());
        }
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_request_for_queued_rows() {
        let new = NewStatusRecord::queued("HIRES", 0, "/s/sdata/h0001.fits")
            .with_stage_file("/stage/h0001.fits");
        let record = StatusRecord::from_new(3, new);
        let request = request_for(&record).unwrap();
        assert_eq!(request.status_id, Some(3));
        assert_eq!(request.filepath, Path::new("/stage/h0001.fits"));

        let new = NewStatusRecord::queued("KCWI", 1, "/k1/out").with_koaid("KB.20210304.00001.00");
        let request = request_for(&StatusRecord::from_new(4, new)).unwrap();
        assert_eq!(request.koaid.as_deref(), Some("KB.20210304.00001.00"));
        assert_eq!(request.utdate.map(|d| d.to_string()).as_deref(), Some("2021-03-04"));

        let mut record = StatusRecord::from_new(5, NewStatusRecord::queued("WMKO", 0, "/x"));
        record.creation_time = Utc::now();
        assert_eq!(request_for(&record).unwrap_err(), "INVALID_INSTRUMENT");
    }
}
