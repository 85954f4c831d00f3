//! Processing pipeline.
//!
//! One [`Pipeline::run`] drives a single file (level 0) or a directory of
//! derived products (levels 1 and 2) through a fixed list of named steps.
//! Each step is critical or not:
//!
//! ```text
//! step Ok                 -> next step
//! non-critical step Err   -> warning with the step's code, next step
//! critical step Err       -> recorded in its class, run halts
//! ```
//!
//! After the last step (or the halt) the recorded classes decide the final
//! status, in priority order INVALID > ERROR > warning. The most recent code
//! of the winning class becomes `status_code`. A run always ends with one
//! final status write, whatever the steps did, panics included.

mod dqa;
pub mod layout;
pub mod metadata;
pub mod normalizer;
pub mod preview;
pub mod products;
pub mod run_log;
mod steps;

pub use layout::{fallback_invalid_dir, RunDirs};
pub use normalizer::{normalizer_for, HeaderNormalizer, KeckNormalizer, KeyMap};
pub use preview::{NoPreview, PreviewRenderer};
pub use run_log::{LogEntry, LogLevel, RunLog};

use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DepConfig;
use crate::db::{RepositoryError, StatusRepository};
use crate::fits::{FitsError, FitsFile};
use crate::models::{
    Instrument, Koaid, ProgNameAssignment, ProgramInfo, Status, StatusField, StatusRecord,
};
use crate::services::directory::CachingDirectory;
use crate::services::transport::{HttpIngestNotifier, IngestNotifier, RsyncTransport, Transport};

/// Bound on the existence check of the input file.
pub const EXISTS_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a step failed. The variant is the class the failure is recorded in
/// when the step is critical.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The input itself is unusable.
    #[error("{code}: {message}")]
    Invalid { code: String, message: String },

    #[error("{code}: {message}")]
    Error { code: String, message: String },

    /// Halts a critical step without failing the run.
    #[error("{code}: {message}")]
    Warn { code: String, message: String },

    /// Unexpected failure inside a step.
    #[error("{0}")]
    Code(String),
}

impl StepError {
    pub fn invalid(code: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn warn(code: &str, message: impl Into<String>) -> Self {
        Self::Warn {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            StepError::Invalid { code, .. }
            | StepError::Error { code, .. }
            | StepError::Warn { code, .. } => code,
            StepError::Code(_) => CODE_ERROR,
        }
    }

    /// Prefix the message with the sub-step that failed.
    fn within(self, step: &str) -> Self {
        match self {
            StepError::Invalid { code, message } => StepError::Invalid {
                code,
                message: format!("{}: {}", step, message),
            },
            StepError::Error { code, message } => StepError::Error {
                code,
                message: format!("{}: {}", step, message),
            },
            StepError::Warn { code, message } => StepError::Warn {
                code,
                message: format!("{}: {}", step, message),
            },
            StepError::Code(message) => StepError::Code(format!("{}: {}", step, message)),
        }
    }

    fn message(&self) -> &str {
        match self {
            StepError::Invalid { message, .. }
            | StepError::Error { message, .. }
            | StepError::Warn { message, .. }
            | StepError::Code(message) => message,
        }
    }
}

pub const CODE_ERROR: &str = "CODE_ERROR";

impl From<FitsError> for StepError {
    fn from(e: FitsError) -> Self {
        StepError::Code(e.to_string())
    }
}

impl From<std::io::Error> for StepError {
    fn from(e: std::io::Error) -> Self {
        StepError::Code(e.to_string())
    }
}

impl From<RepositoryError> for StepError {
    fn from(e: RepositoryError) -> Self {
        StepError::error("DB_ERROR", e.to_string())
    }
}

pub type StepResult = Result<(), StepError>;

pub type StepFn = for<'a> fn(&'a mut RunContext) -> BoxFuture<'a, StepResult>;

/// One named entry of a step list.
#[derive(Clone, Copy)]
pub struct PipelineStep {
    pub name: &'static str,
    pub critical: bool,
    pub run: StepFn,
}

impl PipelineStep {
    const fn critical(name: &'static str, run: StepFn) -> Self {
        Self {
            name,
            critical: true,
            run,
        }
    }

    const fn optional(name: &'static str, run: StepFn) -> Self {
        Self {
            name,
            critical: false,
            run,
        }
    }
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStep")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .finish()
    }
}

/// Ordered steps for a processing level.
pub fn steps_for_level(level: u8) -> Vec<PipelineStep> {
    match level {
        0 => vec![
            PipelineStep::critical("acquire_status_record", steps::acquire_status_record),
            PipelineStep::critical("init_dirs", steps::init_dirs),
            PipelineStep::critical("load_fits", steps::load_fits),
            PipelineStep::critical("validate_fits", steps::validate_fits),
            PipelineStep::critical("set_koaid", steps::set_koaid),
            PipelineStep::critical("check_duplicate", steps::check_duplicate),
            PipelineStep::critical("run_dqa", dqa::run_dqa),
            PipelineStep::critical("write_lev0", steps::write_lev0),
            PipelineStep::optional("make_preview", steps::make_preview),
            PipelineStep::critical("create_metadata", steps::create_metadata),
            PipelineStep::critical("create_checksums", steps::create_checksums),
            PipelineStep::critical("update_stats", steps::update_stats),
            PipelineStep::critical("transfer", steps::transfer),
            PipelineStep::critical("notify_ingest", steps::notify_ingest),
            PipelineStep::optional("archive_header", steps::archive_header),
        ],
        _ => vec![
            PipelineStep::critical("acquire_status_record", steps::acquire_status_record),
            PipelineStep::critical("init_dirs", steps::init_dirs),
            PipelineStep::critical("collect_products", steps::collect_products),
            PipelineStep::critical("create_checksums", steps::create_checksums),
            PipelineStep::critical("update_stats", steps::update_stats),
            PipelineStep::critical("transfer", steps::transfer),
            PipelineStep::critical("notify_ingest", steps::notify_ingest),
        ],
    }
}

/// What to process.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub instrument: Instrument,
    pub level: u8,
    /// Raw FITS file for level 0, product directory for levels 1 and 2.
    pub filepath: PathBuf,
    pub reprocess: bool,
    /// Status row already claimed by the dispatcher.
    pub status_id: Option<i64>,
    /// UT date of the night, when known up front.
    pub utdate: Option<NaiveDate>,
    /// KOAID of the derived products (levels 1 and 2).
    pub koaid: Option<String>,
    /// Program values decided by the nightly assignment pass.
    pub program: Option<ProgramInfo>,
}

impl RunRequest {
    pub fn new(instrument: Instrument, level: u8, filepath: impl Into<PathBuf>) -> Self {
        Self {
            instrument,
            level,
            filepath: filepath.into(),
            reprocess: false,
            status_id: None,
            utdate: None,
            koaid: None,
            program: None,
        }
    }

    pub fn with_reprocess(mut self, reprocess: bool) -> Self {
        self.reprocess = reprocess;
        self
    }

    pub fn with_status_id(mut self, status_id: i64) -> Self {
        self.status_id = Some(status_id);
        self
    }

    pub fn with_utdate(mut self, utdate: NaiveDate) -> Self {
        self.utdate = Some(utdate);
        self
    }

    pub fn with_koaid(mut self, koaid: impl Into<String>) -> Self {
        self.koaid = Some(koaid.into());
        self
    }

    pub fn with_program(mut self, program: ProgramInfo) -> Self {
        self.program = Some(program);
        self
    }
}

/// Final state of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status_id: Option<i64>,
    pub status: Status,
    pub status_code: Option<String>,
    pub koaid: Option<String>,
    /// Critical step that stopped the run.
    pub halted_at: Option<&'static str>,
    pub entries: Vec<LogEntry>,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == Status::Complete
    }
}

/// Shared collaborators of every run. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    repo: Arc<dyn StatusRepository>,
    directory: Arc<CachingDirectory>,
    rootdir: PathBuf,
    keyword_dir: PathBuf,
    normalizer: Option<Arc<dyn HeaderNormalizer>>,
    preview: Arc<dyn PreviewRenderer>,
    transport: Option<Arc<dyn Transport>>,
    ingest: Option<Arc<dyn IngestNotifier>>,
    assign_progname: Option<ProgNameAssignment>,
    exists_timeout: Duration,
}

impl Pipeline {
    /// A pipeline without transfer or ingest notification.
    pub fn new(
        repo: Arc<dyn StatusRepository>,
        directory: Arc<CachingDirectory>,
        rootdir: impl Into<PathBuf>,
    ) -> Self {
        let rootdir = rootdir.into();
        Self {
            repo,
            directory,
            keyword_dir: rootdir.join("keywords"),
            rootdir,
            normalizer: None,
            preview: Arc::new(NoPreview),
            transport: None,
            ingest: None,
            assign_progname: None,
            exists_timeout: EXISTS_TIMEOUT,
        }
    }

    /// Build from `dep.toml` settings. Transfer and ingest are wired only
    /// when `[transfer] enabled = true`.
    pub fn from_config(
        config: &DepConfig,
        repo: Arc<dyn StatusRepository>,
        directory: Arc<CachingDirectory>,
    ) -> anyhow::Result<Self> {
        let mut pipeline = Self::new(repo, directory, &config.paths.rootdir)
            .with_keyword_dir(&config.paths.keyword_dir);
        if let Some(spec) = config.assign.assign_progname.as_deref() {
            let assignment = ProgNameAssignment::parse(spec).map_err(anyhow::Error::msg)?;
            pipeline = pipeline.with_assign_progname(assignment);
        }
        if config.transfer.enabled {
            pipeline = pipeline
                .with_transport(Arc::new(RsyncTransport::from_settings(&config.transfer)))
                .with_ingest_notifier(Arc::new(HttpIngestNotifier::new(
                    &config.api.ingest_api,
                    config.api.timeout(),
                )?));
        }
        Ok(pipeline)
    }

    pub fn with_keyword_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keyword_dir = dir.into();
        self
    }

    /// Replace the per-instrument default normalizer.
    pub fn with_normalizer(mut self, normalizer: Arc<dyn HeaderNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_preview(mut self, preview: Arc<dyn PreviewRenderer>) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_ingest_notifier(mut self, notifier: Arc<dyn IngestNotifier>) -> Self {
        self.ingest = Some(notifier);
        self
    }

    pub fn with_assign_progname(mut self, assignment: ProgNameAssignment) -> Self {
        self.assign_progname = Some(assignment);
        self
    }

    pub fn with_exists_timeout(mut self, timeout: Duration) -> Self {
        self.exists_timeout = timeout;
        self
    }

    pub fn repository(&self) -> &Arc<dyn StatusRepository> {
        &self.repo
    }

    pub fn rootdir(&self) -> &Path {
        &self.rootdir
    }

    /// Run every step for `request` and write the final status.
    ///
    /// Never fails: step failures and panics are folded into the outcome.
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let normalizer = self
            .normalizer
            .clone()
            .unwrap_or_else(|| normalizer_for(request.instrument));
        let mut ctx = RunContext::new(self.clone(), request, normalizer);
        ctx.log.info(format!(
            "Processing {} lev{} {}{}",
            ctx.request.instrument,
            ctx.request.level,
            ctx.request.filepath.display(),
            if ctx.request.reprocess { " (reprocess)" } else { "" }
        ));

        let mut halted_at = None;
        for step in steps_for_level(ctx.request.level) {
            debug!("[{}] step {}", ctx.log.label(), step.name);
            let result = match AssertUnwindSafe((step.run)(&mut ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(StepError::Code(panic_message(panic))),
            };
            let Err(err) = result else {
                continue;
            };
            record_failure(&mut ctx.log, &step, &err);
            if step.critical {
                halted_at = Some(step.name);
                break;
            }
        }
        self.finish(ctx, halted_at).await
    }

    async fn finish(&self, mut ctx: RunContext, halted_at: Option<&'static str>) -> RunOutcome {
        let (status, status_code) = if let Some(code) = ctx.log.last_code(LogLevel::Invalid) {
            (Status::Invalid, Some(code.to_string()))
        } else if let Some(code) = ctx.log.last_code(LogLevel::Error) {
            (Status::Error, Some(code.to_string()))
        } else {
            (
                Status::Complete,
                ctx.log.last_code(LogLevel::Warning).map(str::to_string),
            )
        };

        if status == Status::Invalid {
            ctx.quarantine();
        }

        match ctx.status_id {
            Some(id) => {
                let mut updates = vec![
                    StatusField::Status(status),
                    StatusField::StatusCode(status_code.clone()),
                ];
                if !ctx.end_time_recorded {
                    updates.push(StatusField::ProcessEndTime(Utc::now()));
                }
                for field in updates {
                    if let Err(e) = self.repo.update_status_field(id, field).await {
                        error!("[{}] Failed to write final status: {}", ctx.log.label(), e);
                    }
                }
            }
            None => warn!(
                "[{}] No status record, final status {} not stored",
                ctx.log.label(),
                status
            ),
        }

        let summary = match &status_code {
            Some(code) => format!("Finished with status {} ({})", status, code),
            None => format!("Finished with status {}", status),
        };
        ctx.log.info(summary);
        info!(
            "[{}] {} lev{} {} -> {}",
            ctx.log.label(),
            ctx.request.instrument,
            ctx.request.level,
            ctx.request.filepath.display(),
            status
        );

        RunOutcome {
            status_id: ctx.status_id,
            status,
            status_code,
            koaid: ctx.koaid_string(),
            halted_at,
            entries: ctx.log.entries().to_vec(),
        }
    }
}

fn record_failure(log: &mut RunLog, step: &PipelineStep, err: &StepError) {
    let message = format!("{}: {}", step.name, err.message());
    if !step.critical {
        let code = match err {
            StepError::Code(_) => format!("{}_ERROR", step.name.to_uppercase()),
            _ => err.code().to_string(),
        };
        log.warn_code(&code, message);
        return;
    }
    match err {
        StepError::Invalid { code, .. } => log.invalid(code, message),
        StepError::Error { code, .. } => log.error(code, message),
        StepError::Warn { code, .. } => log.warn_code(code, message),
        StepError::Code(_) => log.error(CODE_ERROR, format!("{} raised: {}", step.name, err)),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

/// Mutable state of one run, handed to every step.
pub struct RunContext {
    pipeline: Pipeline,
    request: RunRequest,
    normalizer: Arc<dyn HeaderNormalizer>,
    pub log: RunLog,
    status_id: Option<i64>,
    dirs: Option<RunDirs>,
    fits: Option<FitsFile>,
    koaid: Option<Koaid>,
    raw_size: u64,
    semester: Option<String>,
    semid: Option<String>,
    /// Metadata columns that are not header keywords (PROGTITL, PROPINT).
    extra_meta: BTreeMap<String, String>,
    /// Archive products, in the order they were written.
    products: Vec<PathBuf>,
    /// Directory holding this run's products.
    product_dir: Option<PathBuf>,
    end_time_recorded: bool,
}

impl RunContext {
    fn new(pipeline: Pipeline, request: RunRequest, normalizer: Arc<dyn HeaderNormalizer>) -> Self {
        let log = RunLog::new(request.instrument.name());
        Self {
            pipeline,
            request,
            normalizer,
            log,
            status_id: None,
            dirs: None,
            fits: None,
            koaid: None,
            raw_size: 0,
            semester: None,
            semid: None,
            extra_meta: BTreeMap::new(),
            products: Vec::new(),
            product_dir: None,
            end_time_recorded: false,
        }
    }

    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    fn repo(&self) -> Arc<dyn StatusRepository> {
        self.pipeline.repo.clone()
    }

    fn status_id(&self) -> Result<i64, StepError> {
        self.status_id
            .ok_or_else(|| StepError::Code("no status record acquired".to_string()))
    }

    async fn update(&self, field: StatusField) -> StepResult {
        let id = self.status_id()?;
        self.pipeline.repo.update_status_field(id, field).await?;
        Ok(())
    }

    fn fits(&self) -> Result<&FitsFile, StepError> {
        self.fits
            .as_ref()
            .ok_or_else(|| StepError::Code("FITS header not loaded".to_string()))
    }

    fn fits_mut(&mut self) -> Result<&mut FitsFile, StepError> {
        self.fits
            .as_mut()
            .ok_or_else(|| StepError::Code("FITS header not loaded".to_string()))
    }

    fn dirs(&self) -> Result<&RunDirs, StepError> {
        self.dirs
            .as_ref()
            .ok_or_else(|| StepError::Code("output directories not initialized".to_string()))
    }

    fn koaid(&self) -> Result<&Koaid, StepError> {
        self.koaid
            .as_ref()
            .ok_or_else(|| StepError::Code("KOAID not set".to_string()))
    }

    fn koaid_string(&self) -> Option<String> {
        self.koaid
            .as_ref()
            .map(Koaid::to_string)
            .or_else(|| self.request.koaid.clone())
    }

    /// Base name shared by the run's manifests.
    fn product_stem(&self) -> String {
        self.koaid_string().unwrap_or_else(|| {
            let date = self
                .dirs
                .as_ref()
                .and_then(|d| d.output.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            format!("{}.lev{}.{}", self.request.instrument, self.request.level, date)
        })
    }

    /// Create the dated directories for `ymd`, replacing any set made for
    /// another date.
    fn init_dated_dirs(&mut self, ymd: &str) -> StepResult {
        let dirs = RunDirs::new(&self.pipeline.rootdir, self.request.instrument, ymd);
        if self.dirs.as_ref() == Some(&dirs) {
            return Ok(());
        }
        if let Some(old) = &self.dirs {
            self.log.warning(format!(
                "UT date from header differs from request, using {} instead of {}",
                dirs.output.display(),
                old.output.display()
            ));
        }
        dirs.create(self.request.level).map_err(|e| {
            StepError::error(
                "INIT_DIRS_ERROR",
                format!("Unable to create {}: {}", dirs.output.display(), e),
            )
        })?;
        self.log.info(format!("Output directory {}", dirs.output.display()));
        self.dirs = Some(dirs);
        Ok(())
    }

    /// Copy the raw input aside. Only files are quarantined.
    fn quarantine(&mut self) {
        let src = self.request.filepath.clone();
        if !src.is_file() {
            return;
        }
        let dir = match &self.dirs {
            Some(dirs) => dirs.invalid.clone(),
            None => fallback_invalid_dir(&self.pipeline.rootdir, self.request.instrument),
        };
        let Some(name) = src.file_name() else {
            return;
        };
        let dest = dir.join(name);
        let result = std::fs::create_dir_all(&dir).and_then(|_| std::fs::copy(&src, &dest));
        match result {
            Ok(_) => self
                .log
                .info(format!("Copied {} to {}", src.display(), dest.display())),
            Err(e) => self.log.warning(format!(
                "Unable to copy {} to {}: {}",
                src.display(),
                dest.display(),
                e
            )),
        }
    }

    /// Take over an existing row.
    fn adopt(&mut self, record: &StatusRecord) {
        self.status_id = Some(record.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_zero_step_order() {
        let names: Vec<_> = steps_for_level(0).iter().map(|s| s.name).collect();
        assert_eq!(names.first(), Some(&"acquire_status_record"));
        assert_eq!(names.last(), Some(&"archive_header"));
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("set_koaid") < pos("check_duplicate"));
        assert!(pos("check_duplicate") < pos("write_lev0"));
        assert!(pos("transfer") < pos("notify_ingest"));

        let optional: Vec<_> = steps_for_level(0)
            .iter()
            .filter(|s| !s.critical)
            .map(|s| s.name)
            .collect();
        assert_eq!(optional, vec!["make_preview", "archive_header"]);
    }

    #[test]
    fn test_derived_levels_subset() {
        let lev0: Vec<_> = steps_for_level(0).iter().map(|s| s.name).collect();
        for level in [1, 2] {
            let steps = steps_for_level(level);
            assert_eq!(steps[2].name, "collect_products");
            assert!(steps
                .iter()
                .filter(|s| s.name != "collect_products")
                .all(|s| lev0.contains(&s.name)));
        }
    }

    #[test]
    fn test_non_critical_failures_become_warnings() {
        let mut log = RunLog::new("HIRES");
        let step = PipelineStep::optional("make_preview", steps::make_preview);
        record_failure(&mut log, &step, &StepError::Code("boom".into()));
        assert_eq!(log.last_code(LogLevel::Warning), Some("MAKE_PREVIEW_ERROR"));
        assert!(!log.has_code(LogLevel::Error));

        let step = PipelineStep::critical("load_fits", steps::load_fits);
        record_failure(&mut log, &step, &StepError::Code("boom".into()));
        assert_eq!(log.last_code(LogLevel::Error), Some(CODE_ERROR));
    }
}
