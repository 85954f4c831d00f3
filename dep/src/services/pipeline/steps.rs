//! Pipeline steps outside the DQA block.

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::metadata::{keyword_table_path, read_keyword_defs, write_metadata};
use super::products::{total_size_mb, write_md5sum_table, write_xfr_table};
use super::{RunContext, StepError, StepResult};
use crate::fits::{FitsError, FitsFile, HeaderValue};
use crate::models::{parse_utc, verify_utc, Koaid, NewStatusRecord, Status, StatusField};
use crate::services::transport::IngestRequest;

static DATE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("date pattern"));
static SLASH_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})/(\d{2})/(\d{2})$").expect("slash date pattern"));

/// Claim or create the status row and mark it PROCESSING.
pub(super) fn acquire_status_record(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let repo = ctx.repo();
        let instr = ctx.request.instrument.name();
        let level = ctx.request.level;
        let ofname = ctx.request.filepath.to_string_lossy().to_string();

        let record = match ctx.request.status_id {
            Some(id) => repo.get_status(id).await?,
            None => {
                let existing = match &ctx.request.koaid {
                    Some(koaid) if level > 0 => repo.find_by_koaid(instr, level, koaid).await?,
                    _ => repo.find_latest_by_ofname(instr, level, &ofname).await?,
                };
                match existing {
                    Some(row) if row.status == Status::Queued => row,
                    Some(row) if row.status.is_in_flight() => {
                        return Err(StepError::error(
                            "ALREADY_PROCESSING",
                            format!("Status record {} is {}", row.id, row.status),
                        ));
                    }
                    Some(row) if ctx.request.reprocess => {
                        let history_id = repo.archive_to_history(row.id, Utc::now()).await?;
                        ctx.log.info(format!(
                            "Reprocessing: status record {} archived as history {}",
                            row.id, history_id
                        ));
                        row
                    }
                    _ => {
                        let mut new = NewStatusRecord::queued(instr, level, ofname.as_str());
                        if let Some(koaid) = ctx.request.koaid.as_deref().filter(|_| level > 0) {
                            new = new.with_koaid(koaid);
                        }
                        let id = repo.insert_status(new).await?;
                        repo.get_status(id).await?
                    }
                }
            }
        };

        ctx.adopt(&record);
        ctx.update(StatusField::Status(Status::Processing)).await?;
        ctx.update(StatusField::ProcessStartTime(Utc::now())).await?;
        ctx.log
            .info(format!("Status record {} is PROCESSING", record.id));
        Ok(())
    })
}

/// Create the processing directory and, when the UT date is already known,
/// the dated output tree.
pub(super) fn init_dirs(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let process = ctx.pipeline.rootdir.join(ctx.request.instrument.name());
        tokio::fs::create_dir_all(&process).await.map_err(|e| {
            StepError::error(
                "INIT_DIRS_ERROR",
                format!("Unable to create {}: {}", process.display(), e),
            )
        })?;
        ctx.update(StatusField::ProcessDir(process.to_string_lossy().to_string()))
            .await?;

        let ymd = ctx
            .request
            .utdate
            .map(|d| d.format("%Y%m%d").to_string())
            .or_else(|| {
                ctx.request
                    .koaid
                    .as_deref()
                    .and_then(|k| k.parse::<Koaid>().ok())
                    .map(|k| k.date_dir())
            });
        match ymd {
            Some(ymd) => ctx.init_dated_dirs(&ymd),
            None if ctx.request.level > 0 => Err(StepError::error(
                "NO_UTDATE",
                "UT date is required for derived products",
            )),
            None => {
                ctx.log
                    .info("UT date not known yet, output directories follow the KOAID");
                Ok(())
            }
        }
    })
}

/// Check for and read the raw file.
pub(super) fn load_fits(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let path = ctx.request.filepath.clone();
        let exists =
            tokio::time::timeout(ctx.pipeline.exists_timeout, tokio::fs::metadata(&path)).await;
        let meta = match exists {
            Err(_) => {
                return Err(StepError::error(
                    "FILE_ACCESS_TIMEOUT",
                    format!(
                        "No answer after {:?} checking {}, mount may be stale",
                        ctx.pipeline.exists_timeout,
                        path.display()
                    ),
                ))
            }
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(StepError::error(
                    "FILE_NOT_FOUND",
                    format!("{} does not exist", path.display()),
                ))
            }
            Ok(Err(e)) => {
                return Err(StepError::error(
                    "FILE_ACCESS_ERROR",
                    format!("{}: {}", path.display(), e),
                ))
            }
            Ok(Ok(meta)) => meta,
        };
        if !meta.is_file() {
            return Err(StepError::invalid(
                "NOT_A_FILE",
                format!("{} is not a regular file", path.display()),
            ));
        }
        if meta.len() == 0 {
            return Err(StepError::invalid(
                "EMPTY_FILE",
                format!("{} is empty", path.display()),
            ));
        }

        let fits = FitsFile::open(&path).map_err(|e| match e {
            FitsError::Io(e) => {
                StepError::error("FILE_READ_ERROR", format!("{}: {}", path.display(), e))
            }
            e => StepError::invalid("FITS_UNREADABLE", format!("{}: {}", path.display(), e)),
        })?;
        ctx.log.info(format!(
            "Loaded {} ({} header cards)",
            path.display(),
            fits.cards().len()
        ));
        ctx.raw_size = meta.len();
        ctx.fits = Some(fits);
        Ok(())
    })
}

/// The header must belong to the instrument being processed, and a file
/// already named by KOAID must agree with its KOAID card.
pub(super) fn validate_fits(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let fits = ctx.fits()?;
        if !ctx.normalizer.matches_instrument(fits) {
            return Err(StepError::invalid(
                "INSTRUMENT_MISMATCH",
                format!(
                    "INSTRUME '{}' does not match {}",
                    fits.get_string("INSTRUME").unwrap_or_default(),
                    ctx.request.instrument
                ),
            ));
        }

        let basename = ctx
            .request
            .filepath
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let (Some(card), Ok(named)) = (fits.get_string("KOAID"), basename.parse::<Koaid>()) {
            if card.trim_end_matches(".fits") != named.to_string() {
                return Err(StepError::invalid(
                    "FILENAME_MISMATCH",
                    format!("File name {} does not match KOAID {}", basename, card),
                ));
            }
        }
        Ok(())
    })
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// DATE-OBS as `YYYY-MM-DD`, repaired or taken from the file time.
fn fix_dateobs(ctx: &mut RunContext) -> StepResult {
    let raw = ctx.fits()?.get_string("DATE-OBS").unwrap_or_default();
    let fixed = if DATE_PREFIX.is_match(&raw) {
        (raw.len() > 10).then(|| raw[..10].to_string())
    } else if let Some(caps) = SLASH_DATE.captures(&raw) {
        // dd/mm/yy
        Some(format!("20{}-{}-{}", &caps[3], &caps[2], &caps[1]))
    } else {
        let mtime = file_mtime(&ctx.request.filepath)
            .ok_or_else(|| StepError::error("SET_KOAID_ERROR", "No DATE-OBS and no file time"))?;
        ctx.log.warning(format!(
            "DATE-OBS '{}' unusable, using file time",
            raw
        ));
        Some(mtime.format("%Y-%m-%d").to_string())
    };
    if let Some(value) = fixed {
        ctx.fits_mut()?
            .set("DATE-OBS", value, "KOA: Observing date")?;
    }
    Ok(())
}

/// UTC as `hh:mm:ss.ss`, taken from the instrument's UT keyword or the
/// file time.
fn fix_utc(ctx: &mut RunContext) -> StepResult {
    let keys = ctx.normalizer.keys();
    let raw = ctx
        .fits()?
        .get_any(keys.utc)
        .map(|v| v.to_string().trim().to_string())
        .unwrap_or_default();
    if verify_utc(&raw) {
        if !ctx.fits()?.contains("UTC") {
            ctx.fits_mut()?.set("UTC", raw, "KOA: UTC keyword")?;
        }
        return Ok(());
    }
    let mtime = file_mtime(&ctx.request.filepath)
        .ok_or_else(|| StepError::error("SET_KOAID_ERROR", "No UTC and no file time"))?;
    ctx.log
        .warning(format!("UTC '{}' unusable, using file time", raw));
    let utc = format!(
        "{}.{:02}",
        mtime.format("%H:%M:%S"),
        mtime.timestamp_subsec_millis() / 10
    );
    ctx.fits_mut()?
        .set("UTC", utc, "KOA: UTC keyword corrected")?;
    Ok(())
}

/// Build the KOAID, write it into the header and label the run log with it.
pub(super) fn set_koaid(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        fix_dateobs(ctx)?;
        fix_utc(ctx)?;

        let fits = ctx.fits()?;
        let koaid = match fits.get_string("KOAID") {
            Some(existing) => existing.parse::<Koaid>().map_err(|e| {
                StepError::invalid("BAD_KOAID", format!("KOAID card '{}': {}", existing, e))
            })?,
            None => {
                let prefix = ctx.normalizer.prefix(fits).ok_or_else(|| {
                    StepError::error(
                        "SET_KOAID_ERROR",
                        format!("No KOAID prefix for this {} configuration", ctx.request.instrument),
                    )
                })?;
                let dateobs = fits.get_string("DATE-OBS").unwrap_or_default();
                let utc = fits.get_string("UTC").unwrap_or_default();
                Koaid::from_header_values(&prefix, &dateobs, &utc)
                    .map_err(|e| StepError::error("SET_KOAID_ERROR", e))?
            }
        };

        ctx.fits_mut()?
            .set("KOAID", format!("{}.fits", koaid), "KOA: Data file name")?;
        ctx.init_dated_dirs(&koaid.date_dir())?;

        ctx.log.rebind(&koaid.to_string());
        ctx.log.info(format!("KOAID is {}", koaid));
        ctx.koaid = Some(koaid);
        Ok(())
    })
}

/// Refuse a KOAID already held by another row unless reprocessing.
pub(super) fn check_duplicate(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let repo = ctx.repo();
        let koaid = ctx.koaid()?.to_string();
        let id = ctx.status_id()?;
        let existing = repo
            .find_by_koaid(ctx.request.instrument.name(), ctx.request.level, &koaid)
            .await?;

        match existing {
            Some(row) if row.id != id => {
                if !ctx.request.reprocess {
                    return Err(StepError::warn(
                        "DUPLICATE_KOAID",
                        format!(
                            "{} already archived by status record {}, rerun with reprocess",
                            koaid, row.id
                        ),
                    ));
                }
                let history_id = repo.archive_to_history(row.id, Utc::now()).await?;
                ctx.log.info(format!(
                    "Reprocessing {}: status record {} archived as history {}",
                    koaid, row.id, history_id
                ));
                // This row never held the KOAID; the run continues on the old one.
                ctx.update(StatusField::Status(Status::Complete)).await?;
                ctx.update(StatusField::StatusCode(Some("DUPLICATE_KOAID".to_string())))
                    .await?;
                ctx.update(StatusField::ProcessEndTime(Utc::now())).await?;
                ctx.adopt(&row);
                ctx.update(StatusField::Ofname(
                    ctx.request.filepath.to_string_lossy().to_string(),
                ))
                .await?;
            }
            Some(_) => {}
            None => ctx.update(StatusField::Koaid(koaid)).await?,
        }
        attach_run_log(ctx)
    })
}

/// Start writing `{KOAID}.log` in the level directory. Only a run that owns
/// the KOAID may touch that file.
fn attach_run_log(ctx: &mut RunContext) -> StepResult {
    let log_file = ctx
        .dirs()?
        .level_dir(ctx.request.level)
        .join(format!("{}.log", ctx.koaid()?));
    if let Err(e) = ctx.log.attach(log_file.clone()) {
        ctx.log
            .warning(format!("Unable to write {}: {}", log_file.display(), e));
    }
    Ok(())
}

/// Write the archived copy of the raw file.
pub(super) fn write_lev0(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let koaid = ctx.koaid()?.clone();
        let mut dir = ctx.dirs()?.lev0.clone();
        match koaid.prefix() {
            "NC" => dir.push("scam"),
            "NS" => dir.push("spec"),
            _ => {}
        }
        let path = dir.join(format!("{}.fits", koaid));
        let written = match std::fs::create_dir_all(&dir) {
            Ok(()) => ctx.fits()?.write_to(&path).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
            return Err(StepError::error(
                "WRITE_LEV0_ERROR",
                format!("Unable to write {}: {}", path.display(), e),
            ));
        }
        ctx.log.info(format!("Wrote {}", path.display()));
        ctx.products.push(path);
        ctx.product_dir = Some(dir);
        Ok(())
    })
}

pub(super) fn make_preview(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let Some(fits_path) = ctx.products.first().cloned() else {
            return Err(StepError::error("MAKE_JPG_ERROR", "No FITS product to preview"));
        };
        let rendered = ctx
            .pipeline
            .preview
            .render(ctx.fits()?, &fits_path)
            .map_err(|e| StepError::error("MAKE_JPG_ERROR", e))?;
        if let Some(preview) = rendered {
            ctx.log.info(format!("Wrote {}", preview.display()));
            ctx.products.push(preview);
        }
        Ok(())
    })
}

/// `{koaid}.metadata.table` and its md5sum.
pub(super) fn create_metadata(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let koaid = ctx.koaid()?.to_string();
        let dir = product_dir(ctx)?;
        let defs_path = keyword_table_path(&ctx.pipeline.keyword_dir, ctx.request.instrument);
        let defs = read_keyword_defs(&defs_path)
            .map_err(|e| StepError::error("METADATA_ERROR", e.to_string()))?;

        let table = dir.join(format!("{}.metadata.table", koaid));
        let warnings = write_metadata(&table, &defs, ctx.fits()?, &ctx.extra_meta)
            .map_err(|e| StepError::error("METADATA_ERROR", e.to_string()))?;
        if warnings.total() > 0 {
            ctx.log.warning(format!(
                "metadata.table: {} type and {} truncation warnings",
                warnings.type_mismatch, warnings.truncated
            ));
        }

        let md5 = dir.join(format!("{}.metadata.md5sum", koaid));
        write_md5sum_table(std::slice::from_ref(&table), &md5)
            .map_err(|e| StepError::error("METADATA_ERROR", e.to_string()))?;
        ctx.products.push(table);
        ctx.products.push(md5);
        Ok(())
    })
}

/// `{stem}.md5sum` over the products and the `{stem}.xfr.table` manifest.
pub(super) fn create_checksums(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let stem = ctx.product_stem();
        let dir = product_dir(ctx)?;
        let data: Vec<PathBuf> = ctx
            .products
            .iter()
            .filter(|p| !p.to_string_lossy().ends_with(".md5sum"))
            .cloned()
            .collect();
        if data.is_empty() {
            return Err(StepError::error("CHECKSUM_ERROR", "No products to checksum"));
        }

        let md5 = dir.join(format!("{}.md5sum", stem));
        write_md5sum_table(&data, &md5).map_err(|e| {
            StepError::error("CHECKSUM_ERROR", format!("{}: {}", md5.display(), e))
        })?;
        ctx.products.push(md5);

        let xfr = dir.join(format!("{}.xfr.table", stem));
        let output = ctx.dirs()?.output.clone();
        write_xfr_table(&output, &ctx.products, &xfr).map_err(|e| {
            StepError::error("CHECKSUM_ERROR", format!("{}: {}", xfr.display(), e))
        })?;
        Ok(())
    })
}

fn product_dir(ctx: &RunContext) -> Result<PathBuf, StepError> {
    match &ctx.product_dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(ctx.dirs()?.level_dir(ctx.request.level)),
    }
}

/// File sizes, the processing directory and the observation time.
pub(super) fn update_stats(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let archsize = total_size_mb(&ctx.products)
            .map_err(|e| StepError::error("UPDATE_STATS_ERROR", e.to_string()))?;
        let filesize = ctx.raw_size as f64 / 1e6;
        ctx.update(StatusField::FilesizeMb(filesize)).await?;
        ctx.update(StatusField::ArchsizeMb(archsize)).await?;
        let output = ctx.dirs()?.output.to_string_lossy().to_string();
        ctx.update(StatusField::ProcessDir(output)).await?;

        if let Some(fits) = &ctx.fits {
            let dateobs = fits.get_string("DATE-OBS").unwrap_or_default();
            let utc = fits.get_string("UTC").unwrap_or_default();
            let date = chrono::NaiveDate::parse_from_str(&dateobs, "%Y-%m-%d").ok();
            if let (Some(date), Some(time)) = (date, parse_utc(&utc)) {
                ctx.update(StatusField::UtDateTime(NaiveDateTime::new(date, time)))
                    .await?;
            }
        }

        ctx.update(StatusField::ProcessEndTime(Utc::now())).await?;
        ctx.end_time_recorded = true;
        ctx.log.info(format!(
            "filesize {:.3} MB, archsize {:.3} MB",
            filesize, archsize
        ));
        Ok(())
    })
}

/// Copy the output directory once per row.
pub(super) fn transfer(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let Some(transport) = ctx.pipeline.transport.clone() else {
            ctx.log.info("Transfer disabled, skipping");
            return Ok(());
        };
        let id = ctx.status_id()?;
        if !ctx.repo().begin_transfer(id, Utc::now()).await? {
            return Err(StepError::error(
                "TRANSFER_GUARD",
                format!("Transfer of status record {} already started", id),
            ));
        }
        let output = ctx.dirs()?.output.clone();
        ctx.log.info(format!("Transferring {}", output.display()));
        transport
            .transfer(&output, ctx.request.instrument)
            .await
            .map_err(|e| StepError::error("TRANSFER_ERROR", e.to_string()))?;
        ctx.update(StatusField::XfrEndTime(Utc::now())).await?;
        ctx.update(StatusField::Status(Status::Transferred)).await?;
        Ok(())
    })
}

/// Tell the archive to ingest what was transferred.
pub(super) fn notify_ingest(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let Some(notifier) = ctx.pipeline.ingest.clone() else {
            ctx.log.info("Ingest notification disabled, skipping");
            return Ok(());
        };
        let request = IngestRequest {
            instrument: ctx.request.instrument,
            level: ctx.request.level,
            koaid: ctx.koaid_string(),
            utdate: ctx.request.utdate,
            reingest: ctx.request.reprocess,
        };
        ctx.update(StatusField::IpacNotifyTime(Utc::now())).await?;
        notifier
            .notify(&request)
            .await
            .map_err(|e| StepError::error("INGEST_NOTIFY_ERROR", e.to_string()))?;
        ctx.update(StatusField::IpacResponseTime(Utc::now())).await?;
        ctx.log.info("Ingest notification accepted");
        Ok(())
    })
}

/// Keep the final header in the store.
pub(super) fn archive_header(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let koaid = ctx.koaid()?.to_string();
        let cards: serde_json::Map<String, Value> = ctx
            .fits()?
            .cards()
            .iter()
            .filter_map(|card| Some((card.keyword.clone(), json_value(card.value.as_ref()?))))
            .collect();
        let json = Value::Object(cards).to_string();
        ctx.repo()
            .store_header(ctx.request.instrument.name(), &koaid, &json, Utc::now())
            .await?;
        Ok(())
    })
}

fn json_value(value: &HeaderValue) -> Value {
    match value {
        HeaderValue::Str(s) => Value::String(s.trim_end().to_string()),
        HeaderValue::Bool(b) => Value::Bool(*b),
        HeaderValue::Int(i) => Value::from(*i),
        HeaderValue::Float(f) => Value::from(*f),
    }
}

/// Copy derived products named after the KOAID into the level directory.
pub(super) fn collect_products(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let source = ctx.request.filepath.clone();
        if !source.is_dir() {
            return Err(StepError::error(
                "COLLECT_PRODUCTS_ERROR",
                format!("{} is not a directory", source.display()),
            ));
        }
        let dest = ctx.dirs()?.level_dir(ctx.request.level);
        let prefix = ctx.request.koaid.clone().unwrap_or_default();

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&source)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(prefix.as_str()))
            })
            .collect();
        entries.sort();
        if entries.is_empty() {
            return Err(StepError::error(
                "NO_PRODUCTS",
                format!("No products for '{}' in {}", prefix, source.display()),
            ));
        }

        std::fs::create_dir_all(&dest)?;
        for src in entries {
            let Some(name) = src.file_name() else { continue };
            let target = dest.join(name);
            std::fs::copy(&src, &target).map_err(|e| {
                StepError::error(
                    "COLLECT_PRODUCTS_ERROR",
                    format!("Unable to copy {}: {}", src.display(), e),
                )
            })?;
            ctx.raw_size += std::fs::metadata(&src).map(|m| m.len()).unwrap_or_default();
            ctx.products.push(target);
        }
        ctx.product_dir = Some(dest.clone());

        let stem = ctx.product_stem();
        let log_file = dest.join(format!("{}.log", stem));
        ctx.log.rebind(&stem);
        if let Err(e) = ctx.log.attach(log_file) {
            ctx.log.warning(format!("Unable to open run log: {}", e));
        }
        ctx.log.info(format!(
            "Collected {} products into {}",
            ctx.products.len(),
            dest.display()
        ));
        Ok(())
    })
}
