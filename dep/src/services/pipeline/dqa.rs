//! Data quality assessment: the keywords every archived file carries,
//! followed by the instrument's own fixups.

use chrono::{NaiveDate, NaiveTime, Utc};
use futures::future::BoxFuture;
use log::debug;
use std::fmt::Write as _;

use super::normalizer::KeyMap;
use super::{record_failure, PipelineStep, RunContext, StepError, StepResult};
use crate::fits::FitsFile;
use crate::models::{
    is_progid_valid, parse_utc, semester_for_timestamp, semid, strip_semester, ProgramInfo,
    StatusField, ENG, NONE,
};
use crate::parsing::{read_proginfo, PROGINFO_FILE};
use crate::services::directory::split_title;

pub(super) fn dqa_steps() -> Vec<PipelineStep> {
    vec![
        PipelineStep::critical("set_telnr", set_telnr),
        PipelineStep::critical("set_ut", set_ut),
        PipelineStep::critical("set_koaimtyp", set_koaimtyp),
        PipelineStep::critical("set_semester", set_semester),
        PipelineStep::critical("set_prog_info", set_prog_info),
        PipelineStep::critical("set_propint", set_propint),
        PipelineStep::critical("set_ofname", set_ofname),
        PipelineStep::optional("normalize", normalize),
        PipelineStep::optional("set_dqa_date", set_dqa_date),
        PipelineStep::optional("set_dqa_vers", set_dqa_vers),
        PipelineStep::optional("set_datlevel", set_datlevel),
    ]
}

/// Run the DQA sub-steps in order. A critical sub-step failure fails the
/// whole block; the others only leave a warning.
pub(super) fn run_dqa(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        for step in dqa_steps() {
            debug!("[{}] dqa {}", ctx.log.label(), step.name);
            match (step.run)(ctx).await {
                Ok(()) => {}
                Err(e) if step.critical => return Err(e.within(step.name)),
                Err(e) => record_failure(&mut ctx.log, &step, &e),
            }
        }
        ctx.log.info("DQA complete");
        Ok(())
    })
}

/// DATE-OBS and UTC, already repaired by `set_koaid`.
fn obs_time(fits: &FitsFile) -> Option<(NaiveDate, NaiveTime)> {
    let date = NaiveDate::parse_from_str(&fits.get_string("DATE-OBS")?, "%Y-%m-%d").ok()?;
    let utc = parse_utc(&fits.get_string("UTC")?)?;
    Some((date, utc))
}

/// `2019A` from `2019A_U205`, when the whole id is valid.
fn semester_prefix(progid: &str) -> Option<String> {
    let progid = progid.trim();
    if strip_semester(progid) == progid || !is_progid_valid(progid) {
        return None;
    }
    progid.get(..5).map(str::to_uppercase)
}

/// Non-ASCII characters as XML character references.
fn encode_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let _ = write!(out, "&#{};", c as u32);
        }
    }
    out
}

fn or_none(value: String) -> String {
    if value.trim().is_empty() {
        NONE.to_string()
    } else {
        value
    }
}

fn set_telnr(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let telnr = i64::from(ctx.request.instrument.telescope());
        ctx.fits_mut()?
            .set("TELNR", telnr, "KOA: Telescope number")?;
        Ok(())
    })
}

fn set_ut(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let fits = ctx.fits()?;
        if fits.contains("UT") {
            return Ok(());
        }
        let utc = fits
            .get_string("UTC")
            .ok_or_else(|| StepError::error("SET_UT_ERROR", "No UTC value to copy to UT"))?;
        ctx.fits_mut()?.set("UT", utc, "KOA: UTC value")?;
        Ok(())
    })
}

fn set_koaimtyp(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let koaimtyp = match ctx.normalizer.koaimtyp(ctx.fits()?) {
            Some(koaimtyp) => koaimtyp,
            None => {
                ctx.log
                    .warn_code("KOAIMTYP_UDF", "Could not determine KOAIMTYP");
                "undefined".to_string()
            }
        };
        ctx.fits_mut()?
            .set("KOAIMTYP", koaimtyp.as_str(), "KOA: Image type")?;
        ctx.update(StatusField::KoaImTyp(koaimtyp)).await
    })
}

/// SEMESTER from an explicit `YYYYS_` program prefix, else from the
/// observation time.
fn set_semester(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let (date, utc) = obs_time(ctx.fits()?).ok_or_else(|| {
            StepError::error("SET_SEMESTER_FAIL", "DATE-OBS or UTC is unusable")
        })?;
        let semester = ctx
            .pipeline
            .assign_progname
            .as_ref()
            .and_then(|a| semester_prefix(a.progid_for(utc)))
            .or_else(|| {
                ctx.fits()
                    .ok()?
                    .get_string("PROGNAME")
                    .and_then(|p| semester_prefix(&p))
            })
            .unwrap_or_else(|| semester_for_timestamp(date, utc));
        ctx.fits_mut()?
            .set("SEMESTER", semester.as_str(), "KOA: Calculated semester")?;
        ctx.log.info(format!("SEMESTER is {}", semester));
        ctx.semester = Some(semester);
        Ok(())
    })
}

/// Entry for this file in the night's `newproginfo.txt`, if any.
fn stage_program(ctx: &mut RunContext) -> Option<ProgramInfo> {
    let path = ctx.dirs.as_ref()?.stage.join(PROGINFO_FILE);
    if !path.is_file() {
        return None;
    }
    let entries = match read_proginfo(&path) {
        Ok(entries) => entries,
        Err(e) => {
            ctx.log
                .warning(format!("Unable to read {}: {}", path.display(), e));
            return None;
        }
    };
    let full = ctx.request.filepath.to_string_lossy().to_string();
    if let Some(prog) = entries.get(&full) {
        return Some(prog.clone());
    }
    let name = ctx.request.filepath.file_name()?;
    entries
        .into_iter()
        .find(|(file, _)| std::path::Path::new(file).file_name() == Some(name))
        .map(|(_, prog)| prog)
}

/// PROGID, PROGINST, PROGPI and PROGTL1-3.
///
/// The program id comes from the first of: the `ASSIGN_PROGNAME` override,
/// the program handed in with the request, the nightly assignment file, the
/// PROGNAME card. Values decided by the assignment pass are used as they
/// are; anything else is looked up.
fn set_prog_info(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let semester = ctx
            .semester
            .clone()
            .ok_or_else(|| StepError::Code("SEMESTER not set".to_string()))?;
        let utc = obs_time(ctx.fits()?)
            .map(|(_, utc)| utc)
            .unwrap_or_default();

        let (raw, assigned) = if let Some(assign) = &ctx.pipeline.assign_progname {
            (assign.progid_for(utc).to_string(), None)
        } else if let Some(prog) = ctx.request.program.clone() {
            (prog.progid.clone(), Some(prog))
        } else if let Some(prog) = stage_program(ctx) {
            (prog.progid.clone(), Some(prog))
        } else if let Some(progname) = ctx.fits()?.get_string("PROGNAME") {
            (progname, None)
        } else {
            (NONE.to_string(), None)
        };

        let progid = strip_semester(raw.trim()).to_string();
        let semester = semester_prefix(&raw).unwrap_or(semester);
        let instrument = ctx.request.instrument;

        let info = if progid.eq_ignore_ascii_case(ENG) {
            ProgramInfo::engineering(instrument)
        } else if !is_progid_valid(&progid) {
            ctx.log
                .warning(format!("PROGID '{}' is not valid, using {}", raw, NONE));
            ProgramInfo::none()
        } else if let Some(prog) = assigned.filter(|p| p.has_pi()) {
            ProgramInfo { progid, ..prog }
        } else {
            let key = semid(&semester, &progid);
            let directory = ctx.pipeline.directory.clone();
            ProgramInfo::new(
                progid,
                or_none(directory.institution(&key).await),
                or_none(directory.pi(&key).await),
                directory.title(&key).await,
            )
        };

        let title = encode_title(&info.progtitl);
        let fits = ctx.fits_mut()?;
        fits.set("PROGID", info.progid.as_str(), "KOA: Program ID")?;
        fits.set("PROGINST", info.proginst.as_str(), "KOA: Program institution")?;
        fits.set("PROGPI", info.progpi.as_str(), "KOA: Program principal investigator")?;
        for (idx, part) in split_title(&title).into_iter().enumerate() {
            fits.set(&format!("PROGTL{}", idx + 1), part, "KOA: Program title")?;
        }
        ctx.extra_meta.insert("PROGTITL".to_string(), title);

        let semid = semid(&semester, &info.progid);
        ctx.log.info(format!(
            "PROGID {} PI {} INST {}",
            info.progid, info.progpi, info.proginst
        ));
        ctx.update(StatusField::SemId(semid.clone())).await?;
        ctx.semid = Some(semid);
        Ok(())
    })
}

fn set_propint(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let semid = ctx
            .semid
            .clone()
            .ok_or_else(|| StepError::error("SET_PROPINT_ERROR", "SEMID not set"))?;
        let utdate = ctx.fits()?.get_string("DATE-OBS").unwrap_or_default();
        let months = ctx
            .pipeline
            .directory
            .proprietary_period(&semid, &utdate)
            .await;
        ctx.log.info(format!("PROPINT is {} months", months));
        ctx.extra_meta
            .insert("PROPINT".to_string(), months.to_string());
        Ok(())
    })
}

/// Original file name from the instrument's name keywords.
fn ofname_from_header(fits: &FitsFile, keys: &KeyMap) -> Option<String> {
    keys.ofname.iter().find_map(|key| {
        let value = fits.get_string(key).filter(|v| !v.is_empty())?;
        if *key == "OUTFILE" {
            let frameno = fits.get_any(keys.frameno)?.as_i64()?;
            Some(format!("{}{:04}", value, frameno))
        } else {
            Some(value)
        }
    })
}

fn set_ofname(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let keys = ctx.normalizer.keys();
        let ofname = match ofname_from_header(ctx.fits()?, &keys) {
            Some(ofname) => ofname,
            None => {
                let name = ctx
                    .request
                    .filepath
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| {
                        StepError::error("SET_OFNAME_ERROR", "No file name for OFNAME")
                    })?;
                ctx.log
                    .warning(format!("OFNAME keywords missing, using {}", name));
                name
            }
        };
        let ofname = if ofname.ends_with(".fits") {
            ofname
        } else {
            format!("{}.fits", ofname)
        };
        ctx.fits_mut()?
            .set("OFNAME", ofname.as_str(), "KOA: Original file name")?;
        Ok(())
    })
}

fn normalize(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let normalizer = ctx.normalizer.clone();
        let fits = ctx
            .fits
            .as_mut()
            .ok_or_else(|| StepError::Code("FITS header not loaded".to_string()))?;
        normalizer.normalize(fits, &mut ctx.log)
    })
}

fn set_dqa_date(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        ctx.fits_mut()?
            .set("DQA_DATE", now, "KOA: Data quality assess time")?;
        Ok(())
    })
}

fn set_dqa_vers(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        ctx.fits_mut()?.set(
            "DQA_VERS",
            env!("CARGO_PKG_VERSION"),
            "KOA: Data quality assess code version",
        )?;
        Ok(())
    })
}

fn set_datlevel(ctx: &mut RunContext) -> BoxFuture<'_, StepResult> {
    Box::pin(async move {
        let level = i64::from(ctx.request.level);
        ctx.fits_mut()?
            .set("DATLEVEL", level, "KOA: Data reduction level")?;
        Ok(())
    })
}
