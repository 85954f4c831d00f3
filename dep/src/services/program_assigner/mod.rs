//! Nightly program assignment.
//!
//! Given the night's scheduled programs and the per-file catalog, decide the
//! PROGID/PROGINST/PROGPI/PROGTITL of every file. The pass always yields a
//! value for each file; files that cannot be placed get the `NONE` sentinel
//! and an error in the log for manual review.
//!
//! Order of decisions for each file:
//! 1. ToO output directories and engineering indicators
//! 2. a valid PROGID already in the header
//! 3. the only scheduled program, or on split nights the majority program
//!    of the file's output directory, then observer names, then time
//! 4. optionally the legacy header values (`HeaderProgMode`)

mod buckets;
mod header_prog;
mod observers;

pub use buckets::{
    build_buckets, fill_default_windows, is_engineering_observer, is_engineering_outdir,
    majority_program, meets_majority, normalize_outdir, sort_by_start_time, OutdirBucket, Window,
    ENGINEERING_OBSERVERS, ENGINEERING_OUTDIRS,
};
pub use header_prog::{apply_header_prog, header_prog_values, HeaderProgMode};
pub use observers::{match_observer, observer_names};

use chrono::{NaiveDate, NaiveTime};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::fits::FitsFile;
use crate::models::{
    is_progid_valid, semester_for_utdate, semid, strip_semester, Instrument, Observation,
    ProgNameAssignment, Program, ProgramInfo, ENG,
};
use crate::parsing::{
    read_catalog, read_schedule, schedule_file_name, write_proginfo, ParseError, CATALOG_FILE,
    PROGINFO_FILE,
};
use crate::services::directory::CachingDirectory;
use crate::services::pipeline::HeaderNormalizer;

const TOO_MARKER: &str = "_ToO_";

/// Fatal pre-flight conditions; everything else is logged and recovered.
#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("Instrument name not valid: {0}")]
    InvalidInstrument(String),

    #[error("Invalid UT date: {0}")]
    InvalidDate(String),

    #[error("Stage directory doesn't exist: {0}")]
    MissingStageDir(PathBuf),

    #[error(transparent)]
    Input(#[from] ParseError),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of one assignment pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentReport {
    /// Every input observation with its program, in input order.
    pub assignments: Vec<(Observation, ProgramInfo)>,
    /// File count per PROGID, scheduled programs first.
    pub counts: Vec<(String, usize)>,
    /// Files left with the `NONE` sentinel.
    pub unassigned: Vec<String>,
    pub num_programs: usize,
}

impl AssignmentReport {
    pub fn program_for(&self, file: &str) -> Option<&ProgramInfo> {
        self.assignments
            .iter()
            .find(|(obs, _)| obs.file == file)
            .map(|(_, prog)| prog)
    }

    pub fn count_for(&self, progid: &str) -> usize {
        self.counts
            .iter()
            .find(|(id, _)| id == progid)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn is_split_night(&self) -> bool {
        self.num_programs > 1
    }
}

pub struct ProgramAssigner {
    instrument: Instrument,
    utdate: NaiveDate,
    semester: String,
    directory: Arc<CachingDirectory>,
    header_mode: Option<HeaderProgMode>,
    split_time: Option<NaiveTime>,
    normalizer: Option<Arc<dyn HeaderNormalizer>>,
}

impl ProgramAssigner {
    pub fn new(
        instrument: &str,
        utdate: &str,
        directory: Arc<CachingDirectory>,
    ) -> Result<Self, AssignError> {
        let instrument: Instrument = instrument
            .parse()
            .map_err(|_| AssignError::InvalidInstrument(instrument.to_string()))?;
        let utdate = crate::models::parse_utdate(utdate)
            .ok_or_else(|| AssignError::InvalidDate(utdate.to_string()))?;
        Ok(Self {
            instrument,
            utdate,
            semester: semester_for_utdate(utdate),
            directory,
            header_mode: None,
            split_time: None,
            normalizer: None,
        })
    }

    pub fn with_header_mode(mut self, mode: Option<HeaderProgMode>) -> Self {
        self.header_mode = mode;
        self
    }

    /// Replace the sun midpoint when building default split windows.
    pub fn with_split_time(mut self, split_time: Option<NaiveTime>) -> Self {
        self.split_time = split_time;
        self
    }

    /// Read each file's header and let the normalizer flag engineering
    /// calibration frames.
    pub fn with_normalizer(mut self, normalizer: Option<Arc<dyn HeaderNormalizer>>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn instrument(&self) -> Instrument {
        self.instrument
    }

    pub fn semester(&self) -> &str {
        &self.semester
    }

    /// Full nightly pass over a stage directory.
    ///
    /// Reads `createprog.txt` and `dep_obtain{INSTR}.txt`, assigns, writes
    /// `newproginfo.txt` and returns the report.
    pub async fn run(&self, stage_dir: &Path) -> Result<AssignmentReport, AssignError> {
        if !stage_dir.is_dir() {
            return Err(AssignError::MissingStageDir(stage_dir.to_path_buf()));
        }
        let observations = read_catalog(&stage_dir.join(CATALOG_FILE))?;
        let programs =
            read_schedule(&stage_dir.join(schedule_file_name(self.instrument.name())))?;

        let report = self.assign(observations, programs).await;

        let out = stage_dir.join(PROGINFO_FILE);
        write_proginfo(&out, report.assignments.iter().map(|(o, p)| (o, p))).map_err(
            |source| AssignError::Write {
                path: out.clone(),
                source,
            },
        )?;
        info!("getProgInfo finished, {} created", out.display());
        Ok(report)
    }

    /// Assign every observation to a program. Never fails.
    pub async fn assign(
        &self,
        observations: Vec<Observation>,
        programs: Vec<Program>,
    ) -> AssignmentReport {
        let mut pass = Pass {
            assigner: self,
            assigned: observations.iter().map(|o| o.header_prog.clone()).collect(),
            locked: vec![false; observations.len()],
            observations,
            programs,
        };

        pass.classify().await;

        match pass.programs.len() {
            0 => {
                let science = pass.science_count();
                if science > 0 {
                    warn!(
                        "No {} programs scheduled this night but {} science files taken.",
                        self.instrument, science
                    );
                }
            }
            1 => {
                info!(
                    "{} is not a split night, assigning to {} PI ({})",
                    self.utdate, self.instrument, pass.programs[0].proj_code
                );
                for idx in 0..pass.observations.len() {
                    pass.assign_single(idx, 0).await;
                }
            }
            n => {
                info!("{} is a split night with {} programs", self.utdate, n);
                pass.split_multi().await;
            }
        }

        if let Some(mode) = self.header_mode {
            pass.use_header_values(mode);
        }
        pass.finish()
    }

    /// Program values for a single file from an `ASSIGN_PROGNAME` override.
    pub async fn resolve_override(
        &self,
        assignment: &ProgNameAssignment,
        utc: NaiveTime,
    ) -> ProgramInfo {
        let progid = assignment.progid_for(utc).to_string();
        if progid == ENG {
            return ProgramInfo::engineering(self.instrument);
        }
        self.lookup_program(&progid).await
    }

    fn is_engineering_frame(&self, obs: &Observation) -> bool {
        let Some(normalizer) = &self.normalizer else {
            return false;
        };
        match FitsFile::open(Path::new(&obs.file)) {
            Ok(fits) => normalizer.is_engineering(&fits),
            Err(e) => {
                debug!("Skipping engineering check of {}: {}", obs.basename(), e);
                false
            }
        }
    }

    fn semid_for(&self, progid: &str) -> String {
        if strip_semester(progid) != progid {
            progid.to_string()
        } else {
            semid(&self.semester, progid)
        }
    }

    /// Institution, PI and title from the directory.
    async fn lookup_program(&self, progid: &str) -> ProgramInfo {
        let semid = self.semid_for(progid);
        ProgramInfo::new(
            strip_semester(progid),
            self.directory.institution(&semid).await,
            self.directory.pi(&semid).await,
            self.directory.title(&semid).await,
        )
    }
}

/// Working state of one pass.
struct Pass<'a> {
    assigner: &'a ProgramAssigner,
    observations: Vec<Observation>,
    programs: Vec<Program>,
    assigned: Vec<ProgramInfo>,
    /// Files whose header PROGID overrides every heuristic.
    locked: Vec<bool>,
}

impl Pass<'_> {
    /// ToO, engineering and header-override detection.
    async fn classify(&mut self) {
        let instrument = self.assigner.instrument;
        for idx in 0..self.observations.len() {
            let obs = &self.observations[idx];
            let header = &obs.header_prog;

            if let Some(progid) = too_progid(&obs.outdir) {
                let file = obs.basename().to_string();
                let prog = self.assigner.lookup_program(&progid).await;
                info!("{} is a ToO observation for {}", file, prog.progid);
                self.assigned[idx] = prog;
                continue;
            }

            let eng_hit = is_engineering_outdir(&obs.outdir)
                || is_engineering_observer(&obs.observer)
                || header.progid == ENG
                || header.progid.starts_with('E')
                || self.assigner.is_engineering_frame(obs);
            if eng_hit && (!is_progid_valid(&header.progid) || header.progid == ENG) {
                debug!("{} is engineering data", obs.basename());
                self.assigned[idx] = ProgramInfo::engineering(instrument);
                continue;
            }

            if is_progid_valid(&header.progid) && header.progid != ENG {
                self.locked[idx] = true;
                if !header.has_pi() {
                    let progid = header.progid.clone();
                    self.assigned[idx] = self.assigner.lookup_program(&progid).await;
                }
                debug!(
                    "{} keeps header PROGID {}",
                    self.observations[idx].basename(),
                    self.assigned[idx].progid
                );
            }
        }
    }

    /// Object frames outside engineering directories.
    fn science_count(&self) -> usize {
        self.observations
            .iter()
            .filter(|o| o.is_object() && !is_engineering_outdir(&o.outdir))
            .count()
    }

    async fn assign_single(&mut self, file_idx: usize, prog_idx: usize) {
        if self.locked[file_idx] || self.assigned[file_idx].has_pi() {
            return;
        }
        let prog_idx = if self.programs.len() == 1 { 0 } else { prog_idx };
        let prog = self.programs[prog_idx].clone();
        info!(
            "assigning {} to progIndex: {} ({}).",
            self.observations[file_idx].basename(),
            prog_idx,
            prog.proj_code
        );

        let progtitl = if prog.proj_code == ENG {
            self.assigner.instrument.engineering_title()
        } else {
            let semid = self.assigner.semid_for(&prog.proj_code);
            self.assigner.directory.title(&semid).await
        };
        self.assigned[file_idx] =
            ProgramInfo::new(prog.proj_code, prog.institution, prog.principal, progtitl);
    }

    async fn split_multi(&mut self) {
        sort_by_start_time(&mut self.programs);

        if self.programs.iter().any(|p| p.time_window().is_none()) {
            let utdate = self.assigner.utdate.format("%Y-%m-%d").to_string();
            let sun = self.assigner.directory.sun_times(&utdate).await;
            if sun.is_none() {
                error!("Could not get sun times for {}; unscheduled windows left open", utdate);
            }
            fill_default_windows(&mut self.programs, sun, self.assigner.split_time);
            if self.programs.len() > 2 {
                error!(
                    "Three or more split programs but no Start/End time info found! \
                     Program assignment may be incorrect. Check manually."
                );
            }
        }

        let windows: Vec<Option<Window>> = self
            .programs
            .iter()
            .map(|p| p.time_window().map(|(s, e)| Window::new(s, e)))
            .collect();
        let mut buckets = build_buckets(&self.observations, &windows);

        if buckets.len() <= 1 {
            warn!("This is a split night but we do not have multiple outdirs.");
        }
        info!("{} OUTDIRs found", buckets.len());
        for (outdir, bucket) in buckets.iter_mut() {
            info!("outdir sci counts for: {}", outdir);
            for (idx, count) in bucket.counts.iter().enumerate() {
                let perc = if bucket.total > 0 {
                    *count as f64 / bucket.total as f64 * 100.0
                } else {
                    0.0
                };
                info!("--- prog{}: {} ({:.0}%)", idx, count, perc);
            }
            bucket.assign = majority_program(bucket);
            match bucket.assign {
                Some(idx) => info!(
                    "Mapping (by sci) outdir {} to progIndex: {} ({}).",
                    outdir, idx, self.programs[idx].proj_code
                ),
                None => warn!("Could not map outdir by sci counts for: {}", outdir),
            }
        }

        for idx in 0..self.observations.len() {
            let fdir = normalize_outdir(&self.observations[idx].outdir);
            match buckets.get(&fdir).map(|b| b.assign) {
                Some(Some(prog_idx)) => self.assign_single(idx, prog_idx).await,
                Some(None) => {
                    if !self.assign_by_observer(idx).await {
                        self.assign_by_time(idx).await;
                    }
                }
                None if !self.assigned[idx].has_pi() && !self.locked[idx] => {
                    error!("Could not find outdir match for: {}", fdir);
                }
                None => {}
            }

            if !self.locked[idx] && !self.assigned[idx].has_pi() {
                error!(
                    "Could not assign program for file: {}",
                    self.observations[idx].basename()
                );
            }
        }
    }

    async fn assign_by_observer(&mut self, idx: usize) -> bool {
        let Some(prog_idx) = match_observer(&self.observations[idx].observer, &self.programs)
        else {
            return false;
        };
        info!(
            "Assigning {} by observer match.",
            self.observations[idx].basename()
        );
        self.assign_single(idx, prog_idx).await;
        true
    }

    /// First windowed program whose window ends after the file's UTC, else
    /// the last windowed program.
    async fn assign_by_time(&mut self, idx: usize) -> bool {
        let Some(t) = self.observations[idx].utc_time() else {
            return false;
        };
        let windowed: Vec<(usize, Window)> = self
            .programs
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.time_window().map(|(s, e)| (i, Window::new(s, e))))
            .collect();
        let Some(&(last, _)) = windowed.last() else {
            return false;
        };
        let prog_idx = windowed
            .iter()
            .find(|(_, w)| w.ends_after(t))
            .map(|(i, _)| *i)
            .unwrap_or(last);

        warn!(
            "Assigning {} by time {} {} to {}",
            self.observations[idx].basename(),
            self.observations[idx].utdate,
            self.observations[idx].utc,
            self.programs[prog_idx].proj_code
        );
        self.assign_single(idx, prog_idx).await;
        true
    }

    fn use_header_values(&mut self, mode: HeaderProgMode) {
        for (obs, assigned) in self.observations.iter().zip(self.assigned.iter_mut()) {
            let fits = match FitsFile::open(Path::new(&obs.file)) {
                Ok(fits) => fits,
                Err(e) => {
                    error!("Could not read header of {}: {}", obs.basename(), e);
                    continue;
                }
            };
            let header = header_prog_values(&fits);
            apply_header_prog(mode, assigned, &header, obs.basename());
        }
    }

    fn finish(self) -> AssignmentReport {
        let mut unassigned = Vec::new();
        let mut assigned = self.assigned;
        for (obs, prog) in self.observations.iter().zip(assigned.iter_mut()) {
            if !is_progid_valid(&prog.progid) {
                *prog = ProgramInfo::none();
                unassigned.push(obs.file.clone());
            }
        }

        let mut counts: Vec<(String, usize)> = self
            .programs
            .iter()
            .map(|p| (p.proj_code.clone(), 0))
            .collect();
        for prog in &assigned {
            match counts.iter_mut().find(|(id, _)| *id == prog.progid) {
                Some((_, n)) => *n += 1,
                None => counts.push((prog.progid.clone(), 1)),
            }
        }
        for (progid, count) in &counts {
            info!("PROGID COUNT: {}: {}", progid, count);
        }

        AssignmentReport {
            assignments: self.observations.into_iter().zip(assigned).collect(),
            counts,
            unassigned,
            num_programs: self.programs.len(),
        }
    }
}

/// Program id encoded in a ToO output directory, e.g. `/sdata/x_ToO_U123/spec`.
fn too_progid(outdir: &str) -> Option<String> {
    let (_, rest) = outdir.split_once(TOO_MARKER)?;
    let progid = rest.split('/').next().unwrap_or(rest).trim();
    (!progid.is_empty()).then(|| progid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_progid() {
        assert_eq!(too_progid("/sdata/2021mar04_ToO_U123").as_deref(), Some("U123"));
        assert_eq!(too_progid("/sdata/x_ToO_N45/spec").as_deref(), Some("N45"));
        assert_eq!(too_progid("/sdata/run1"), None);
        assert_eq!(too_progid("/sdata/x_ToO_"), None);
    }
}
