#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use koa_dep::db::{LocalRepository, StatusRepository};
use koa_dep::fits::FitsFile;
use koa_dep::services::{CachingDirectory, Pipeline, StaticDirectory};

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Runs `f` with environment variables temporarily modified.
///
/// This is panic-safe (restores variables on unwind) and also serializes access to
/// process-global env vars to avoid flaky tests when Rust runs tests in parallel.
///
/// `changes` is a list of `(key, value)` pairs:
/// - `Some(v)` sets the variable to `v`
/// - `None` removes the variable
pub fn with_scoped_env<F, R>(changes: &[(&str, Option<&str>)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _guard = ScopedEnv::new(changes);
    f()
}

struct ScopedEnv {
    snapshot: Vec<(String, Option<String>)>,
}

impl ScopedEnv {
    fn new(changes: &[(&str, Option<&str>)]) -> Self {
        let keys: HashSet<&str> = changes.iter().map(|(k, _)| *k).collect();
        let snapshot = keys
            .into_iter()
            .map(|k| (k.to_string(), std::env::var(k).ok()))
            .collect::<Vec<_>>();

        for (k, v) in changes {
            match v {
                Some(val) => std::env::set_var(k, val),
                None => std::env::remove_var(k),
            }
        }

        Self { snapshot }
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        for (k, v) in self.snapshot.drain(..) {
            match v {
                Some(val) => std::env::set_var(&k, val),
                None => std::env::remove_var(&k),
            }
        }
    }
}

pub const KEYWORD_TABLE: &str = "FITSKeyword\tMetadataDatatype\tNullsAllowed\tMetadataWidth\n\
    KOAID\tchar\tN\t30\n\
    PROGID\tchar\tY\t8\n\
    PROGPI\tchar\tY\t20\n\
    PROGTITL\tchar\tY\t40\n\
    PROPINT\tinteger\tY\t3\n\
    SEMESTER\tchar\tY\t8\n\
    KOAIMTYP\tchar\tY\t12\n";

/// A HIRES object frame taken at `utc` on 2021-03-04 for program C123.
pub fn hires_frame(utc: &str) -> FitsFile {
    let mut fits = FitsFile::new_primary();
    fits.set("INSTRUME", "HIRES: High Resolution Echelle Spectrometer", "")
        .unwrap();
    fits.set("DATE-OBS", "2021-03-04", "").unwrap();
    fits.set("UTC", utc, "").unwrap();
    fits.set("IMAGETYP", "object", "").unwrap();
    fits.set("PROGNAME", "C123", "").unwrap();
    fits.set("OUTFILE", "hires", "").unwrap();
    fits.set("FRAMENO", 1_i64, "").unwrap();
    fits.set("EXPTIME", 300.0, "").unwrap();
    fits
}

/// Write `fits` as `name` inside `dir` and return the path.
pub fn write_fits(dir: &Path, name: &str, fits: &FitsFile) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fits.write_to(&path).unwrap();
    path
}

pub fn program_directory() -> StaticDirectory {
    StaticDirectory::new()
        .with_program("2021A_C123", "Smith", "Caltech", "Stellar Populations")
        .with_period("2021A_C123", 12)
}

/// A processing root with the HIRES and KCWI keyword tables in place.
pub struct Workspace {
    pub root: tempfile::TempDir,
    pub repo: LocalRepository,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let keywords = root.path().join("keywords");
        std::fs::create_dir_all(&keywords).unwrap();
        for instr in ["HIRES", "KCWI"] {
            std::fs::write(
                keywords.join(format!("KOA_{}_Keyword_Table.txt", instr)),
                KEYWORD_TABLE,
            )
            .unwrap();
        }
        Self {
            root,
            repo: LocalRepository::new(),
        }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Where raw files are written before processing.
    pub fn sdata(&self) -> PathBuf {
        self.root.path().join("sdata")
    }

    pub fn pipeline(&self) -> Pipeline {
        let repo: Arc<dyn StatusRepository> = Arc::new(self.repo.clone());
        let directory = Arc::new(CachingDirectory::from_directory(program_directory()));
        Pipeline::new(repo, directory, self.root.path())
    }
}

/// Twelve catalog lines for one file.
pub fn catalog_entry(file: &str, utc: &str, outdir: &str, observer: &str, imagetyp: &str) -> String {
    [
        file, "2021-03-04", utc, outdir, observer, "1", imagetyp, "PROGID", "PROGPI", "PROGINST",
        "PROGTITL", "oa",
    ]
    .join("\n")
        + "\n"
}

/// One tab separated schedule line.
pub fn schedule_line(proj_code: &str, principal: &str, observer: &str, start: &str, end: &str) -> String {
    [
        "2021-03-04",
        "oa",
        "acct",
        "Caltech",
        principal,
        proj_code,
        observer,
        start,
        end,
        "HIRES",
        "1",
    ]
    .join("\t")
        + "\n"
}
