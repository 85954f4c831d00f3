//! Directory layout of one instrument night under the root directory.
//!
//! ```text
//! {rootdir}/stage/{INSTR}/{YYYYMMDD}
//! {rootdir}/{INSTR}/{YYYYMMDD}            output, holds README
//! {rootdir}/{INSTR}/{YYYYMMDD}/lev0
//! {rootdir}/{INSTR}/{YYYYMMDD}/lev1
//! {rootdir}/{INSTR}/{YYYYMMDD}/anc
//! {rootdir}/{INSTR}/{YYYYMMDD}/anc/udf
//! {rootdir}/{INSTR}/{YYYYMMDD}/invalid
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::models::Instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirs {
    pub stage: PathBuf,
    pub process: PathBuf,
    pub output: PathBuf,
    pub lev0: PathBuf,
    pub lev1: PathBuf,
    pub anc: PathBuf,
    pub udf: PathBuf,
    pub invalid: PathBuf,
}

impl RunDirs {
    pub fn new(rootdir: &Path, instrument: Instrument, ymd: &str) -> Self {
        let instr = instrument.name();
        let output = rootdir.join(instr).join(ymd);
        let anc = output.join("anc");
        Self {
            stage: rootdir.join("stage").join(instr).join(ymd),
            process: rootdir.join(instr),
            lev0: output.join("lev0"),
            lev1: output.join("lev1"),
            udf: anc.join("udf"),
            invalid: output.join("invalid"),
            anc,
            output,
        }
    }

    /// Directory holding products of a processing level.
    pub fn level_dir(&self, level: u8) -> PathBuf {
        match level {
            0 => self.lev0.clone(),
            1 => self.lev1.clone(),
            n => self.output.join(format!("lev{}", n)),
        }
    }

    /// Create every directory and the output README. Existing directories
    /// are reused.
    pub fn create(&self, level: u8) -> io::Result<()> {
        for dir in [
            &self.stage,
            &self.process,
            &self.output,
            &self.lev0,
            &self.lev1,
            &self.anc,
            &self.udf,
            &self.invalid,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::create_dir_all(self.level_dir(level))?;
        std::fs::write(
            self.output.join("README"),
            format!("{}\n", self.output.display()),
        )
    }
}

/// Quarantine directory used before the UT date is known.
pub fn fallback_invalid_dir(rootdir: &Path, instrument: Instrument) -> PathBuf {
    rootdir.join(instrument.name()).join("invalid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_readme() {
        let root = tempfile::tempdir().unwrap();
        let dirs = RunDirs::new(root.path(), Instrument::Hires, "20210304");
        assert_eq!(dirs.lev0, root.path().join("HIRES/20210304/lev0"));
        assert_eq!(dirs.stage, root.path().join("stage/HIRES/20210304"));
        assert_eq!(dirs.udf, root.path().join("HIRES/20210304/anc/udf"));
        assert_eq!(dirs.level_dir(2), root.path().join("HIRES/20210304/lev2"));

        dirs.create(0).unwrap();
        dirs.create(0).unwrap();
        assert!(dirs.invalid.is_dir());
        let readme = std::fs::read_to_string(dirs.output.join("README")).unwrap();
        assert_eq!(readme.trim(), dirs.output.display().to_string());
    }
}
