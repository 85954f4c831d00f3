//! The assignment result (`newproginfo.txt`), written once per night and
//! read back when each file is processed.

use log::warn;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use super::{read_existing, ParseError};
use crate::models::{Observation, ProgramInfo};

pub const PROGINFO_FILE: &str = "newproginfo.txt";

/// One tab separated line per file: file, outdir, proginst, progid, progpi, progtitl.
pub fn format_proginfo<'a, I>(rows: I) -> String
where
    I: IntoIterator<Item = (&'a Observation, &'a ProgramInfo)>,
{
    let mut out = String::new();
    for (obs, prog) in rows {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}",
            obs.file, obs.outdir, prog.proginst, prog.progid, prog.progpi, prog.progtitl
        );
    }
    out
}

pub fn write_proginfo<'a, I>(path: &Path, rows: I) -> std::io::Result<()>
where
    I: IntoIterator<Item = (&'a Observation, &'a ProgramInfo)>,
{
    std::fs::write(path, format_proginfo(rows))
}

/// Program values keyed by file path, as written by [`format_proginfo`].
///
/// Titles may be empty, so lines with five columns are accepted.
pub fn parse_proginfo(content: &str) -> HashMap<String, ProgramInfo> {
    let mut entries = HashMap::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 5 {
            warn!("Skipping malformed {} line {}: '{}'", PROGINFO_FILE, idx + 1, line);
            continue;
        }
        let title = cols.get(5).copied().unwrap_or_default();
        entries.insert(
            cols[0].to_string(),
            ProgramInfo::new(cols[3], cols[2], cols[4], title),
        );
    }
    entries
}

pub fn read_proginfo(path: &Path) -> Result<HashMap<String, ProgramInfo>, ParseError> {
    Ok(parse_proginfo(&read_existing(path)?))
}
