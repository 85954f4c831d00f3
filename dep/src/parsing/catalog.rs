//! Reader for the per-file working set (`createprog.txt`).
//!
//! The header extraction step writes one value per line, twelve lines per
//! file, in the order of [`CATALOG_FIELDS`]. Values may be blank, so blank
//! lines are significant.

use log::warn;
use std::path::{Path, PathBuf};

use super::{read_existing, ParseError};
use crate::models::{Observation, ProgramInfo};

pub const CATALOG_FILE: &str = "createprog.txt";

pub const CATALOG_FIELDS: [&str; 12] = [
    "file", "utdate", "utc", "outdir", "observer", "frameno", "imagetyp", "progid", "progpi",
    "proginst", "progtitl", "oa",
];

/// Read `createprog.txt`. A missing file is an error.
pub fn read_catalog(path: &Path) -> Result<Vec<Observation>, ParseError> {
    let content = read_existing(path)?;
    Ok(read_catalog_str(&content))
}

pub fn read_catalog_str(content: &str) -> Vec<Observation> {
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    let width = CATALOG_FIELDS.len();

    let mut observations = Vec::with_capacity(lines.len() / width);
    let mut chunks = lines.chunks_exact(width);
    for row in chunks.by_ref() {
        observations.push(Observation {
            file: row[0].to_string(),
            utdate: row[1].to_string(),
            utc: row[2].to_string(),
            outdir: row[3].to_string(),
            observer: row[4].to_string(),
            frameno: row[5].to_string(),
            imagetyp: row[6].to_string(),
            header_prog: ProgramInfo {
                progid: row[7].to_string(),
                progpi: row[8].to_string(),
                proginst: row[9].to_string(),
                progtitl: row[10].to_string(),
            },
            oa: row[11].to_string(),
        });
    }

    let leftover = chunks.remainder();
    if leftover.iter().any(|l| !l.is_empty()) {
        warn!(
            "read_catalog: ignoring {} trailing line(s) that do not form a complete record",
            leftover.len()
        );
    }
    observations
}

/// Read a newline-delimited list of absolute file paths.
pub fn read_file_list(path: &Path) -> Result<Vec<PathBuf>, ParseError> {
    let content = read_existing(path)?;
    let mut files = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let file = PathBuf::from(line);
        if !file.is_absolute() {
            return Err(ParseError::Malformed {
                line: idx + 1,
                message: format!("expected an absolute path, got '{}'", line),
            });
        }
        files.push(file);
    }
    Ok(files)
}
