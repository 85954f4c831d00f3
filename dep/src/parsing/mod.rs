//! Readers and writers for the flat files exchanged with the header
//! extraction and schedule caching steps.
//!
//! # Parsers
//!
//! - [`schedule`]: the night's program schedule (`dep_obtain{INSTR}.txt`)
//! - [`catalog`]: the per-file working set (`createprog.txt`) and plain file lists
//! - [`proginfo`]: the assignment result (`newproginfo.txt`)

use std::path::PathBuf;

pub mod catalog;
pub mod proginfo;
pub mod schedule;

#[cfg(test)]
mod schedule_tests;

pub use catalog::{read_catalog, read_catalog_str, read_file_list, CATALOG_FILE};
pub use proginfo::{format_proginfo, parse_proginfo, read_proginfo, write_proginfo, PROGINFO_FILE};
pub use schedule::{read_schedule, read_schedule_str, schedule_file_name, SCHEDULE_COLUMNS};

/// Errors raised while reading pipeline input files.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Input file does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed line {line}: {message}")]
    Malformed { line: usize, message: String },
}

pub(crate) fn read_existing(path: &std::path::Path) -> Result<String, ParseError> {
    if !path.is_file() {
        return Err(ParseError::NotFound(path.to_path_buf()));
    }
    std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })
}
