//! Reader for the cached telescope schedule (`dep_obtain{INSTR}.txt`).
//!
//! One program per line with the fixed columns in [`SCHEDULE_COLUMNS`].
//! Lines are split on tabs when any tab is present, otherwise on spaces.
//! Trailing columns that are missing are treated as null.

use chrono::NaiveTime;
use log::{debug, warn};
use std::path::Path;

use super::{read_existing, ParseError};
use crate::models::{Program, NONE};

pub const SCHEDULE_COLUMNS: [&str; 11] = [
    "Date",
    "OA",
    "Account",
    "Institution",
    "Principal",
    "ProjCode",
    "Observer",
    "StartTime",
    "EndTime",
    "Instrument",
    "TelNr",
];

/// `dep_obtain{INSTR}.txt`
pub fn schedule_file_name(instrument: &str) -> String {
    format!("dep_obtain{}.txt", instrument.to_uppercase())
}

/// Read the schedule file. A missing file is an error.
pub fn read_schedule(path: &Path) -> Result<Vec<Program>, ParseError> {
    let content = read_existing(path)?;
    let programs = read_schedule_str(&content);
    debug!(
        "read_schedule: {} program(s) from {}",
        programs.len(),
        path.display()
    );
    Ok(programs)
}

/// Parse schedule content.
///
/// A schedule consisting of a single `NONE` program means nothing was
/// scheduled and yields an empty list.
pub fn read_schedule_str(content: &str) -> Vec<Program> {
    let mut programs: Vec<Program> = content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(parse_line)
        .collect();

    if programs.len() == 1 && programs[0].is_none_program() {
        programs.clear();
    }
    programs
}

fn parse_line(line: &str) -> Program {
    let line = line.trim();
    let vals: Vec<&str> = if line.contains('\t') {
        line.split('\t').map(str::trim).collect()
    } else {
        line.split(' ').filter(|v| !v.is_empty()).collect()
    };
    let col = |idx: usize| -> Option<String> {
        vals.get(idx)
            .map(|v| v.to_string())
            .filter(|v| !v.is_empty())
    };

    Program {
        date: col(0),
        oa: col(1),
        account: col(2),
        institution: col(3).unwrap_or_else(|| NONE.to_string()),
        principal: col(4).unwrap_or_else(|| NONE.to_string()),
        proj_code: col(5).unwrap_or_else(|| NONE.to_string()),
        observer: col(6).unwrap_or_default(),
        start_time: col(7).and_then(|t| parse_schedule_time(&t)),
        end_time: col(8).and_then(|t| parse_schedule_time(&t)),
        instrument: col(9),
        tel_nr: col(10),
    }
}

/// Schedule times are `HH:MM`; `HH:MM:SS` is tolerated. `NONE` and junk are null.
pub fn parse_schedule_time(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case(NONE) {
        return None;
    }
    match NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
    {
        Ok(t) => Some(t),
        Err(_) => {
            warn!("read_schedule: ignoring unparseable time '{}'", value);
            None
        }
    }
}
