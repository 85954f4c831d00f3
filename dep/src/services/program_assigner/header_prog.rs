//! Legacy reprocessing: reconcile assigned PROG* values with those already
//! stored in the raw header.

use log::{error, info, warn};
use std::str::FromStr;

use crate::fits::FitsFile;
use crate::models::{ProgramInfo, NONE};

/// How header-stored PROG* values are used after assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProgMode {
    /// Fill only values the assignment could not determine.
    Assist,
    /// Always take the header value.
    Force,
}

impl FromStr for HeaderProgMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "assist" => Ok(Self::Assist),
            "force" => Ok(Self::Force),
            other => Err(format!("Unknown header program mode: {}", other)),
        }
    }
}

/// PROGID, PROGINST, PROGPI and PROGTL1..3 (joined with spaces) from a header.
/// Missing keywords read as empty.
pub fn header_prog_values(fits: &FitsFile) -> ProgramInfo {
    let get = |key: &str| fits.get_string(key).unwrap_or_default();

    let mut title = String::new();
    for (idx, key) in ["PROGTL1", "PROGTL2", "PROGTL3"].iter().enumerate() {
        let part = get(key);
        if part.is_empty() {
            continue;
        }
        if idx > 0 {
            title.push(' ');
        }
        title.push_str(&part);
    }

    ProgramInfo::new(get("PROGID"), get("PROGINST"), get("PROGPI"), title)
}

fn is_determined(value: &str) -> bool {
    !value.is_empty() && value != NONE && !value.contains("PROG")
}

/// Merge header values into an assignment for one file.
pub fn apply_header_prog(
    mode: HeaderProgMode,
    assigned: &mut ProgramInfo,
    header: &ProgramInfo,
    file: &str,
) {
    let fields: [(&str, &mut String, &String); 4] = [
        ("PROGID", &mut assigned.progid, &header.progid),
        ("PROGINST", &mut assigned.proginst, &header.proginst),
        ("PROGPI", &mut assigned.progpi, &header.progpi),
        ("PROGTITL", &mut assigned.progtitl, &header.progtitl),
    ];

    for (keyword, current, old) in fields {
        if old.is_empty() || *old == *current {
            continue;
        }
        let is_progid = keyword == "PROGID";
        match mode {
            HeaderProgMode::Assist if is_determined(current.as_str()) => {
                if is_progid {
                    error!("{} value mismatch. VERIFY new value for: {}", keyword, file);
                }
            }
            HeaderProgMode::Assist => {
                *current = old.clone();
                if is_progid {
                    info!(
                        "Could not determine {} value. Assigning from old header for: {}",
                        keyword, file
                    );
                }
            }
            HeaderProgMode::Force => {
                *current = old.clone();
                if is_progid {
                    warn!("Force assigning {} from old header for: {}", keyword, file);
                }
            }
        }
    }
}
