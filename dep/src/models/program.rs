//! Scheduled programs and program assignment values.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::instrument::Instrument;

/// Program id used for engineering data.
pub const ENG: &str = "ENG";
/// Program id used when no program could be determined.
pub const NONE: &str = "NONE";

/// Placeholder values written by the header extraction step before assignment.
pub const PLACEHOLDER_PROGID: &str = "PROGID";
pub const PLACEHOLDER_PROGPI: &str = "PROGPI";
pub const PLACEHOLDER_PROGINST: &str = "PROGINST";
pub const PLACEHOLDER_PROGTITL: &str = "PROGTITL";

/// One scheduled allocation from the telescope schedule feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub date: Option<String>,
    pub oa: Option<String>,
    pub account: Option<String>,
    pub institution: String,
    pub principal: String,
    pub proj_code: String,
    pub observer: String,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub instrument: Option<String>,
    pub tel_nr: Option<String>,
}

impl Program {
    /// A program with just a project code; everything else blank.
    pub fn new(proj_code: impl Into<String>) -> Self {
        Self {
            date: None,
            oa: None,
            account: None,
            institution: NONE.to_string(),
            principal: NONE.to_string(),
            proj_code: proj_code.into(),
            observer: String::new(),
            start_time: None,
            end_time: None,
            instrument: None,
            tel_nr: None,
        }
    }

    pub fn with_window(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = principal.into();
        self
    }

    pub fn with_institution(mut self, institution: impl Into<String>) -> Self {
        self.institution = institution.into();
        self
    }

    pub fn with_observer(mut self, observer: impl Into<String>) -> Self {
        self.observer = observer.into();
        self
    }

    /// `[start, end)` when both ends are known.
    pub fn time_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    pub fn is_none_program(&self) -> bool {
        self.proj_code == NONE
    }
}

/// The PROG* values assigned to one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub progid: String,
    pub proginst: String,
    pub progpi: String,
    pub progtitl: String,
}

impl ProgramInfo {
    pub fn new(
        progid: impl Into<String>,
        proginst: impl Into<String>,
        progpi: impl Into<String>,
        progtitl: impl Into<String>,
    ) -> Self {
        Self {
            progid: progid.into(),
            proginst: proginst.into(),
            progpi: progpi.into(),
            progtitl: progtitl.into(),
        }
    }

    /// Values carried by a file that has not been assigned yet.
    pub fn placeholder() -> Self {
        Self::new(
            PLACEHOLDER_PROGID,
            PLACEHOLDER_PROGINST,
            PLACEHOLDER_PROGPI,
            PLACEHOLDER_PROGTITL,
        )
    }

    /// Sentinel used when nothing could be determined.
    pub fn none() -> Self {
        Self::new(NONE, NONE, NONE, "")
    }

    /// Fixed values for engineering data. Never looked up remotely.
    pub fn engineering(instrument: Instrument) -> Self {
        Self::new(
            ENG,
            "KECK",
            instrument.engineering_pi(),
            instrument.engineering_title(),
        )
    }

    pub fn is_engineering(&self) -> bool {
        self.progid == ENG
    }

    /// A file counts as assigned once it carries a real PI.
    pub fn has_pi(&self) -> bool {
        !matches!(self.progpi.as_str(), PLACEHOLDER_PROGPI | "" | NONE)
    }
}

impl Default for ProgramInfo {
    fn default() -> Self {
        Self::placeholder()
    }
}

/// Strip an optional `YYYY[AB]_` semester prefix from a program id.
pub fn strip_semester(progid: &str) -> &str {
    match progid.split_once('_') {
        Some((sem, rest)) if is_semester(sem) => rest,
        _ => progid,
    }
}

fn is_semester(s: &str) -> bool {
    match s.as_bytes() {
        [y0, y1, y2, y3, half] => {
            [y0, y1, y2, y3].iter().all(|b| b.is_ascii_digit())
                && matches!(half, b'A' | b'B' | b'a' | b'b')
        }
        _ => false,
    }
}

/// Syntax check for a program id: non-empty, no spaces, not a placeholder,
/// and 3 to 5 characters once an optional semester prefix is removed.
pub fn is_progid_valid(progid: &str) -> bool {
    let progid = progid.trim();
    if progid.is_empty() || progid.contains(' ') {
        return false;
    }
    let upper = progid.to_uppercase();
    if matches!(upper.as_str(), PLACEHOLDER_PROGID | NONE | "NULL") {
        return false;
    }
    let code = strip_semester(progid);
    (3..=5).contains(&code.chars().count()) && !code.contains('_')
}

/// Time-split program override, e.g. `U205,10:21:00,C251,13:45:56,N123`.
///
/// Entries alternate between a program id and the UTC split time that ends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgNameAssignment {
    progids: Vec<String>,
    splits: Vec<NaiveTime>,
}

impl ProgNameAssignment {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let parts: Vec<&str> = spec.split(',').map(str::trim).collect();
        if parts.len() % 2 != 1 || parts.iter().any(|p| p.is_empty()) {
            return Err(format!("Incorrect program assignment string: {}", spec));
        }

        let mut progids = Vec::new();
        let mut splits = Vec::new();
        for (idx, part) in parts.iter().enumerate() {
            if idx % 2 == 0 {
                progids.push(part.to_string());
            } else {
                let split = NaiveTime::parse_from_str(part, "%H:%M:%S")
                    .map_err(|e| format!("Invalid split time '{}': {}", part, e))?;
                splits.push(split);
            }
        }
        Ok(Self { progids, splits })
    }

    /// First program whose split time is at or after `utc`, else the last one.
    pub fn progid_for(&self, utc: NaiveTime) -> &str {
        for (progid, split) in self.progids.iter().zip(self.splits.iter()) {
            if utc <= *split {
                return progid;
            }
        }
        self.progids.last().map(String::as_str).unwrap_or(NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progid_validation() {
        assert!(is_progid_valid("C123"));
        assert!(is_progid_valid("2019A_U205"));
        assert!(is_progid_valid("ENG"));
        assert!(!is_progid_valid(""));
        assert!(!is_progid_valid("NONE"));
        assert!(!is_progid_valid("PROGID"));
        assert!(!is_progid_valid("C1 23"));
        assert!(!is_progid_valid("AB"));
        assert!(!is_progid_valid("TOOLONG"));
        assert!(!is_progid_valid("2019A_TOOLONG"));
    }

    #[test]
    fn test_strip_semester() {
        assert_eq!(strip_semester("2020B_N123"), "N123");
        assert_eq!(strip_semester("N123"), "N123");
        assert_eq!(strip_semester("ToO_N123"), "ToO_N123");
        assert_eq!(strip_semester("abcé_X"), "abcé_X");
        assert_eq!(strip_semester("2020é_X"), "2020é_X");
    }

    #[test]
    fn test_non_ascii_progids_are_rejected_not_panicking() {
        assert!(!is_progid_valid("abcé_X"));
        assert!(!is_progid_valid("20é_N12"));
        assert!(is_progid_valid("Cé12"));
    }

    #[test]
    fn test_has_pi() {
        assert!(!ProgramInfo::placeholder().has_pi());
        assert!(!ProgramInfo::none().has_pi());
        assert!(ProgramInfo::engineering(Instrument::Hires).has_pi());
    }

    #[test]
    fn test_prog_name_assignment() {
        let single = ProgNameAssignment::parse("U205").unwrap();
        assert_eq!(single.progid_for(NaiveTime::from_hms_opt(23, 0, 0).unwrap()), "U205");

        let split = ProgNameAssignment::parse("U205,10:21:00,C251,13:45:56,N123").unwrap();
        let t = |h, m, s| NaiveTime::from_hms_opt(h, m, s).unwrap();
        assert_eq!(split.progid_for(t(9, 0, 0)), "U205");
        assert_eq!(split.progid_for(t(10, 21, 0)), "U205");
        assert_eq!(split.progid_for(t(12, 0, 0)), "C251");
        assert_eq!(split.progid_for(t(14, 0, 0)), "N123");

        assert!(ProgNameAssignment::parse("U205,10:21:00").is_err());
        assert!(ProgNameAssignment::parse("U205,xx,C251").is_err());
    }
}
