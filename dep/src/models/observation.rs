use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::program::ProgramInfo;

/// One FITS exposure as seen by a nightly assignment pass.
///
/// Materialized once from header values and never mutated; assignment
/// results are carried separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub file: String,
    pub utdate: String,
    pub utc: String,
    pub outdir: String,
    pub observer: String,
    pub frameno: String,
    pub imagetyp: String,
    pub oa: String,
    /// PROG* values already present in the header (placeholders when absent).
    pub header_prog: ProgramInfo,
}

impl Observation {
    pub fn new(file: impl Into<String>, utc: impl Into<String>, outdir: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            utdate: String::new(),
            utc: utc.into(),
            outdir: outdir.into(),
            observer: String::new(),
            frameno: String::new(),
            imagetyp: "object".to_string(),
            oa: String::new(),
            header_prog: ProgramInfo::placeholder(),
        }
    }

    pub fn with_imagetyp(mut self, imagetyp: impl Into<String>) -> Self {
        self.imagetyp = imagetyp.into();
        self
    }

    pub fn with_observer(mut self, observer: impl Into<String>) -> Self {
        self.observer = observer.into();
        self
    }

    pub fn with_utdate(mut self, utdate: impl Into<String>) -> Self {
        self.utdate = utdate.into();
        self
    }

    pub fn with_header_prog(mut self, prog: ProgramInfo) -> Self {
        self.header_prog = prog;
        self
    }

    /// UTC time of day, accepting `hh:mm:ss` with or without a fraction.
    pub fn utc_time(&self) -> Option<NaiveTime> {
        parse_utc(&self.utc)
    }

    pub fn is_object(&self) -> bool {
        self.imagetyp.trim().eq_ignore_ascii_case("object")
    }

    /// File name without directories, for log messages.
    pub fn basename(&self) -> &str {
        self.file.rsplit('/').next().unwrap_or(&self.file)
    }
}

/// Parse `hh:mm:ss[.fff]`.
pub fn parse_utc(utc: &str) -> Option<NaiveTime> {
    let utc = utc.trim();
    NaiveTime::parse_from_str(utc, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(utc, "%H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_parsing() {
        let obs = Observation::new("/s/sdata/h1.fits", "09:30:00.25", "/s/sdata/run1");
        assert_eq!(obs.utc_time(), NaiveTime::from_hms_milli_opt(9, 30, 0, 250));
        assert_eq!(parse_utc("11:00:00"), NaiveTime::from_hms_opt(11, 0, 0));
        assert_eq!(parse_utc("bad"), None);
        assert_eq!(obs.basename(), "h1.fits");
    }
}
