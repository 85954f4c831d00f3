//! KOA identifiers.
//!
//! A KOAID has the form `PP.YYYYMMDD.SSSSS.HH`:
//! a two character instrument/configuration prefix, the UT date without
//! separators, whole seconds since UT midnight padded to five digits, and
//! the first two digits of the sub-second fraction.

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Koaid {
    prefix: String,
    date: NaiveDate,
    seconds: u32,
    hundredths: u32,
}

impl Koaid {
    /// Build an identifier from its parts.
    pub fn new(prefix: &str, date: NaiveDate, utc: NaiveTime) -> Result<Self, String> {
        if prefix.len() != 2 || !prefix.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
            return Err(format!("Invalid KOAID prefix: '{}'", prefix));
        }
        let seconds = utc.num_seconds_from_midnight();
        // Leap-second nanos (>= 1e9) are folded into the last hundredth.
        let hundredths = (utc.nanosecond() / 10_000_000).min(99);
        Ok(Self {
            prefix: prefix.to_string(),
            date,
            seconds,
            hundredths,
        })
    }

    /// Build from DATE-OBS and UTC header strings.
    pub fn from_header_values(prefix: &str, dateobs: &str, utc: &str) -> Result<Self, String> {
        let date = NaiveDate::parse_from_str(&dateobs.trim().replace('/', "-"), "%Y-%m-%d")
            .map_err(|e| format!("Invalid DATE-OBS '{}': {}", dateobs, e))?;
        let time = super::observation::parse_utc(utc)
            .ok_or_else(|| format!("Invalid UTC '{}'", utc))?;
        Self::new(prefix, date, time)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// UT date directory name, `YYYYMMDD`.
    pub fn date_dir(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }
}

impl fmt::Display for Koaid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{:05}.{:02}",
            self.prefix,
            self.date.format("%Y%m%d"),
            self.seconds,
            self.hundredths
        )
    }
}

impl FromStr for Koaid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_end_matches(".fits");
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 || parts[2].len() != 5 || parts[3].len() != 2 {
            return Err(format!("Malformed KOAID: '{}'", s));
        }
        let date = NaiveDate::parse_from_str(parts[1], "%Y%m%d")
            .map_err(|e| format!("Malformed KOAID date '{}': {}", parts[1], e))?;
        let seconds: u32 = parts[2]
            .parse()
            .map_err(|_| format!("Malformed KOAID seconds: '{}'", parts[2]))?;
        let hundredths: u32 = parts[3]
            .parse()
            .map_err(|_| format!("Malformed KOAID hundredths: '{}'", parts[3]))?;
        if seconds > 86_400 {
            return Err(format!("KOAID seconds out of range: {}", seconds));
        }
        let time = NaiveTime::from_num_seconds_from_midnight_opt(
            seconds.min(86_399),
            hundredths * 10_000_000,
        )
        .ok_or_else(|| format!("Malformed KOAID time: '{}'", s))?;
        let mut koaid = Self::new(parts[0], date, time)?;
        koaid.seconds = seconds;
        Ok(koaid)
    }
}

impl TryFrom<String> for Koaid {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Koaid> for String {
    fn from(value: Koaid) -> Self {
        value.to_string()
    }
}

/// Check a UTC string has the form `hh:mm:ss[.ss]` with hh 0-24, mm 0-60, ss 0-60.
pub fn verify_utc(utc: &str) -> bool {
    let utc = utc.trim();
    let mut parts = utc.splitn(3, ':');
    let (Some(hh), Some(mm), Some(ss)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if hh.len() != 2 || mm.len() != 2 || ss.len() < 2 {
        return false;
    }
    let (Ok(hour), Ok(minute), Ok(second)) = (hh.parse::<u32>(), mm.parse::<u32>(), ss.parse::<f64>())
    else {
        return false;
    };
    hour <= 24 && minute <= 60 && (0.0..=60.0).contains(&second)
}
