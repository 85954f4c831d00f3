//! Keck observing semester calculations.
//!
//! Semester A runs from Feb 2 to Aug 1 (UT) and B from Aug 2 to Feb 1. The
//! first of the month belongs to the previous semester because 1 Aug UT is
//! still 31 Jul in Hawaii.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};

/// Semester for a UT observing date.
pub fn semester_for_utdate(utdate: NaiveDate) -> String {
    let (mut year, month, day) = (utdate.year(), utdate.month(), utdate.day());

    let is_b = month > 8 || month < 2 || (month == 8 && day > 1) || (month == 2 && day == 1);
    if month == 1 || (month == 2 && day == 1) {
        year -= 1;
    }
    format!("{}{}", year, if is_b { 'B' } else { 'A' })
}

/// Semester for a full DATE-OBS/UTC timestamp.
///
/// The timestamp is shifted back 20 hours (10 for HST, 10 more for the 10am
/// observing-day cutoff) before comparing against the Feb 1 / Aug 1 cutoffs.
pub fn semester_for_timestamp(date: NaiveDate, utc: NaiveTime) -> String {
    let shifted = NaiveDateTime::new(date, utc) - Duration::hours(20);
    let year = shifted.year();
    let sem_a = NaiveDate::from_ymd_opt(year, 2, 1).map(|d| d.and_time(NaiveTime::MIN));
    let sem_b = NaiveDate::from_ymd_opt(year, 8, 1).map(|d| d.and_time(NaiveTime::MIN));

    let is_a = match (sem_a, sem_b) {
        (Some(a), Some(b)) => shifted >= a && shifted < b,
        _ => false,
    };
    let year = if shifted.month() == 1 { year - 1 } else { year };
    format!("{}{}", year, if is_a { 'A' } else { 'B' })
}

/// `{semester}_{progid}` lookup key.
pub fn semid(semester: &str, progid: &str) -> String {
    format!("{}_{}", semester, progid)
}

/// Parse `YYYY-MM-DD` (slashes accepted).
pub fn parse_utdate(utdate: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&utdate.trim().replace('/', "-"), "%Y-%m-%d").ok()
}
