//! Output-directory buckets and program time windows for split nights.

use chrono::{NaiveTime, Timelike};
use log::info;
use std::collections::BTreeMap;

use crate::models::{Observation, Program};
use crate::services::directory::SunTimes;

/// Output-directory substrings that mark engineering data.
pub const ENGINEERING_OUTDIRS: [&str; 12] = [
    "kcwieng",
    "kcwirun",
    "hireseng",
    "nspeceng",
    "nirc2eng",
    "dmoseng",
    "lriseng",
    "esieng",
    "nireseng",
    "osrseng",
    "osiriseng",
    "moseng",
];

/// Observer substrings that mark engineering data.
pub const ENGINEERING_OBSERVERS: [&str; 2] = ["keck ipdm", "nirspec"];

/// UT time at which one observing night hands over to the next (10am HST).
const NIGHT_BOUNDARY_SECS: u32 = 20 * 3600;
const DAY_SECS: u32 = 86_400;

pub fn is_engineering_outdir(outdir: &str) -> bool {
    let outdir = outdir.to_lowercase();
    ENGINEERING_OUTDIRS.iter().any(|k| outdir.contains(k))
}

pub fn is_engineering_observer(observer: &str) -> bool {
    let observer = observer.to_lowercase();
    ENGINEERING_OBSERVERS.iter().any(|k| observer.contains(k))
}

/// Strip camera subdirectories so all frames of one run share a bucket.
pub fn normalize_outdir(outdir: &str) -> String {
    let mut outdir = outdir.replace("/fcs", "");
    for subdir in ["/s/", "//", "/scam/", "/spec/", "/scam", "/spec"] {
        outdir = outdir.replace(subdir, "/");
    }
    outdir
}

/// Seconds since the start of the observing night.
fn night_offset(t: NaiveTime) -> u32 {
    (t.num_seconds_from_midnight() + DAY_SECS - NIGHT_BOUNDARY_SECS) % DAY_SECS
}

/// A program's `[start, end)` window in UT.
///
/// Times of day are compared on the observing-night axis, so a window that
/// crosses UT midnight still orders correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Window {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    fn bounds(&self) -> (u32, u32) {
        let start = night_offset(self.start);
        let mut end = night_offset(self.end);
        if end <= start {
            end += DAY_SECS;
        }
        (start, end)
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        let (start, end) = self.bounds();
        let t = night_offset(t);
        start <= t && t < end
    }

    /// True when `t` falls before the end of this window.
    pub fn ends_after(&self, t: NaiveTime) -> bool {
        night_offset(t) < self.bounds().1
    }
}

/// Order programs by StartTime.
///
/// Bubble passes stop as soon as a program without a StartTime is reached,
/// leaving the rest of the list as scheduled.
pub fn sort_by_start_time(programs: &mut [Program]) {
    let mut swapped = true;
    while swapped {
        swapped = false;
        for i in 0..programs.len().saturating_sub(1) {
            let (Some(a), Some(b)) = (programs[i].start_time, programs[i + 1].start_time) else {
                if programs[i].start_time.is_none() {
                    swapped = false;
                    break;
                }
                continue;
            };
            if a > b {
                programs.swap(i, i + 1);
                swapped = true;
            }
        }
    }
}

/// Give programs without explicit times a window from the sun times: the
/// first program gets sunset to midpoint, the rest midpoint to sunrise.
/// `split_time` replaces the midpoint.
///
/// Returns whether any program was missing times.
pub fn fill_default_windows(
    programs: &mut [Program],
    sun: Option<SunTimes>,
    split_time: Option<NaiveTime>,
) -> bool {
    let mut missing = false;
    for (idx, prog) in programs.iter_mut().enumerate() {
        if prog.time_window().is_some() {
            continue;
        }
        missing = true;
        let Some(sun) = sun else {
            continue;
        };
        let midpoint = split_time.unwrap_or(sun.midpoint);
        let (start, end) = if idx == 0 {
            (sun.sunset, midpoint)
        } else {
            (midpoint, sun.sunrise)
        };
        info!(
            "Assigning start/end times for {} to suntimes {} - {}",
            prog.proj_code,
            start.format("%H:%M"),
            end.format("%H:%M")
        );
        prog.start_time = Some(start);
        prog.end_time = Some(end);
    }
    missing
}

/// Object-frame counts for one normalized output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdirBucket {
    /// Program index the whole bucket maps to, once decided.
    pub assign: Option<usize>,
    /// Object frames per program window.
    pub counts: Vec<usize>,
    pub total: usize,
}

impl OutdirBucket {
    fn new(programs: usize) -> Self {
        Self {
            assign: None,
            counts: vec![0; programs],
            total: 0,
        }
    }
}

/// Majority rule for one program in a bucket.
///
/// `count` is the program's object frames, `total` the bucket's.
pub fn meets_majority(count: usize, total: usize) -> bool {
    if total == 0 {
        return false;
    }
    let share = count as f64 / total as f64;
    (share > 0.85 && count > 10) || (share > 0.95 && count > 3)
}

/// Bucket every non-engineering observation by normalized outdir and count
/// object frames into the first window containing their UTC.
pub fn build_buckets(
    observations: &[Observation],
    windows: &[Option<Window>],
) -> BTreeMap<String, OutdirBucket> {
    let mut buckets: BTreeMap<String, OutdirBucket> = BTreeMap::new();
    for obs in observations {
        let fdir = normalize_outdir(&obs.outdir);
        if is_engineering_outdir(&fdir) || fdir == "0" || fdir.contains("fcs") {
            continue;
        }
        let bucket = buckets
            .entry(fdir)
            .or_insert_with(|| OutdirBucket::new(windows.len()));

        if !obs.is_object() {
            continue;
        }
        let Some(t) = obs.utc_time() else {
            continue;
        };
        if let Some(idx) = windows
            .iter()
            .position(|w| w.is_some_and(|w| w.contains(t)))
        {
            bucket.counts[idx] += 1;
            bucket.total += 1;
        }
    }
    buckets
}

/// The program index, if any, that holds a majority of the bucket.
pub fn majority_program(bucket: &OutdirBucket) -> Option<usize> {
    bucket
        .counts
        .iter()
        .position(|count| meets_majority(*count, bucket.total))
}
