//! Processing status records.
//!
//! One [`StatusRecord`] exists per (instrument, level, koaid). Records are
//! created when a file is submitted, mutated only by the pipeline run that owns
//! them, and copied to history (never deleted) when a reprocess is requested.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Queued,
    Processing,
    Transferring,
    Transferred,
    Complete,
    Error,
    Invalid,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Queued,
        Status::Processing,
        Status::Transferring,
        Status::Transferred,
        Status::Complete,
        Status::Error,
        Status::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Processing => "PROCESSING",
            Status::Transferring => "TRANSFERRING",
            Status::Transferred => "TRANSFERRED",
            Status::Complete => "COMPLETE",
            Status::Error => "ERROR",
            Status::Invalid => "INVALID",
        }
    }

    /// True while some worker still owns the record.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Status::Queued | Status::Processing | Status::Transferring | Status::Transferred
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown status: {}", s))
    }
}

/// A persisted processing status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: i64,
    pub level: u8,
    pub instrument: String,
    pub koaid: Option<String>,
    pub ofname: Option<String>,
    pub stage_file: Option<String>,
    pub status: Status,
    pub status_code: Option<String>,
    pub semid: Option<String>,
    pub koaimtyp: Option<String>,
    pub filesize_mb: Option<f64>,
    pub archsize_mb: Option<f64>,
    pub process_dir: Option<String>,
    pub utdatetime: Option<NaiveDateTime>,
    pub creation_time: DateTime<Utc>,
    pub process_start_time: Option<DateTime<Utc>>,
    pub process_end_time: Option<DateTime<Utc>>,
    pub xfr_start_time: Option<DateTime<Utc>>,
    pub xfr_end_time: Option<DateTime<Utc>>,
    pub ipac_notify_time: Option<DateTime<Utc>>,
    pub ipac_response_time: Option<DateTime<Utc>>,
}

impl StatusRecord {
    /// Build a fresh record from an insert payload.
    pub fn from_new(id: i64, new: NewStatusRecord) -> Self {
        Self {
            id,
            level: new.level,
            instrument: new.instrument,
            koaid: new.koaid,
            ofname: new.ofname,
            stage_file: new.stage_file,
            status: new.status,
            status_code: None,
            semid: None,
            koaimtyp: None,
            filesize_mb: None,
            archsize_mb: None,
            process_dir: None,
            utdatetime: None,
            creation_time: new.creation_time,
            process_start_time: None,
            process_end_time: None,
            xfr_start_time: None,
            xfr_end_time: None,
            ipac_notify_time: None,
            ipac_response_time: None,
        }
    }

    /// Apply a single-column update in place.
    pub fn apply(&mut self, field: StatusField) {
        match field {
            StatusField::Status(v) => self.status = v,
            StatusField::StatusCode(v) => self.status_code = v,
            StatusField::Koaid(v) => self.koaid = Some(v),
            StatusField::Ofname(v) => self.ofname = Some(v),
            StatusField::StageFile(v) => self.stage_file = Some(v),
            StatusField::SemId(v) => self.semid = Some(v),
            StatusField::KoaImTyp(v) => self.koaimtyp = Some(v),
            StatusField::FilesizeMb(v) => self.filesize_mb = Some(v),
            StatusField::ArchsizeMb(v) => self.archsize_mb = Some(v),
            StatusField::ProcessDir(v) => self.process_dir = Some(v),
            StatusField::UtDateTime(v) => self.utdatetime = Some(v),
            StatusField::ProcessStartTime(v) => self.process_start_time = Some(v),
            StatusField::ProcessEndTime(v) => self.process_end_time = Some(v),
            StatusField::XfrStartTime(v) => self.xfr_start_time = Some(v),
            StatusField::XfrEndTime(v) => self.xfr_end_time = Some(v),
            StatusField::IpacNotifyTime(v) => self.ipac_notify_time = Some(v),
            StatusField::IpacResponseTime(v) => self.ipac_response_time = Some(v),
        }
    }

    /// Reset lifecycle fields after the row has been copied to history.
    pub fn reset_for_reprocess(&mut self, now: DateTime<Utc>) {
        self.status = Status::Processing;
        self.status_code = None;
        self.filesize_mb = None;
        self.archsize_mb = None;
        self.creation_time = now;
        self.process_start_time = Some(now);
        self.process_end_time = None;
        self.xfr_start_time = None;
        self.xfr_end_time = None;
        self.ipac_notify_time = None;
        self.ipac_response_time = None;
    }
}

/// Insert payload for a new status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStatusRecord {
    pub level: u8,
    pub instrument: String,
    pub koaid: Option<String>,
    pub ofname: Option<String>,
    pub stage_file: Option<String>,
    pub status: Status,
    pub creation_time: DateTime<Utc>,
}

impl NewStatusRecord {
    /// A record queued for a newly submitted file.
    pub fn queued(instrument: impl Into<String>, level: u8, ofname: impl Into<String>) -> Self {
        Self {
            level,
            instrument: instrument.into(),
            koaid: None,
            ofname: Some(ofname.into()),
            stage_file: None,
            status: Status::Queued,
            creation_time: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_koaid(mut self, koaid: impl Into<String>) -> Self {
        self.koaid = Some(koaid.into());
        self
    }

    pub fn with_stage_file(mut self, stage_file: impl Into<String>) -> Self {
        self.stage_file = Some(stage_file.into());
        self
    }

    pub fn with_creation_time(mut self, creation_time: DateTime<Utc>) -> Self {
        self.creation_time = creation_time;
        self
    }
}

/// A typed single-column update (`update ... set <col>=<val> where id=<id>`).
#[derive(Debug, Clone, PartialEq)]
pub enum StatusField {
    Status(Status),
    StatusCode(Option<String>),
    Koaid(String),
    Ofname(String),
    StageFile(String),
    SemId(String),
    KoaImTyp(String),
    FilesizeMb(f64),
    ArchsizeMb(f64),
    ProcessDir(String),
    UtDateTime(NaiveDateTime),
    ProcessStartTime(DateTime<Utc>),
    ProcessEndTime(DateTime<Utc>),
    XfrStartTime(DateTime<Utc>),
    XfrEndTime(DateTime<Utc>),
    IpacNotifyTime(DateTime<Utc>),
    IpacResponseTime(DateTime<Utc>),
}

impl StatusField {
    /// Column name in the `dep_status` table.
    pub fn column(&self) -> &'static str {
        match self {
            StatusField::Status(_) => "status",
            StatusField::StatusCode(_) => "status_code",
            StatusField::Koaid(_) => "koaid",
            StatusField::Ofname(_) => "ofname",
            StatusField::StageFile(_) => "stage_file",
            StatusField::SemId(_) => "semid",
            StatusField::KoaImTyp(_) => "koaimtyp",
            StatusField::FilesizeMb(_) => "filesize_mb",
            StatusField::ArchsizeMb(_) => "archsize_mb",
            StatusField::ProcessDir(_) => "process_dir",
            StatusField::UtDateTime(_) => "utdatetime",
            StatusField::ProcessStartTime(_) => "process_start_time",
            StatusField::ProcessEndTime(_) => "process_end_time",
            StatusField::XfrStartTime(_) => "xfr_start_time",
            StatusField::XfrEndTime(_) => "xfr_end_time",
            StatusField::IpacNotifyTime(_) => "ipac_notify_time",
            StatusField::IpacResponseTime(_) => "ipac_response_time",
        }
    }
}

/// A snapshot copied into `dep_status_history` before a reprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub history_id: i64,
    pub archived_at: DateTime<Utc>,
    pub record: StatusRecord,
}

/// One line of a grouped status report: `(instrument, count, status_code)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummaryRow {
    pub instrument: String,
    pub count: i64,
    pub status_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert_eq!("complete".parse::<Status>().unwrap(), Status::Complete);
        assert!("WARN".parse::<Status>().is_err());
    }

    #[test]
    fn test_in_flight_states() {
        assert!(Status::Queued.is_in_flight());
        assert!(Status::Transferred.is_in_flight());
        assert!(!Status::Complete.is_in_flight());
        assert!(!Status::Error.is_in_flight());
        assert!(!Status::Invalid.is_in_flight());
    }

    #[test]
    fn test_apply_and_reset() {
        let new = NewStatusRecord::queued("HIRES", 0, "/s/sdata/hires/h0001.fits");
        let mut record = StatusRecord::from_new(7, new);
        record.apply(StatusField::Status(Status::Complete));
        record.apply(StatusField::StatusCode(Some("DUPLICATE_KOAID".into())));
        record.apply(StatusField::XfrStartTime(Utc::now()));
        assert_eq!(record.status, Status::Complete);
        assert!(record.xfr_start_time.is_some());

        record.reset_for_reprocess(Utc::now());
        assert_eq!(record.status, Status::Processing);
        assert!(record.status_code.is_none());
        assert!(record.xfr_start_time.is_none());
        assert_eq!(record.ofname.as_deref(), Some("/s/sdata/hires/h0001.fits"));
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&Status::Transferring).unwrap();
        assert_eq!(json, "\"TRANSFERRING\"");
    }
}
