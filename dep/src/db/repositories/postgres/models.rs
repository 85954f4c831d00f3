use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;

use super::schema::{dep_error_notify, dep_headers, dep_status, dep_status_history};
use crate::db::repository::{ErrorContext, RepositoryError, RepositoryResult};
use crate::models::{HistoryRecord, NewStatusRecord, Status, StatusRecord};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dep_status)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StatusRow {
    pub id: i64,
    pub level: i16,
    pub instrument: String,
    pub koaid: Option<String>,
    pub ofname: Option<String>,
    pub stage_file: Option<String>,
    pub status: String,
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

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = dep_status)]
pub struct NewStatusRow {
    pub level: i16,
    pub instrument: String,
    pub koaid: Option<String>,
    pub ofname: Option<String>,
    pub stage_file: Option<String>,
    pub status: String,
    pub creation_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dep_status_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HistoryRow {
    pub history_id: i64,
    pub status_id: i64,
    pub archived_at: DateTime<Utc>,
    pub level: i16,
    pub instrument: String,
    pub koaid: Option<String>,
    pub ofname: Option<String>,
    pub stage_file: Option<String>,
    pub status: String,
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

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = dep_status_history)]
pub struct NewHistoryRow {
    pub status_id: i64,
    pub archived_at: DateTime<Utc>,
    pub level: i16,
    pub instrument: String,
    pub koaid: Option<String>,
    pub ofname: Option<String>,
    pub stage_file: Option<String>,
    pub status: String,
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

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = dep_error_notify)]
pub struct NewErrorNotifyRow {
    pub notify_time: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = dep_headers)]
pub struct HeaderRow {
    pub instrument: String,
    pub koaid: String,
    pub header: String,
    pub archived_at: DateTime<Utc>,
}

fn parse_status(raw: &str, id: i64) -> RepositoryResult<Status> {
    raw.parse::<Status>().map_err(|e| {
        RepositoryError::validation_with_context(
            e,
            ErrorContext::status_row("parse_status", id),
        )
    })
}

fn parse_level(raw: i16, id: i64) -> RepositoryResult<u8> {
    u8::try_from(raw).map_err(|_| {
        RepositoryError::validation_with_context(
            format!("level {} out of range", raw),
            ErrorContext::status_row("parse_level", id),
        )
    })
}

impl NewStatusRow {
    pub fn from_record(record: NewStatusRecord) -> Self {
        Self {
            level: i16::from(record.level),
            instrument: record.instrument,
            koaid: record.koaid,
            ofname: record.ofname,
            stage_file: record.stage_file,
            status: record.status.as_str().to_string(),
            creation_time: record.creation_time,
        }
    }
}

impl StatusRow {
    pub fn into_record(self) -> RepositoryResult<StatusRecord> {
        Ok(StatusRecord {
            id: self.id,
            level: parse_level(self.level, self.id)?,
            instrument: self.instrument,
            koaid: self.koaid,
            ofname: self.ofname,
            stage_file: self.stage_file,
            status: parse_status(&self.status, self.id)?,
            status_code: self.status_code,
            semid: self.semid,
            koaimtyp: self.koaimtyp,
            filesize_mb: self.filesize_mb,
            archsize_mb: self.archsize_mb,
            process_dir: self.process_dir,
            utdatetime: self.utdatetime,
            creation_time: self.creation_time,
            process_start_time: self.process_start_time,
            process_end_time: self.process_end_time,
            xfr_start_time: self.xfr_start_time,
            xfr_end_time: self.xfr_end_time,
            ipac_notify_time: self.ipac_notify_time,
            ipac_response_time: self.ipac_response_time,
        })
    }

    /// Snapshot of this row for `dep_status_history`.
    pub fn to_history(&self, archived_at: DateTime<Utc>) -> NewHistoryRow {
        NewHistoryRow {
            status_id: self.id,
            archived_at,
            level: self.level,
            instrument: self.instrument.clone(),
            koaid: self.koaid.clone(),
            ofname: self.ofname.clone(),
            stage_file: self.stage_file.clone(),
            status: self.status.clone(),
            status_code: self.status_code.clone(),
            semid: self.semid.clone(),
            koaimtyp: self.koaimtyp.clone(),
            filesize_mb: self.filesize_mb,
            archsize_mb: self.archsize_mb,
            process_dir: self.process_dir.clone(),
            utdatetime: self.utdatetime,
            creation_time: self.creation_time,
            process_start_time: self.process_start_time,
            process_end_time: self.process_end_time,
            xfr_start_time: self.xfr_start_time,
            xfr_end_time: self.xfr_end_time,
            ipac_notify_time: self.ipac_notify_time,
            ipac_response_time: self.ipac_response_time,
        }
    }
}

impl HistoryRow {
    pub fn into_history(self) -> RepositoryResult<HistoryRecord> {
        let id = self.status_id;
        Ok(HistoryRecord {
            history_id: self.history_id,
            archived_at: self.archived_at,
            record: StatusRecord {
                id,
                level: parse_level(self.level, id)?,
                instrument: self.instrument,
                koaid: self.koaid,
                ofname: self.ofname,
                stage_file: self.stage_file,
                status: parse_status(&self.status, id)?,
                status_code: self.status_code,
                semid: self.semid,
                koaimtyp: self.koaimtyp,
                filesize_mb: self.filesize_mb,
                archsize_mb: self.archsize_mb,
                process_dir: self.process_dir,
                utdatetime: self.utdatetime,
                creation_time: self.creation_time,
                process_start_time: self.process_start_time,
                process_end_time: self.process_end_time,
                xfr_start_time: self.xfr_start_time,
                xfr_end_time: self.xfr_end_time,
                ipac_notify_time: self.ipac_notify_time,
                ipac_response_time: self.ipac_response_time,
            },
        })
    }
}
