//! Postgres status store using Diesel.
//!
//! Tables: `dep_status` (one row per submitted file), `dep_status_history`
//! (snapshots taken before a reprocess), `dep_error_notify` (digest log) and
//! `dep_headers` (final headers of archived files).
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATABASE_URL` or `PG_DATABASE_URL`: Connection string (required)
//! - `PG_POOL_MAX`: Maximum pool size (default: 10)
//! - `PG_POOL_MIN`: Minimum pool size (default: 1)
//! - `PG_CONN_TIMEOUT_SEC`: Connection timeout in seconds (default: 30)
//! - `PG_IDLE_TIMEOUT_SEC`: Idle connection timeout in seconds (default: 600)
//! - `PG_MAX_RETRIES`: Maximum retry attempts for transient failures (default: 3)
//! - `PG_RETRY_DELAY_MS`: Initial retry delay in milliseconds (default: 100)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_query;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;

use crate::db::repository::{
    ErrorContext, RepositoryError, RepositoryResult, StatusRepository, HISTORY_TABLE, STATUS_TABLE,
};
use crate::models::{
    HistoryRecord, NewStatusRecord, Status, StatusField, StatusRecord, StatusSummaryRow,
};

mod models;
mod schema;

use models::*;
use schema::*;

type PgPool = Pool<ConnectionManager<PgConnection>>;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("src/db/repositories/postgres/migrations");

/// Configuration for connecting to Postgres.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub connection_timeout_sec: u64,
    pub idle_timeout_sec: u64,
    /// Maximum number of retry attempts for transient failures
    pub max_retries: u32,
    /// Initial retry delay in milliseconds (doubles with each retry)
    pub retry_delay_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_pool_size: 10,
            min_pool_size: 1,
            connection_timeout_sec: 30,
            idle_timeout_sec: 600,
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl PostgresConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("PG_DATABASE_URL"))
            .map_err(|_| "DATABASE_URL or PG_DATABASE_URL must be set".to_string())?;

        let defaults = Self::default();
        Ok(Self {
            database_url,
            max_pool_size: env_or("PG_POOL_MAX", defaults.max_pool_size),
            min_pool_size: env_or("PG_POOL_MIN", defaults.min_pool_size),
            connection_timeout_sec: env_or("PG_CONN_TIMEOUT_SEC", defaults.connection_timeout_sec),
            idle_timeout_sec: env_or("PG_IDLE_TIMEOUT_SEC", defaults.idle_timeout_sec),
            max_retries: env_or("PG_MAX_RETRIES", defaults.max_retries),
            retry_delay_ms: env_or("PG_RETRY_DELAY_MS", defaults.retry_delay_ms),
        })
    }

    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

/// Pool health statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub connections_in_use: u32,
    pub idle_connections: u32,
    pub total_connections: u32,
    pub max_size: u32,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub retried_operations: u64,
}

/// Diesel-backed status store.
#[derive(Clone, Debug)]
pub struct PostgresRepository {
    pool: PgPool,
    config: PostgresConfig,
    total_queries: Arc<AtomicU64>,
    failed_queries: Arc<AtomicU64>,
    retried_operations: Arc<AtomicU64>,
}

impl PostgresRepository {
    /// Create a new repository and run pending migrations.
    pub fn new(config: PostgresConfig) -> RepositoryResult<Self> {
        let manager = ConnectionManager::<PgConnection>::new(&config.database_url);

        let pool = Pool::builder()
            .max_size(config.max_pool_size)
            .min_idle(Some(config.min_pool_size))
            .connection_timeout(Duration::from_secs(config.connection_timeout_sec))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_sec)))
            .test_on_check_out(true)
            .build(manager)
            .map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("create_pool")
                        .with_details(format!("max_size={}", config.max_pool_size)),
                )
            })?;

        {
            let mut conn = pool.get().map_err(|e| {
                RepositoryError::connection_with_context(
                    e.to_string(),
                    ErrorContext::new("get_connection_for_migrations"),
                )
            })?;
            Self::run_migrations(&mut conn)?;
        }

        Ok(Self {
            pool,
            config,
            total_queries: Arc::new(AtomicU64::new(0)),
            failed_queries: Arc::new(AtomicU64::new(0)),
            retried_operations: Arc::new(AtomicU64::new(0)),
        })
    }

    fn run_migrations(conn: &mut PgConnection) -> RepositoryResult<()> {
        conn.run_pending_migrations(MIGRATIONS).map_err(|e| {
            RepositoryError::internal_with_context(
                format!("Migration failed: {}", e),
                ErrorContext::new("run_migrations"),
            )
        })?;
        Ok(())
    }

    /// Run a blocking Diesel operation on the pool, retrying transient
    /// failures with exponential backoff.
    async fn with_conn<T, F>(&self, f: F) -> RepositoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> RepositoryResult<T> + Send + 'static + Clone,
    {
        let pool = self.pool.clone();
        let max_retries = self.config.max_retries;
        let retry_delay_ms = self.config.retry_delay_ms;
        let total_queries = self.total_queries.clone();
        let failed_queries = self.failed_queries.clone();
        let retried_operations = self.retried_operations.clone();

        task::spawn_blocking(move || {
            let mut last_error = None;
            let mut retry_delay = Duration::from_millis(retry_delay_ms);

            for attempt in 0..=max_retries {
                if attempt > 0 {
                    retried_operations.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(retry_delay);
                    retry_delay *= 2;
                }

                let mut conn = match pool.get() {
                    Ok(c) => c,
                    Err(e) => {
                        let err = RepositoryError::connection_with_context(
                            e.to_string(),
                            ErrorContext::new("get_connection")
                                .with_details(format!("attempt={}", attempt + 1)),
                        );
                        if attempt < max_retries {
                            last_error = Some(err);
                            continue;
                        }
                        failed_queries.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                };

                total_queries.fetch_add(1, Ordering::Relaxed);
                match f.clone()(&mut conn) {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_retryable() && attempt < max_retries => {
                        log::warn!("postgres: retrying after transient error: {}", e);
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => {
                        failed_queries.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                }
            }

            failed_queries.fetch_add(1, Ordering::Relaxed);
            Err(last_error.unwrap_or_else(|| {
                RepositoryError::internal("Max retries exceeded with no error captured")
            }))
        })
        .await
        .map_err(|e| {
            RepositoryError::internal_with_context(
                format!("Task join error: {}", e),
                ErrorContext::new("spawn_blocking"),
            )
        })?
    }

    pub fn get_pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections_in_use: state.connections - state.idle_connections,
            idle_connections: state.idle_connections,
            total_connections: state.connections,
            max_size: self.config.max_pool_size,
            total_queries: self.total_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            retried_operations: self.retried_operations.load(Ordering::Relaxed),
        }
    }

    /// Returns (is_healthy, latency_ms, error_message).
    pub async fn health_check_detailed(&self) -> (bool, Option<u64>, Option<String>) {
        let start = Instant::now();
        let elapsed = || Some(start.elapsed().as_millis() as u64);
        match self.health_check().await {
            Ok(true) => (true, elapsed(), None),
            Ok(false) => (false, elapsed(), Some("Health check returned false".to_string())),
            Err(e) => (false, elapsed(), Some(e.to_string())),
        }
    }
}

fn map_diesel_error(err: diesel::result::Error) -> RepositoryError {
    RepositoryError::from(err)
}

fn load_row(conn: &mut PgConnection, id: i64, operation: &str) -> RepositoryResult<StatusRow> {
    dep_status::table
        .find(id)
        .select(StatusRow::as_select())
        .first::<StatusRow>(conn)
        .optional()
        .map_err(map_diesel_error)?
        .ok_or_else(|| RepositoryError::row_not_found(operation, id))
}

fn update_one(conn: &mut PgConnection, id: i64, field: StatusField) -> QueryResult<usize> {
    use schema::dep_status::dsl as s;
    let target = diesel::update(s::dep_status.find(id));
    match field {
        StatusField::Status(v) => target.set(s::status.eq(v.as_str())).execute(conn),
        StatusField::StatusCode(v) => target.set(s::status_code.eq(v)).execute(conn),
        StatusField::Koaid(v) => target.set(s::koaid.eq(v)).execute(conn),
        StatusField::Ofname(v) => target.set(s::ofname.eq(v)).execute(conn),
        StatusField::StageFile(v) => target.set(s::stage_file.eq(v)).execute(conn),
        StatusField::SemId(v) => target.set(s::semid.eq(v)).execute(conn),
        StatusField::KoaImTyp(v) => target.set(s::koaimtyp.eq(v)).execute(conn),
        StatusField::FilesizeMb(v) => target.set(s::filesize_mb.eq(v)).execute(conn),
        StatusField::ArchsizeMb(v) => target.set(s::archsize_mb.eq(v)).execute(conn),
        StatusField::ProcessDir(v) => target.set(s::process_dir.eq(v)).execute(conn),
        StatusField::UtDateTime(v) => target.set(s::utdatetime.eq(v)).execute(conn),
        StatusField::ProcessStartTime(v) => target.set(s::process_start_time.eq(v)).execute(conn),
        StatusField::ProcessEndTime(v) => target.set(s::process_end_time.eq(v)).execute(conn),
        StatusField::XfrStartTime(v) => target.set(s::xfr_start_time.eq(v)).execute(conn),
        StatusField::XfrEndTime(v) => target.set(s::xfr_end_time.eq(v)).execute(conn),
        StatusField::IpacNotifyTime(v) => target.set(s::ipac_notify_time.eq(v)).execute(conn),
        StatusField::IpacResponseTime(v) => {
            target.set(s::ipac_response_time.eq(v)).execute(conn)
        }
    }
}

fn summary_rows(rows: Vec<(String, i64, Option<String>)>) -> Vec<StatusSummaryRow> {
    rows.into_iter()
        .map(|(instrument, count, status_code)| StatusSummaryRow {
            instrument,
            count,
            status_code,
        })
        .collect()
}

fn status_names(statuses: &[Status]) -> Vec<&'static str> {
    statuses.iter().map(Status::as_str).collect()
}

#[async_trait]
impl StatusRepository for PostgresRepository {
    async fn health_check(&self) -> RepositoryResult<bool> {
        self.with_conn(|conn| {
            sql_query("SELECT 1")
                .execute(conn)
                .map(|_| true)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn insert_status(&self, record: NewStatusRecord) -> RepositoryResult<i64> {
        let row = NewStatusRow::from_record(record);
        self.with_conn(move |conn| {
            diesel::insert_into(dep_status::table)
                .values(&row)
                .returning(dep_status::id)
                .get_result::<i64>(conn)
                .map_err(|e| map_diesel_error(e).with_operation("insert_status"))
        })
        .await
    }

    async fn get_status(&self, id: i64) -> RepositoryResult<StatusRecord> {
        self.with_conn(move |conn| load_row(conn, id, "get_status")?.into_record())
            .await
    }

    async fn update_status_field(&self, id: i64, field: StatusField) -> RepositoryResult<()> {
        let column = field.column();
        self.with_conn(move |conn| {
            let updated = update_one(conn, id, field).map_err(map_diesel_error)?;
            if updated == 0 {
                return Err(RepositoryError::not_found_with_context(
                    format!("status row {} not found", id),
                    ErrorContext::status_row("update_status_field", id)
                        .with_details(format!("column={}", column)),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn begin_transfer(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<bool> {
        self.with_conn(move |conn| {
            let updated = diesel::update(
                dep_status::table
                    .filter(dep_status::id.eq(id))
                    .filter(dep_status::xfr_start_time.is_null()),
            )
            .set((
                dep_status::xfr_start_time.eq(Some(now)),
                dep_status::status.eq(Status::Transferring.as_str()),
            ))
            .execute(conn)
            .map_err(|e| map_diesel_error(e).for_row("begin_transfer", STATUS_TABLE, id))?;
            Ok(updated == 1)
        })
        .await
    }

    async fn find_by_koaid(
        &self,
        instrument: &str,
        level: u8,
        koaid: &str,
    ) -> RepositoryResult<Option<StatusRecord>> {
        let instrument = instrument.to_string();
        let koaid = koaid.to_string();
        self.with_conn(move |conn| {
            dep_status::table
                .filter(dep_status::instrument.eq(&instrument))
                .filter(dep_status::level.eq(i16::from(level)))
                .filter(dep_status::koaid.eq(&koaid))
                .order(dep_status::id.desc())
                .select(StatusRow::as_select())
                .first::<StatusRow>(conn)
                .optional()
                .map_err(|e| map_diesel_error(e).for_row("find_by_koaid", STATUS_TABLE, &koaid))?
                .map(StatusRow::into_record)
                .transpose()
        })
        .await
    }

    async fn find_latest_by_ofname(
        &self,
        instrument: &str,
        level: u8,
        ofname: &str,
    ) -> RepositoryResult<Option<StatusRecord>> {
        let instrument = instrument.to_string();
        let ofname = ofname.to_string();
        self.with_conn(move |conn| {
            dep_status::table
                .filter(dep_status::instrument.eq(&instrument))
                .filter(dep_status::level.eq(i16::from(level)))
                .filter(dep_status::ofname.eq(&ofname))
                .order(dep_status::id.desc())
                .select(StatusRow::as_select())
                .first::<StatusRow>(conn)
                .optional()
                .map_err(map_diesel_error)?
                .map(StatusRow::into_record)
                .transpose()
        })
        .await
    }

    async fn archive_to_history(&self, id: i64, now: DateTime<Utc>) -> RepositoryResult<i64> {
        self.with_conn(move |conn| {
            conn.transaction(|tx| {
                let row = load_row(tx, id, "archive_to_history")?;
                let history_id = diesel::insert_into(dep_status_history::table)
                    .values(&row.to_history(now))
                    .returning(dep_status_history::history_id)
                    .get_result::<i64>(tx)
                    .map_err(|e| {
                        map_diesel_error(e).for_row("archive_to_history", HISTORY_TABLE, id)
                    })?;

                diesel::update(dep_status::table.find(id))
                    .set((
                        dep_status::status.eq(Status::Processing.as_str()),
                        dep_status::status_code.eq(None::<String>),
                        dep_status::filesize_mb.eq(None::<f64>),
                        dep_status::archsize_mb.eq(None::<f64>),
                        dep_status::creation_time.eq(now),
                        dep_status::process_start_time.eq(Some(now)),
                        dep_status::process_end_time.eq(None::<DateTime<Utc>>),
                        dep_status::xfr_start_time.eq(None::<DateTime<Utc>>),
                        dep_status::xfr_end_time.eq(None::<DateTime<Utc>>),
                        dep_status::ipac_notify_time.eq(None::<DateTime<Utc>>),
                        dep_status::ipac_response_time.eq(None::<DateTime<Utc>>),
                    ))
                    .execute(tx)
                    .map_err(|e| {
                        map_diesel_error(e).for_row("archive_to_history", STATUS_TABLE, id)
                    })?;
                Ok(history_id)
            })
        })
        .await
    }

    async fn history_for(&self, id: i64) -> RepositoryResult<Vec<HistoryRecord>> {
        self.with_conn(move |conn| {
            dep_status_history::table
                .filter(dep_status_history::status_id.eq(id))
                .order(dep_status_history::history_id.asc())
                .select(HistoryRow::as_select())
                .load::<HistoryRow>(conn)
                .map_err(map_diesel_error)?
                .into_iter()
                .map(HistoryRow::into_history)
                .collect()
        })
        .await
    }

    async fn next_queued(&self, level: u8) -> RepositoryResult<Option<StatusRecord>> {
        self.with_conn(move |conn| {
            dep_status::table
                .filter(dep_status::level.eq(i16::from(level)))
                .filter(dep_status::status.eq(Status::Queued.as_str()))
                .order((dep_status::creation_time.asc(), dep_status::id.asc()))
                .select(StatusRow::as_select())
                .first::<StatusRow>(conn)
                .optional()
                .map_err(map_diesel_error)?
                .map(StatusRow::into_record)
                .transpose()
        })
        .await
    }

    async fn list_by_status(&self, status: Status) -> RepositoryResult<Vec<StatusRecord>> {
        self.with_conn(move |conn| {
            dep_status::table
                .filter(dep_status::status.eq(status.as_str()))
                .order(dep_status::id.asc())
                .select(StatusRow::as_select())
                .load::<StatusRow>(conn)
                .map_err(map_diesel_error)?
                .into_iter()
                .map(StatusRow::into_record)
                .collect()
        })
        .await
    }

    async fn error_summary(&self) -> RepositoryResult<Vec<StatusSummaryRow>> {
        self.with_conn(|conn| {
            dep_status::table
                .filter(dep_status::status.eq(Status::Error.as_str()))
                .group_by((dep_status::instrument, dep_status::status_code))
                .select((dep_status::instrument, count_star(), dep_status::status_code))
                .order((dep_status::instrument, dep_status::status_code))
                .load::<(String, i64, Option<String>)>(conn)
                .map(summary_rows)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn warning_summary(&self) -> RepositoryResult<Vec<StatusSummaryRow>> {
        self.with_conn(|conn| {
            dep_status::table
                .filter(
                    dep_status::status
                        .eq_any(status_names(&[Status::Complete, Status::Transferred])),
                )
                .filter(dep_status::status_code.is_not_null())
                .filter(dep_status::status_code.ne(""))
                .group_by((dep_status::instrument, dep_status::status_code))
                .select((dep_status::instrument, count_star(), dep_status::status_code))
                .order((dep_status::instrument, dep_status::status_code))
                .load::<(String, i64, Option<String>)>(conn)
                .map(summary_rows)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn stuck_records(
        &self,
        older_than: DateTime<Utc>,
    ) -> RepositoryResult<Vec<StatusSummaryRow>> {
        let in_flight: Vec<Status> = Status::ALL
            .iter()
            .copied()
            .filter(Status::is_in_flight)
            .collect();
        self.with_conn(move |conn| {
            dep_status::table
                .filter(dep_status::status.eq_any(status_names(&in_flight)))
                .filter(dep_status::creation_time.lt(older_than))
                .group_by((dep_status::instrument, dep_status::status))
                .select((dep_status::instrument, count_star(), dep_status::status))
                .order((dep_status::instrument, dep_status::status))
                .load::<(String, i64, String)>(conn)
                .map(|rows| {
                    summary_rows(
                        rows.into_iter()
                            .map(|(instr, count, status)| (instr, count, Some(status)))
                            .collect(),
                    )
                })
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn last_error_notify(&self) -> RepositoryResult<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            dep_error_notify::table
                .select(diesel::dsl::max(dep_error_notify::notify_time))
                .first::<Option<DateTime<Utc>>>(conn)
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn record_error_notify(&self, at: DateTime<Utc>, message: &str) -> RepositoryResult<()> {
        let row = NewErrorNotifyRow {
            notify_time: at,
            message: message.to_string(),
        };
        self.with_conn(move |conn| {
            diesel::insert_into(dep_error_notify::table)
                .values(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn store_header(
        &self,
        instrument: &str,
        koaid: &str,
        header_json: &str,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let row = HeaderRow {
            instrument: instrument.to_string(),
            koaid: koaid.to_string(),
            header: header_json.to_string(),
            archived_at: at,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(dep_headers::table)
                .values(&row)
                .on_conflict((dep_headers::instrument, dep_headers::koaid))
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(map_diesel_error)
        })
        .await
    }

    async fn get_header(&self, instrument: &str, koaid: &str) -> RepositoryResult<Option<String>> {
        let instrument = instrument.to_string();
        let koaid = koaid.to_string();
        self.with_conn(move |conn| {
            dep_headers::table
                .filter(dep_headers::instrument.eq(&instrument))
                .filter(dep_headers::koaid.eq(&koaid))
                .select(dep_headers::header)
                .first::<String>(conn)
                .optional()
                .map_err(map_diesel_error)
        })
        .await
    }
}
