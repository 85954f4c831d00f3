//! Periodic error digest.
//!
//! Summarises ERROR rows, warned rows and rows stuck in flight, and hands
//! the report to a [`Notifier`] at most once per `min_interval`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::DigestSettings;
use crate::db::{RepositoryError, StatusRepository};
use crate::models::StatusSummaryRow;

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("notification failed: {0}")]
    Notify(String),
}

/// Delivers a digest to the people on call.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), DigestError>;
}

/// Writes the digest to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<(), DigestError> {
        warn!("{}{}", subject, body);
        Ok(())
    }
}

/// Keeps every digest in memory.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<(), DigestError> {
        self.sent.lock().push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestOutcome {
    /// A digest went out at `last`, too recently to send another.
    Throttled { last: DateTime<Utc> },
    NothingToReport,
    Sent { body: String },
}

pub struct ErrorDigest {
    repo: Arc<dyn StatusRepository>,
    notifier: Arc<dyn Notifier>,
    min_interval: Duration,
    stuck_after: Duration,
}

impl ErrorDigest {
    pub fn new(repo: Arc<dyn StatusRepository>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            repo,
            notifier,
            min_interval: Duration::hours(2),
            stuck_after: Duration::minutes(15),
        }
    }

    pub fn from_settings(
        repo: Arc<dyn StatusRepository>,
        notifier: Arc<dyn Notifier>,
        settings: &DigestSettings,
    ) -> Self {
        Self::new(repo, notifier)
            .with_min_interval(Duration::seconds(settings.min_notify_interval_sec as i64))
            .with_stuck_after(Duration::seconds(settings.stuck_after_sec as i64))
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_stuck_after(mut self, stuck_after: Duration) -> Self {
        self.stuck_after = stuck_after;
        self
    }

    /// Report body, or `None` when there are no errors and nothing is stuck.
    ///
    /// Warnings only ride along with an error or stuck report.
    pub async fn build_report(&self, now: DateTime<Utc>) -> Result<Option<String>, DigestError> {
        let errors = self.repo.error_summary().await?;
        let stuck = self.repo.stuck_records(now - self.stuck_after).await?;
        if errors.is_empty() && stuck.is_empty() {
            return Ok(None);
        }
        let warnings = self.repo.warning_summary().await?;

        let mut body = String::new();
        for (name, rows) in [("Error", &errors), ("Warning", &warnings), ("Stuck", &stuck)] {
            if !rows.is_empty() {
                body.push_str(&format_section(name, rows));
            }
        }
        Ok(Some(body))
    }

    /// Send a digest unless one went out within `min_interval`.
    pub async fn run_digest(&self, now: DateTime<Utc>) -> Result<DigestOutcome, DigestError> {
        if let Some(last) = self.repo.last_error_notify().await? {
            if now - last < self.min_interval {
                info!("Last error digest sent at {}, skipping", last);
                return Ok(DigestOutcome::Throttled { last });
            }
        }

        let Some(body) = self.build_report(now).await? else {
            return Ok(DigestOutcome::NothingToReport);
        };
        let subject = format!("DEP error digest {}", now.format("%Y-%m-%d %H:%M:%S"));
        self.notifier.send(&subject, &body).await?;
        self.repo.record_error_notify(now, &body).await?;
        Ok(DigestOutcome::Sent { body })
    }
}

/// `===DEP {name} summary:===` followed by one padded line per row.
pub fn format_section(name: &str, rows: &[StatusSummaryRow]) -> String {
    let mut section = format!("\n===DEP {} summary:===\n", name);
    for row in rows {
        let _ = writeln!(
            section,
            "{:<12}{:<6}{}",
            row.instrument,
            row.count,
            row.status_code.as_deref().unwrap_or("")
        );
    }
    section
}
