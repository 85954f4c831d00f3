//! Per-run log context.
//!
//! A run starts under a generated label and is rebound to its KOAID once the
//! identifier is known. Entries are buffered until a log file is attached,
//! then appended to it as they arrive.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Invalid,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Invalid => "invalid",
        }
    }
}

/// A single log entry with timestamp and message.
///
/// `code` is set only on entries that feed the final status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub code: Option<String>,
    pub message: String,
}

impl LogEntry {
    fn line(&self, label: &str) -> String {
        let code = self
            .code
            .as_deref()
            .map(|c| format!(" [{}]", c))
            .unwrap_or_default();
        format!(
            "{} {} {}{}: {}\n",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            label,
            self.level.as_str().to_uppercase(),
            code,
            self.message
        )
    }
}

#[derive(Debug)]
pub struct RunLog {
    run_id: Uuid,
    label: String,
    entries: Vec<LogEntry>,
    sink: Option<PathBuf>,
}

impl RunLog {
    pub fn new(instrument: &str) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            label: format!("{}:{}", instrument, run_id.simple()),
            entries: Vec::new(),
            sink: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.sink.as_deref()
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, None, message.into());
    }

    /// A warning that does not affect the final status.
    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warning, None, message.into());
    }

    /// A warning whose code is reported in `status_code`.
    pub fn warn_code(&mut self, code: &str, message: impl Into<String>) {
        self.push(LogLevel::Warning, Some(code.to_string()), message.into());
    }

    pub fn error(&mut self, code: &str, message: impl Into<String>) {
        self.push(LogLevel::Error, Some(code.to_string()), message.into());
    }

    pub fn invalid(&mut self, code: &str, message: impl Into<String>) {
        self.push(LogLevel::Invalid, Some(code.to_string()), message.into());
    }

    /// Code of the most recent status entry at `level`.
    pub fn last_code(&self, level: LogLevel) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.level == level)
            .find_map(|e| e.code.as_deref())
    }

    pub fn has_code(&self, level: LogLevel) -> bool {
        self.last_code(level).is_some()
    }

    /// Switch to the KOAID label.
    pub fn rebind(&mut self, label: &str) {
        info!("[{}] Log rebound to {}", self.label, label);
        self.label = label.to_string();
    }

    /// Append every buffered entry to `path`; later entries follow as they
    /// arrive.
    pub fn attach(&mut self, path: PathBuf) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        for entry in &self.entries {
            file.write_all(entry.line(&self.label).as_bytes())?;
        }
        self.sink = Some(path);
        Ok(())
    }

    fn push(&mut self, level: LogLevel, code: Option<String>, message: String) {
        match level {
            LogLevel::Info => info!("[{}] {}", self.label, message),
            LogLevel::Warning => warn!("[{}] {}", self.label, message),
            LogLevel::Error | LogLevel::Invalid => error!("[{}] {}", self.label, message),
        }
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            code,
            message,
        };
        if let Some(path) = &self.sink {
            let appended = OpenOptions::new()
                .append(true)
                .open(path)
                .and_then(|mut f| f.write_all(entry.line(&self.label).as_bytes()));
            if let Err(e) = appended {
                warn!("[{}] Could not append to {}: {}", self.label, path.display(), e);
            }
        }
        self.entries.push(entry);
    }
}
