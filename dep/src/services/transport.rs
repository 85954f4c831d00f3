//! Moving a night's products to the archive and asking it to ingest them.

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::TransferSettings;
use crate::models::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer is not configured: {0}")]
    NotConfigured(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("ingest request failed: {0}")]
    Http(String),
    #[error("ingest rejected: {0}")]
    Rejected(String),
}

/// Copies an output directory to the archive host.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transfer(&self, output_dir: &Path, instrument: Instrument) -> Result<(), TransferError>;
}

/// `rsync -av {output_dir} {account}@{server}:{dir}/{INSTR}`
#[derive(Debug, Clone)]
pub struct RsyncTransport {
    account: String,
    server: String,
    dir: String,
    timeout: Duration,
}

impl RsyncTransport {
    pub fn new(
        account: impl Into<String>,
        server: impl Into<String>,
        dir: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            account: account.into(),
            server: server.into(),
            dir: dir.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self::new(
            &settings.account,
            &settings.server,
            &settings.dir,
            Duration::from_secs(settings.timeout_sec),
        )
    }

    /// `account@server:dir/INSTR`
    pub fn destination(&self, instrument: Instrument) -> String {
        format!(
            "{}@{}:{}/{}",
            self.account,
            self.server,
            self.dir.trim_end_matches('/'),
            instrument.name()
        )
    }
}

#[async_trait]
impl Transport for RsyncTransport {
    async fn transfer(&self, output_dir: &Path, instrument: Instrument) -> Result<(), TransferError> {
        if self.account.is_empty() || self.server.is_empty() {
            return Err(TransferError::NotConfigured(
                "transfer account and server are required".to_string(),
            ));
        }
        let destination = self.destination(instrument);
        info!("rsync -av {} {}", output_dir.display(), destination);

        let mut command = Command::new("rsync");
        command.arg("-av").arg(output_dir).arg(&destination).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| TransferError::Timeout(self.timeout))?
            .map_err(|source| TransferError::Spawn {
                program: "rsync".to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(TransferError::Failed {
                program: "rsync".to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!("{}", String::from_utf8_lossy(&output.stdout));
        Ok(())
    }
}

/// Records the directories it was asked to copy. Used in tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    transfers: Mutex<Vec<(PathBuf, Instrument)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfers(&self) -> Vec<(PathBuf, Instrument)> {
        self.transfers.lock().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn transfer(&self, output_dir: &Path, instrument: Instrument) -> Result<(), TransferError> {
        self.transfers
            .lock()
            .push((output_dir.to_path_buf(), instrument));
        Ok(())
    }
}

/// What the archive should ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub instrument: Instrument,
    pub level: u8,
    pub koaid: Option<String>,
    /// Used when there is no KOAID.
    pub utdate: Option<NaiveDate>,
    pub reingest: bool,
}

impl IngestRequest {
    /// Query parameters of the ingest API call.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("instrument", self.instrument.name().to_string()),
            ("ingesttype", format!("lev{}", self.level)),
        ];
        match (&self.koaid, self.utdate) {
            (Some(koaid), _) => query.push(("koaid", koaid.clone())),
            (None, Some(utdate)) => query.push(("utdate", utdate.format("%Y-%m-%d").to_string())),
            (None, None) => {}
        }
        if self.reingest {
            query.push(("reingest", "true".to_string()));
        }
        query
    }
}

#[async_trait]
pub trait IngestNotifier: Send + Sync {
    async fn notify(&self, request: &IngestRequest) -> Result<(), TransferError>;
}

/// GET on the archive ingest API. Success is `{"APIStatus": "COMPLETE"}`.
pub struct HttpIngestNotifier {
    url: String,
    client: Client,
}

impl HttpIngestNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Http(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

/// Accept only `APIStatus == "COMPLETE"`.
pub fn check_ingest_response(body: &Value) -> Result<(), TransferError> {
    match body.get("APIStatus").and_then(Value::as_str) {
        Some("COMPLETE") => Ok(()),
        Some(other) => {
            let message = body
                .get("Message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Err(TransferError::Rejected(format!("{} {}", other, message).trim().to_string()))
        }
        None => Err(TransferError::Rejected("response has no APIStatus".to_string())),
    }
}

#[async_trait]
impl IngestNotifier for HttpIngestNotifier {
    async fn notify(&self, request: &IngestRequest) -> Result<(), TransferError> {
        let query = request.query();
        debug!("Ingest API call: {} {:?}", self.url, query);
        let response = self
            .client
            .get(&self.url)
            .query(&query)
            .send()
            .await
            .map_err(|e| TransferError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransferError::Http(format!(
                "{} returned status {}",
                self.url,
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::Http(e.to_string()))?;
        check_ingest_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_destination() {
        let rsync = RsyncTransport::new("koaadmin", "koa.ipac", "/ingest/", Duration::from_secs(1));
        assert_eq!(
            rsync.destination(Instrument::Hires),
            "koaadmin@koa.ipac:/ingest/HIRES"
        );
    }

    #[test]
    fn test_ingest_query() {
        let request = IngestRequest {
            instrument: Instrument::Kcwi,
            level: 1,
            koaid: None,
            utdate: NaiveDate::from_ymd_opt(2021, 3, 4),
            reingest: true,
        };
        assert_eq!(
            request.query(),
            vec![
                ("instrument", "KCWI".to_string()),
                ("ingesttype", "lev1".to_string()),
                ("utdate", "2021-03-04".to_string()),
                ("reingest", "true".to_string()),
            ]
        );
    }

    #[test]
    fn test_ingest_response() {
        assert!(check_ingest_response(&json!({"APIStatus": "COMPLETE"})).is_ok());
        assert!(matches!(
            check_ingest_response(&json!({"APIStatus": "ERROR", "Message": "bad koaid"})),
            Err(TransferError::Rejected(m)) if m == "ERROR bad koaid"
        ));
        assert!(check_ingest_response(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_rsync_fails_fast() {
        let rsync = RsyncTransport::new("", "", "", Duration::from_secs(1));
        let err = rsync
            .transfer(Path::new("/tmp"), Instrument::Hires)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotConfigured(_)));
    }
}
