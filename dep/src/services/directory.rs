//! Program metadata lookups (PI, institution, title, proprietary period) and
//! night sun times.
//!
//! [`ProgramDirectory`] is the collaborator seen by the assigner and the
//! pipeline. [`ApiProgramDirectory`] talks to the observatory web APIs;
//! [`CachingDirectory`] wraps any directory, memoizes answers and turns
//! failures into logged defaults so a lookup never aborts a run.

use async_trait::async_trait;
use chrono::NaiveTime;
use log::{debug, warn};
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::ENG;

/// Proprietary period used when none is on record.
pub const DEFAULT_PROPINT_MONTHS: u32 = 18;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("no {kind} on record for {key}")]
    NotFound { kind: &'static str, key: String },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

/// Sunset, night midpoint and sunrise (UT) for one night.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunTimes {
    pub sunset: NaiveTime,
    pub midpoint: NaiveTime,
    pub sunrise: NaiveTime,
}

#[async_trait]
pub trait ProgramDirectory: Send + Sync {
    async fn lookup_pi(&self, semid: &str) -> Result<String, DirectoryError>;

    async fn lookup_institution(&self, semid: &str) -> Result<String, DirectoryError>;

    async fn lookup_title(&self, semid: &str) -> Result<String, DirectoryError>;

    /// Proprietary period in months for a program on a UT date.
    async fn lookup_proprietary_period(
        &self,
        semid: &str,
        utdate: &str,
    ) -> Result<u32, DirectoryError>;

    async fn lookup_sun_times(&self, utdate: &str) -> Result<SunTimes, DirectoryError>;
}

/// Directory backed by the proposals and metrics web APIs.
pub struct ApiProgramDirectory {
    proposal_api: String,
    sun_api: String,
    client: Client,
}

impl ApiProgramDirectory {
    pub fn new(
        proposal_api: impl Into<String>,
        sun_api: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        Ok(Self {
            proposal_api: proposal_api.into(),
            sun_api: sun_api.into(),
            client,
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, DirectoryError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DirectoryError::Unavailable(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }
        let body: Value = response.json().await.map_err(|e| DirectoryError::Malformed {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        unwrap_envelope(url, body)
    }

    async fn proposal_field(
        &self,
        cmd: &str,
        semid: &str,
        field: &'static str,
    ) -> Result<String, DirectoryError> {
        let data = self
            .get_json(&self.proposal_api, &[("cmd", cmd), ("ktn", semid)])
            .await?;
        data_field(&data, field)
            .map(|v| v.trim().to_string())
            .ok_or_else(|| DirectoryError::NotFound {
                kind: field,
                key: semid.to_string(),
            })
    }
}

/// Accept `{"success": 0|1, "data": {...}}` or a bare object.
fn unwrap_envelope(url: &str, body: Value) -> Result<Value, DirectoryError> {
    let Some(success) = body.get("success") else {
        return Ok(body);
    };
    let ok = match success {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => s == "1",
        _ => false,
    };
    if !ok {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request unsuccessful");
        return Err(DirectoryError::Malformed {
            url: url.to_string(),
            message: message.to_string(),
        });
    }
    body.get("data").cloned().ok_or_else(|| DirectoryError::Malformed {
        url: url.to_string(),
        message: "envelope has no data".to_string(),
    })
}

/// A field as text; arrays use their first element.
fn data_field(data: &Value, field: &str) -> Option<String> {
    let data = match data {
        Value::Array(items) => items.first()?,
        other => other,
    };
    match data.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_sun_time(data: &Value, field: &str, url: &str) -> Result<NaiveTime, DirectoryError> {
    let raw = data_field(data, field).ok_or_else(|| DirectoryError::Malformed {
        url: url.to_string(),
        message: format!("missing {}", field),
    })?;
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
        .map_err(|e| DirectoryError::Malformed {
            url: url.to_string(),
            message: format!("{} '{}': {}", field, raw, e),
        })
}

#[async_trait]
impl ProgramDirectory for ApiProgramDirectory {
    async fn lookup_pi(&self, semid: &str) -> Result<String, DirectoryError> {
        self.proposal_field("getPI", semid, "pi").await
    }

    async fn lookup_institution(&self, semid: &str) -> Result<String, DirectoryError> {
        self.proposal_field("getAllocInst", semid, "institution").await
    }

    async fn lookup_title(&self, semid: &str) -> Result<String, DirectoryError> {
        self.proposal_field("getTitle", semid, "title").await
    }

    async fn lookup_proprietary_period(
        &self,
        semid: &str,
        utdate: &str,
    ) -> Result<u32, DirectoryError> {
        let data = self
            .get_json(
                &self.proposal_api,
                &[("cmd", "getPP"), ("ktn", semid), ("utdate", utdate)],
            )
            .await?;
        let raw = data_field(&data, "propmin").ok_or_else(|| DirectoryError::NotFound {
            kind: "propmin",
            key: semid.to_string(),
        })?;
        raw.trim().parse().map_err(|_| DirectoryError::Malformed {
            url: self.proposal_api.clone(),
            message: format!("propmin '{}' is not a number", raw),
        })
    }

    async fn lookup_sun_times(&self, utdate: &str) -> Result<SunTimes, DirectoryError> {
        let data = self.get_json(&self.sun_api, &[("date", utdate)]).await?;
        Ok(SunTimes {
            sunset: parse_sun_time(&data, "sunset", &self.sun_api)?,
            midpoint: parse_sun_time(&data, "midpoint", &self.sun_api)?,
            sunrise: parse_sun_time(&data, "sunrise", &self.sun_api)?,
        })
    }
}

/// Fixed in-memory answers, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    programs: HashMap<String, (String, String, String)>,
    periods: HashMap<String, u32>,
    sun: HashMap<String, SunTimes>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, semid: &str, pi: &str, institution: &str, title: &str) -> Self {
        self.programs.insert(
            semid.to_string(),
            (pi.to_string(), institution.to_string(), title.to_string()),
        );
        self
    }

    pub fn with_period(mut self, semid: &str, months: u32) -> Self {
        self.periods.insert(semid.to_string(), months);
        self
    }

    pub fn with_sun_times(mut self, utdate: &str, sun: SunTimes) -> Self {
        self.sun.insert(utdate.to_string(), sun);
        self
    }

    fn program(&self, semid: &str, kind: &'static str) -> Result<&(String, String, String), DirectoryError> {
        self.programs.get(semid).ok_or_else(|| DirectoryError::NotFound {
            kind,
            key: semid.to_string(),
        })
    }
}

#[async_trait]
impl ProgramDirectory for StaticDirectory {
    async fn lookup_pi(&self, semid: &str) -> Result<String, DirectoryError> {
        self.program(semid, "pi").map(|p| p.0.clone())
    }

    async fn lookup_institution(&self, semid: &str) -> Result<String, DirectoryError> {
        self.program(semid, "institution").map(|p| p.1.clone())
    }

    async fn lookup_title(&self, semid: &str) -> Result<String, DirectoryError> {
        self.program(semid, "title").map(|p| p.2.clone())
    }

    async fn lookup_proprietary_period(
        &self,
        semid: &str,
        _utdate: &str,
    ) -> Result<u32, DirectoryError> {
        self.periods
            .get(semid)
            .copied()
            .ok_or_else(|| DirectoryError::NotFound {
                kind: "propmin",
                key: semid.to_string(),
            })
    }

    async fn lookup_sun_times(&self, utdate: &str) -> Result<SunTimes, DirectoryError> {
        self.sun
            .get(utdate)
            .copied()
            .ok_or_else(|| DirectoryError::NotFound {
                kind: "sun times",
                key: utdate.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LookupKind {
    Pi,
    Institution,
    Title,
}

impl LookupKind {
    fn name(&self) -> &'static str {
        match self {
            LookupKind::Pi => "PI",
            LookupKind::Institution => "institution",
            LookupKind::Title => "title",
        }
    }
}

#[derive(Default)]
struct DirectoryCache {
    text: HashMap<(LookupKind, String), String>,
    periods: HashMap<(String, String), u32>,
    sun: HashMap<String, Option<SunTimes>>,
}

/// Memoizing, failure-defaulting wrapper around a [`ProgramDirectory`].
///
/// Failed lookups are logged once and their default is cached, so a
/// directory outage costs one timeout per key rather than one per file.
pub struct CachingDirectory<D: ?Sized = dyn ProgramDirectory> {
    inner: Arc<D>,
    cache: RwLock<DirectoryCache>,
}

impl<D: ProgramDirectory + ?Sized> CachingDirectory<D> {
    pub fn new(inner: Arc<D>) -> Self {
        Self {
            inner,
            cache: RwLock::new(DirectoryCache::default()),
        }
    }

    pub async fn pi(&self, semid: &str) -> String {
        self.text(LookupKind::Pi, semid).await
    }

    pub async fn institution(&self, semid: &str) -> String {
        self.text(LookupKind::Institution, semid).await
    }

    pub async fn title(&self, semid: &str) -> String {
        self.text(LookupKind::Title, semid).await
    }

    /// Months; 18 when unknown or for engineering programs.
    pub async fn proprietary_period(&self, semid: &str, utdate: &str) -> u32 {
        if is_engineering_semid(semid) {
            return DEFAULT_PROPINT_MONTHS;
        }
        let key = (semid.to_string(), utdate.to_string());
        if let Some(months) = self.cache.read().periods.get(&key) {
            return *months;
        }
        let months = match self.inner.lookup_proprietary_period(semid, utdate).await {
            Ok(months) => months,
            Err(e) => {
                warn!(
                    "PROPINT not found for {} and {} ({}), defaulting to {} months",
                    semid, utdate, e, DEFAULT_PROPINT_MONTHS
                );
                DEFAULT_PROPINT_MONTHS
            }
        };
        self.cache.write().periods.insert(key, months);
        months
    }

    /// `None` when the sun times cannot be determined.
    pub async fn sun_times(&self, utdate: &str) -> Option<SunTimes> {
        if let Some(cached) = self.cache.read().sun.get(utdate) {
            return *cached;
        }
        let times = match self.inner.lookup_sun_times(utdate).await {
            Ok(times) => Some(times),
            Err(e) => {
                warn!("Could not get sun times for {}: {}", utdate, e);
                None
            }
        };
        self.cache.write().sun.insert(utdate.to_string(), times);
        times
    }

    async fn text(&self, kind: LookupKind, semid: &str) -> String {
        if is_engineering_semid(semid) {
            debug!("Skipping {} lookup for engineering semid {}", kind.name(), semid);
            return String::new();
        }
        let key = (kind, semid.to_string());
        if let Some(value) = self.cache.read().text.get(&key) {
            return value.clone();
        }
        let result = match kind {
            LookupKind::Pi => self.inner.lookup_pi(semid).await,
            LookupKind::Institution => self.inner.lookup_institution(semid).await,
            LookupKind::Title => self.inner.lookup_title(semid).await,
        };
        let value = result.unwrap_or_else(|e| {
            warn!("Could not get {} for {}: {}", kind.name(), semid, e);
            String::new()
        });
        self.cache.write().text.insert(key, value.clone());
        value
    }
}

impl CachingDirectory {
    /// Type-erased wrapper, the form shared by the assigner and pipeline.
    pub fn from_directory<D: ProgramDirectory + 'static>(inner: D) -> Self {
        Self::new(Arc::new(inner))
    }
}

fn is_engineering_semid(semid: &str) -> bool {
    semid
        .rsplit('_')
        .next()
        .is_some_and(|progid| progid.eq_ignore_ascii_case(ENG))
}

/// Split a title into the 50-character `PROGTL1..3` card values.
pub fn split_title(title: &str) -> [String; 3] {
    let chars: Vec<char> = title.chars().collect();
    let part = |idx: usize| -> String {
        chars
            .iter()
            .skip(idx * 50)
            .take(50)
            .collect::<String>()
    };
    [part(0), part(1), part(2)]
}
