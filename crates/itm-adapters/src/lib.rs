//! Upstream search collectors: the capability trait the engine depends on,
//! outcome classification, and the provider/fixture implementations.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itm_core::{Candidate, CandidateBatch, TimeWindow};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod perplexity;

pub use perplexity::{extract_citations, PerplexityCollector, PerplexityConfig};

pub const CRATE_NAME: &str = "itm-adapters";

/// Failure of one upstream call, already classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectError {
    /// Provider asked us to slow down. Never retried in place.
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Timeout, connection failure, 5xx. Worth retrying.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// Bad request, auth failure, missing fixture. Retrying cannot help.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl CollectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectError::Transient(_))
    }
}

/// What the engine asks a provider for: the rendered query plus the window it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectRequest {
    pub run_id: Uuid,
    pub topic_id: Uuid,
    pub topic_name: String,
    pub query: String,
    pub window: Option<TimeWindow>,
}

#[async_trait]
pub trait SearchCollector: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn collect(&self, request: &CollectRequest) -> Result<CandidateBatch, CollectError>;
}

pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> CollectError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        CollectError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        CollectError::Transient(format!("http status {status}"))
    } else {
        CollectError::Permanent(format!("http status {status}"))
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> CollectError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        CollectError::Transient(err.to_string())
    } else if err.is_decode() {
        CollectError::Transient(format!("undecodable response: {err}"))
    } else {
        CollectError::Permanent(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Directory-safe slug for a topic name.
pub fn topic_slug(topic_name: &str) -> String {
    topic_name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Captured provider response replayed by [`FixtureCollector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub topic_name: String,
    pub provider: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub candidates: Vec<Candidate>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline collector: serves `<root>/<topic-slug>/bundle.json` for each request.
#[derive(Debug, Clone)]
pub struct FixtureCollector {
    root: PathBuf,
}

impl FixtureCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bundle_path_for(&self, topic_name: &str) -> PathBuf {
        self.root.join(topic_slug(topic_name)).join("bundle.json")
    }
}

#[async_trait]
impl SearchCollector for FixtureCollector {
    fn provider(&self) -> &'static str {
        "fixture"
    }

    async fn collect(&self, request: &CollectRequest) -> Result<CandidateBatch, CollectError> {
        let path = self.bundle_path_for(&request.topic_name);
        let bundle = load_fixture_bundle(&path)
            .map_err(|e| CollectError::Permanent(format!("{e:#}")))?;
        tracing::debug!(
            topic = %request.topic_name,
            candidates = bundle.candidates.len(),
            path = %path.display(),
            "replaying fixture bundle"
        );
        Ok(CandidateBatch {
            metadata: serde_json::json!({
                "provider": bundle.provider,
                "captured_at": bundle.captured_at,
                "fixture": path.display().to_string(),
            }),
            candidates: bundle.candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_separates_rate_limits() {
        let wait = Some(Duration::from_secs(30));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, wait),
            CollectError::RateLimited { retry_after: wait }
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, None).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, None).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            CollectError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None),
            CollectError::Permanent(_)
        ));
    }

    #[test]
    fn retry_after_accepts_seconds_only() {
        assert_eq!(parse_retry_after(Some(" 45 ")), Some(Duration::from_secs(45)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn slugs_are_directory_safe() {
        assert_eq!(topic_slug("Climate Change News"), "climate-change-news");
        assert_eq!(topic_slug("climate-news"), "climate-news");
        assert_eq!(topic_slug("  AI / Regulation!! "), "ai-regulation");
    }
}
