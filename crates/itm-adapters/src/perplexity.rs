use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itm_core::{Candidate, CandidateBatch};
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    classify_reqwest_error, classify_status, parse_retry_after, CollectError, CollectRequest,
    SearchCollector,
};

const MAX_SNIPPET_CHARS: usize = 500;
const MAX_BARE_URLS: usize = 10;

#[derive(Debug, Clone)]
pub struct PerplexityConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f64,
    pub user_agent: Option<String>,
}

impl Default for PerplexityConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.perplexity.ai/chat/completions".to_string(),
            model: "sonar".to_string(),
            timeout: Duration::from_secs(30),
            max_tokens: 4000,
            temperature: 0.1,
            user_agent: Some("itm-collector/0.1".to_string()),
        }
    }
}

impl PerplexityConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("PERPLEXITY_API_KEY").unwrap_or_default(),
            base_url: std::env::var("PERPLEXITY_BASE_URL").unwrap_or(defaults.base_url),
            model: std::env::var("PERPLEXITY_MODEL").unwrap_or(defaults.model),
            timeout: std::env::var("PERPLEXITY_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            ..defaults
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Debug)]
pub struct PerplexityCollector {
    client: reqwest::Client,
    config: PerplexityConfig,
}

impl PerplexityCollector {
    pub fn new(config: PerplexityConfig) -> anyhow::Result<Self> {
        if !config.is_configured() {
            anyhow::bail!("PERPLEXITY_API_KEY is not set");
        }
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn request_body(&self, request: &CollectRequest) -> JsonValue {
        let mut body = json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": format!(
                    "Find recent news and articles about: {}. Provide citations with URLs, \
                     titles, and brief summaries. Focus on credible sources.",
                    request.query
                ),
            }],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": 0.9,
        });
        if let Some(window) = &request.window {
            body["search_after_date_filter"] =
                JsonValue::String(window.start.format("%-m/%-d/%Y").to_string());
        }
        body
    }
}

#[async_trait]
impl SearchCollector for PerplexityCollector {
    fn provider(&self) -> &'static str {
        "perplexity"
    }

    async fn collect(&self, request: &CollectRequest) -> Result<CandidateBatch, CollectError> {
        let span = info_span!("perplexity_request", run_id = %request.run_id, topic = %request.topic_name);
        async {
            info!(query = %request.query, "calling search provider");
            let resp = self
                .client
                .post(&self.config.base_url)
                .bearer_auth(&self.config.api_key)
                .json(&self.request_body(request))
                .send()
                .await
                .map_err(|e| classify_reqwest_error(&e))?;

            let status = resp.status();
            if !status.is_success() {
                let retry_after = parse_retry_after(
                    resp.headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok()),
                );
                let err = classify_status(status, retry_after);
                warn!(%status, error = %err, "search provider returned an error status");
                return Err(err);
            }

            let payload: JsonValue = resp.json().await.map_err(|e| classify_reqwest_error(&e))?;
            let candidates = extract_citations(&payload, Utc::now());
            info!(citations = candidates.len(), "extracted citations");
            Ok::<_, CollectError>(CandidateBatch {
                metadata: json!({
                    "provider": "perplexity",
                    "model": payload.get("model").cloned().unwrap_or(JsonValue::Null),
                    "response_id": payload.get("id").cloned().unwrap_or(JsonValue::Null),
                    "usage": payload.get("usage").cloned().unwrap_or(JsonValue::Null),
                }),
                candidates,
            })
        }
        .instrument(span)
        .await
    }
}

fn url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s\)\]"'<>]+"#).ok())
        .as_ref()
}

fn numbered_citation_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]\s*([^\[]+)").ok())
        .as_ref()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn trim_url(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':'])
}

/// Sentences of the answer that cite `[n]`.
fn sentences_citing(answer: &str, n: usize) -> String {
    let marker = format!("[{n}]");
    answer
        .split_inclusive(['.', '!', '?', '\n'])
        .filter(|s| s.contains(&marker))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" ")
}

fn citation_metadata(number: usize, collected_at: DateTime<Utc>, extra: JsonValue) -> JsonValue {
    let mut meta = json!({
        "citation_number": number,
        "source": "perplexity",
        "collected_at": collected_at.to_rfc3339(),
    });
    if let (Some(target), JsonValue::Object(extra)) = (meta.as_object_mut(), extra) {
        target.extend(extra);
    }
    meta
}

/// Turn a chat-completions payload into ordered candidates. Structured
/// `search_results` win, then the `citations` URL list, then citations
/// scraped out of the answer text.
pub fn extract_citations(payload: &JsonValue, collected_at: DateTime<Utc>) -> Vec<Candidate> {
    let answer = payload
        .pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    let full_answer = (!answer.is_empty()).then(|| answer.to_string());

    if let Some(results) = payload.get("search_results").and_then(JsonValue::as_array) {
        let out = results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                let url = r.get("url")?.as_str()?.trim().to_string();
                let title = r
                    .get("title")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                let snippet = r
                    .get("snippet")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| sentences_citing(answer, i + 1));
                let date = r.get("date").cloned().unwrap_or(JsonValue::Null);
                Some(Candidate {
                    url,
                    title,
                    content: truncate_chars(&snippet, MAX_SNIPPET_CHARS * 4),
                    full_answer: full_answer.clone(),
                    metadata: citation_metadata(i + 1, collected_at, json!({ "published": date })),
                })
            })
            .collect::<Vec<_>>();
        if !out.is_empty() {
            return out;
        }
    }

    if let Some(urls) = payload.get("citations").and_then(JsonValue::as_array) {
        let out = urls
            .iter()
            .enumerate()
            .filter_map(|(i, u)| {
                let url = u.as_str()?.trim().to_string();
                let cited = sentences_citing(answer, i + 1);
                let content = if cited.is_empty() {
                    truncate_chars(answer, MAX_SNIPPET_CHARS)
                } else {
                    cited
                };
                Some(Candidate {
                    url,
                    title: format!("Source {}", i + 1),
                    content,
                    full_answer: full_answer.clone(),
                    metadata: citation_metadata(i + 1, collected_at, JsonValue::Null),
                })
            })
            .collect::<Vec<_>>();
        if !out.is_empty() {
            return out;
        }
    }

    let (Some(url_re), Some(numbered_re)) = (url_regex(), numbered_citation_regex()) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for caps in numbered_re.captures_iter(answer) {
        let text = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let Some(url) = url_re.find(text).map(|m| trim_url(m.as_str())) else {
            continue;
        };
        let number = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(out.len() + 1);
        let title = text.replace(url, "").trim().trim_end_matches(['-', ':']).trim().to_string();
        out.push(Candidate {
            url: url.to_string(),
            title: if title.is_empty() {
                format!("Citation {number}")
            } else {
                title
            },
            content: truncate_chars(text, MAX_SNIPPET_CHARS),
            full_answer: full_answer.clone(),
            metadata: citation_metadata(number, collected_at, JsonValue::Null),
        });
    }
    if !out.is_empty() {
        return out;
    }

    let mut seen = HashSet::new();
    for (i, m) in url_re
        .find_iter(answer)
        .filter(|m| seen.insert(trim_url(m.as_str()).to_string()))
        .take(MAX_BARE_URLS)
        .enumerate()
    {
        let url = trim_url(m.as_str());
        // Up to 100 characters of context on either side of the link.
        let start = answer[..m.start()]
            .char_indices()
            .rev()
            .nth(99)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        let end = answer[m.end()..]
            .char_indices()
            .nth(100)
            .map(|(idx, _)| m.end() + idx)
            .unwrap_or(answer.len());
        out.push(Candidate {
            url: url.to_string(),
            title: format!("Source {}", i + 1),
            content: answer[start..end].to_string(),
            full_answer: full_answer.clone(),
            metadata: citation_metadata(i + 1, collected_at, JsonValue::Null),
        });
    }
    out
}
