//! Per-item quality gate: URL and content checks, source classification,
//! confidence and relevance scoring, keyword tags.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itm_core::{Candidate, NewItem, SourceType};
use itm_storage::content_fingerprint;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use url::Url;

use crate::config::{ConfidenceThresholds, ConfidenceWeights};
use crate::EngineConfig;

/// Matches the `items.source_url` column constraint.
pub const MAX_SOURCE_URL_CHARS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    UrlMalformed,
    ContentTooShort,
    UntrustedDomain,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::UrlMalformed => "url_malformed",
            Rejection::ContentTooShort => "content_too_short",
            Rejection::UntrustedDomain => "untrusted_domain",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceBand {
    pub fn for_score(score: f64, thresholds: &ConfidenceThresholds) -> Self {
        if score >= thresholds.high {
            ConfidenceBand::High
        } else if score >= thresholds.medium {
            ConfidenceBand::Medium
        } else if score >= thresholds.low {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::VeryLow
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceBand::High => "high",
            ConfidenceBand::Medium => "medium",
            ConfidenceBand::Low => "low",
            ConfidenceBand::VeryLow => "very_low",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub item: NewItem,
    pub band: ConfidenceBand,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceTypeRule {
    pub source_type: SourceType,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagRule {
    pub tag: String,
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceTypeRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<SourceTypeRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TagRule>,
}

/// Classification and tagging tables.
#[derive(Debug, Clone)]
pub struct ClassificationRules {
    pub source_types: Vec<SourceTypeRule>,
    pub tags: Vec<TagRule>,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ClassificationRules {
    pub fn builtin() -> Self {
        let source = |source_type, patterns: &[&str]| SourceTypeRule {
            source_type,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        };
        let tag = |tag: &str, words: &[&str]| TagRule {
            tag: tag.to_string(),
            contains_any: words.iter().map(|w| w.to_string()).collect(),
        };
        Self {
            source_types: vec![
                source(
                    SourceType::News,
                    &["news", "reuters", "bbc", "cnn", "nytimes", "guardian", "wsj"],
                ),
                source(SourceType::Government, &["gov", "europa.eu", "who.int", "un.org"]),
                source(
                    SourceType::SocialMedia,
                    &["twitter", "facebook", "linkedin", "reddit", "youtube"],
                ),
                source(SourceType::Forum, &["forum", "discussion", "community"]),
                source(SourceType::Blog, &["blog", "medium", "substack"]),
            ],
            tags: vec![
                tag(
                    "climate",
                    &["climate", "global warming", "carbon", "emissions", "greenhouse"],
                ),
                tag(
                    "technology",
                    &["ai", "artificial intelligence", "tech", "software", "digital"],
                ),
                tag(
                    "health",
                    &["health", "medical", "healthcare", "pandemic", "vaccine"],
                ),
                tag(
                    "economy",
                    &["economy", "economic", "financial", "market", "recession"],
                ),
                tag(
                    "politics",
                    &["political", "government", "policy", "election", "democracy"],
                ),
                tag(
                    "environment",
                    &["environment", "environmental", "pollution", "sustainability"],
                ),
                tag(
                    "security",
                    &["security", "cybersecurity", "privacy", "data protection"],
                ),
                tag(
                    "education",
                    &["education", "school", "university", "learning", "student"],
                ),
            ],
        }
    }

    /// Load `source_types.yaml` and `tags.yaml` from `dir`. A missing file
    /// keeps the built-in table for that half.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut rules = Self::builtin();
        let source_path = dir.join("source_types.yaml");
        if source_path.exists() {
            let file: SourceTypeRulesFile = serde_yaml::from_str(
                &std::fs::read_to_string(&source_path)
                    .with_context(|| format!("reading {}", source_path.display()))?,
            )
            .with_context(|| format!("parsing {}", source_path.display()))?;
            rules.source_types = file.rules;
        }
        let tags_path = dir.join("tags.yaml");
        if tags_path.exists() {
            let file: TagRulesFile = serde_yaml::from_str(
                &std::fs::read_to_string(&tags_path)
                    .with_context(|| format!("reading {}", tags_path.display()))?,
            )
            .with_context(|| format!("parsing {}", tags_path.display()))?;
            rules.tags = file.rules;
        }
        Ok(rules)
    }
}

struct CompiledTag {
    tag: String,
    matchers: Vec<Regex>,
}

pub struct Validator {
    min_content_length: usize,
    max_content_chars: usize,
    max_title_chars: usize,
    max_tags: usize,
    trusted_domains: Vec<String>,
    reject_untrusted: bool,
    thresholds: ConfidenceThresholds,
    weights: ConfidenceWeights,
    source_patterns: Vec<(String, SourceType)>,
    tags: Vec<CompiledTag>,
    dateline: Regex,
}

impl Validator {
    pub fn new(config: &EngineConfig, rules: ClassificationRules) -> Result<Self> {
        let mut source_patterns = rules
            .source_types
            .into_iter()
            .flat_map(|rule| {
                let source_type = rule.source_type;
                rule.patterns
                    .into_iter()
                    .map(move |p| (p.to_ascii_lowercase(), source_type))
            })
            .collect::<Vec<_>>();
        // Longest first so the first hit is the most specific one.
        source_patterns.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let tags = rules
            .tags
            .into_iter()
            .map(|rule| -> Result<CompiledTag> {
                let matchers = rule
                    .contains_any
                    .iter()
                    .map(|kw| {
                        Regex::new(&format!(r"(?i)\b{}\b", regex::escape(kw.trim())))
                            .with_context(|| format!("compiling keyword `{kw}` for tag {}", rule.tag))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(CompiledTag {
                    tag: rule.tag,
                    matchers,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let dateline = Regex::new(
            r"(?i)\b(\d{4}-\d{2}-\d{2}|(jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{1,2},?\s+\d{4}|\d{1,2}\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{4})\b",
        )
        .context("compiling dateline pattern")?;

        Ok(Self {
            min_content_length: config.min_content_length,
            max_content_chars: config.max_content_chars,
            max_title_chars: config.max_title_chars,
            max_tags: config.max_tags,
            trusted_domains: config
                .trusted_domains
                .iter()
                .map(|d| normalize_domain(d))
                .collect(),
            reject_untrusted: config.reject_untrusted_domains,
            thresholds: config.confidence_thresholds,
            weights: config.confidence_weights,
            source_patterns,
            tags,
            dateline,
        })
    }

    /// Gate and score one candidate. `query` is what was sent upstream and
    /// `topic_query` the topic's template, used for relevance.
    pub fn assess(
        &self,
        candidate: &Candidate,
        query: &str,
        topic_query: &str,
        queried_at: DateTime<Utc>,
    ) -> Result<ScoredItem, Rejection> {
        let (url, domain) = parse_source_url(&candidate.url).ok_or(Rejection::UrlMalformed)?;

        let content = candidate.content.trim();
        if content.chars().count() < self.min_content_length {
            return Err(Rejection::ContentTooShort);
        }

        let trusted = self.is_trusted(&domain);
        if self.reject_untrusted && !trusted {
            return Err(Rejection::UntrustedDomain);
        }

        let source_type = self.classify(&domain, url.path());
        let content = truncate_chars(content, self.max_content_chars);
        let title = truncate_chars(candidate.title.trim(), self.max_title_chars);
        let confidence_score = self.confidence(trusted, source_type, &content);
        let band = ConfidenceBand::for_score(confidence_score, &self.thresholds);
        let tags = self.tags_for(&title, &content);

        let mut metadata = match &candidate.metadata {
            JsonValue::Object(map) => map.clone(),
            JsonValue::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("raw".into(), other.clone());
                map
            }
        };
        metadata.insert("confidence_band".into(), band.as_str().into());
        metadata.insert("trusted_domain".into(), trusted.into());

        Ok(ScoredItem {
            item: NewItem {
                search_query: query.to_string(),
                query_timestamp: queried_at,
                source_url: candidate.url.trim().to_string(),
                source_title: (!title.is_empty()).then_some(title),
                source_domain: Some(domain),
                source_type,
                content_hash: content_fingerprint(&content),
                relevance_score: Some(relevance(topic_query, &content)),
                content,
                full_answer: candidate.full_answer.clone(),
                metadata: JsonValue::Object(metadata),
                confidence_score,
                is_valid: true,
                tags,
            },
            band,
        })
    }

    pub fn classify(&self, domain: &str, path: &str) -> SourceType {
        let haystack = format!("{domain}{}", path.to_ascii_lowercase());
        self.source_patterns
            .iter()
            .find(|(pattern, _)| haystack.contains(pattern.as_str()))
            .map(|(_, source_type)| *source_type)
            .unwrap_or_default()
    }

    pub fn is_trusted(&self, domain: &str) -> bool {
        self.trusted_domains
            .iter()
            .any(|t| domain == t || domain.ends_with(&format!(".{t}")))
    }

    fn confidence(&self, trusted: bool, source_type: SourceType, content: &str) -> f64 {
        let w = &self.weights;
        let trust = if trusted {
            1.0
        } else if source_type != SourceType::Unknown {
            0.5
        } else {
            0.0
        };
        let length = if w.full_length_chars == 0 {
            1.0
        } else {
            (content.chars().count() as f64 / w.full_length_chars as f64).min(1.0)
        };
        let dateline = if self.dateline.is_match(content) { 1.0 } else { 0.0 };
        let score = w.base + w.domain_trust * trust + w.content_length * length + w.dateline * dateline;
        round4(score.clamp(0.0, 1.0))
    }

    fn tags_for(&self, title: &str, content: &str) -> Vec<String> {
        let text = format!("{title} {content}");
        self.tags
            .iter()
            .filter(|t| t.matchers.iter().any(|m| m.is_match(&text)))
            .map(|t| t.tag.clone())
            .take(self.max_tags)
            .collect()
    }
}

/// Lowercase host with a leading `www.` removed.
pub fn normalize_domain(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

fn parse_source_url(raw: &str) -> Option<(Url, String)> {
    let raw = raw.trim();
    if raw.chars().count() > MAX_SOURCE_URL_CHARS {
        return None;
    }
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let domain = normalize_domain(url.host_str()?);
    if domain.is_empty() {
        return None;
    }
    Some((url, domain))
}

/// Share of query terms present in the content, plus a 0.3 floor, capped at 1.
pub fn relevance(query: &str, content: &str) -> f64 {
    let terms = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>();
    if terms.is_empty() {
        return 0.5;
    }
    let content = content.to_lowercase();
    let hits = terms.iter().filter(|t| content.contains(t.as_str())).count();
    round4((hits as f64 / terms.len() as f64 + 0.3).min(1.0))
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn validator(config: &EngineConfig) -> Validator {
        Validator::new(config, ClassificationRules::builtin()).expect("validator")
    }

    fn candidate(url: &str, content: &str) -> Candidate {
        Candidate {
            url: url.into(),
            title: "Report".into(),
            content: content.into(),
            full_answer: None,
            metadata: serde_json::json!({"citation_number": 1}),
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("ts")
    }

    const LONG: &str = "Global carbon emissions rose again last year according to a new report on climate policy and the energy market.";

    #[test]
    fn malformed_and_non_http_urls_are_rejected() {
        let v = validator(&EngineConfig::default());
        for url in ["not a url", "ftp://files.example.com/a", "mailto:a@b.c", "https://"] {
            assert_eq!(
                v.assess(&candidate(url, LONG), "q", "q", at()).err(),
                Some(Rejection::UrlMalformed),
                "{url}"
            );
        }
    }

    #[test]
    fn urls_longer_than_the_column_limit_are_rejected() {
        let v = validator(&EngineConfig::default());
        let base = "https://example.org/";
        let at_limit = format!("{base}{}", "a".repeat(MAX_SOURCE_URL_CHARS - base.len()));
        assert!(v.assess(&candidate(&at_limit, LONG), "q", "q", at()).is_ok());

        let too_long = format!("{base}{}", "a".repeat(3000));
        assert_eq!(
            v.assess(&candidate(&too_long, LONG), "q", "q", at()).err(),
            Some(Rejection::UrlMalformed)
        );
    }

    #[test]
    fn short_content_is_rejected() {
        let v = validator(&EngineConfig::default());
        let result = v.assess(&candidate("https://example.com/a", "  too short  "), "q", "q", at());
        assert_eq!(result.err(), Some(Rejection::ContentTooShort));
    }

    #[test]
    fn untrusted_domains_pass_unless_policy_rejects() {
        let c = candidate("https://random.example/a", LONG);
        assert!(validator(&EngineConfig::default()).assess(&c, "q", "q", at()).is_ok());
        let strict = EngineConfig {
            reject_untrusted_domains: true,
            ..EngineConfig::default()
        };
        assert_eq!(
            validator(&strict).assess(&c, "q", "q", at()).err(),
            Some(Rejection::UntrustedDomain)
        );
        let trusted = candidate("https://www.bbc.com/news/1", LONG);
        assert!(validator(&strict).assess(&trusted, "q", "q", at()).is_ok());
    }

    #[test]
    fn longest_pattern_wins_classification() {
        let v = validator(&EngineConfig::default());
        assert_eq!(v.classify("europa.eu", "/press"), SourceType::Government);
        assert_eq!(v.classify("reuters.com", "/world"), SourceType::News);
        assert_eq!(v.classify("community.example.org", "/blog/x"), SourceType::Forum);
        assert_eq!(v.classify("example.org", "/about"), SourceType::Unknown);
    }

    #[test]
    fn confidence_is_a_deterministic_weighted_sum() {
        let v = validator(&EngineConfig::default());
        let trusted_dated = format!("LONDON, March 1, 2026 - {}", LONG.repeat(5));
        let scored = v
            .assess(&candidate("https://www.reuters.com/a", &trusted_dated), "q", "q", at())
            .expect("accepted");
        assert!((scored.item.confidence_score - 1.0).abs() < 1e-9);
        assert_eq!(scored.band, ConfidenceBand::High);
        assert_eq!(scored.item.source_domain.as_deref(), Some("reuters.com"));

        // Unknown source, no dateline: base plus the partial length signal.
        let scored = v
            .assess(&candidate("https://example.org/a", LONG), "q", "q", at())
            .expect("accepted");
        let expected = round4(0.2 + 0.25 * (LONG.chars().count() as f64 / 500.0));
        assert!((scored.item.confidence_score - expected).abs() < 1e-9);
        assert_eq!(scored.band, ConfidenceBand::Low);
        assert_eq!(scored.item.metadata["confidence_band"], "low");
        assert_eq!(scored.item.metadata["citation_number"], 1);
    }

    #[test]
    fn tags_match_whole_keywords_and_are_capped() {
        let v = validator(&EngineConfig::default());
        let scored = v
            .assess(&candidate("https://example.org/a", LONG), "q", "q", at())
            .expect("accepted");
        assert_eq!(scored.item.tags, vec!["climate", "economy", "politics"]);

        let said = "The minister said the plan was ready and would be announced next week in the capital.";
        let scored = v
            .assess(&candidate("https://example.org/b", said), "q", "q", at())
            .expect("accepted");
        assert!(!scored.item.tags.contains(&"technology".to_string()));

        let capped = EngineConfig {
            max_tags: 1,
            ..EngineConfig::default()
        };
        let scored = validator(&capped)
            .assess(&candidate("https://example.org/a", LONG), "q", "q", at())
            .expect("accepted");
        assert_eq!(scored.item.tags.len(), 1);
    }

    #[test]
    fn relevance_counts_query_terms() {
        assert!((relevance("", "anything") - 0.5).abs() < 1e-9);
        assert!((relevance("carbon emissions", LONG) - 1.0).abs() < 1e-9);
        assert!((relevance("carbon tariffs", LONG) - 0.8).abs() < 1e-9);
        assert!((relevance("volcano", LONG) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn long_content_and_titles_are_truncated() {
        let config = EngineConfig {
            max_content_chars: 60,
            max_title_chars: 5,
            ..EngineConfig::default()
        };
        let mut c = candidate("https://example.org/a", LONG);
        c.title = "A very long headline".into();
        let scored = validator(&config).assess(&c, "q", "q", at()).expect("accepted");
        assert_eq!(scored.item.content.chars().count(), 60);
        assert_eq!(scored.item.source_title.as_deref(), Some("A ver"));
        assert_eq!(scored.item.content_hash, content_fingerprint(&scored.item.content));
    }

    #[test]
    fn rules_load_from_yaml_with_builtin_fallback() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("tags.yaml"),
            "version: 1\nrules:\n  - tag: oceans\n    contains_any: [\"sea level\", coral]\n",
        )
        .expect("write");
        let rules = ClassificationRules::load_dir(dir.path()).expect("rules");
        assert_eq!(rules.tags.len(), 1);
        assert_eq!(rules.source_types.len(), ClassificationRules::builtin().source_types.len());

        let v = Validator::new(&EngineConfig::default(), rules).expect("validator");
        let text = "Rising sea level threatens coral reefs across the Pacific, scientists warned this week.";
        let scored = v
            .assess(&candidate("https://example.org/a", text), "q", "q", at())
            .expect("accepted");
        assert_eq!(scored.item.tags, vec!["oceans"]);
    }
}
