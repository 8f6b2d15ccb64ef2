use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use itm_core::FrequencyTable;
use thiserror::Error;

/// Startup configuration problems. Any of these stops the process.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse `{value}`")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: String },
    #[error("confidence thresholds must satisfy 0 <= low <= medium <= high <= 1 (got {low}/{medium}/{high})")]
    ThresholdOrder { low: f64, medium: f64, high: f64 },
}

pub const DEFAULT_TRUSTED_DOMAINS: &[&str] = &[
    "reuters.com",
    "bbc.com",
    "cnn.com",
    "nytimes.com",
    "washingtonpost.com",
    "guardian.com",
    "wsj.com",
    "bloomberg.com",
    "ap.org",
    "npr.org",
    "gov.uk",
    "gov.au",
    "gov.ca",
    "europa.eu",
    "who.int",
    "un.org",
];

/// Weighted combination used for `confidence_score`. The weights of the
/// three signals plus `base` should add up to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceWeights {
    pub base: f64,
    pub domain_trust: f64,
    pub content_length: f64,
    pub dateline: f64,
    /// Content length at which the length signal saturates.
    pub full_length_chars: usize,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            base: 0.2,
            domain_trust: 0.4,
            content_length: 0.25,
            dateline: 0.15,
            full_length_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceThresholds {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            high: 0.8,
            medium: 0.5,
            low: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(16),
        }
    }
}

/// Everything the engine reads at startup. Built once and shared by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_queries_per_minute: u32,
    pub max_queries_per_day: u32,
    /// Minimum spacing between two upstream calls.
    pub query_delay: Duration,
    /// Longest the engine sleeps for a budget permit before giving up on the tick.
    pub max_budget_wait: Duration,
    /// Reference zone for the daily budget reset, as hours east of UTC.
    pub budget_utc_offset_hours: i32,

    pub initial_collection_days: u32,
    pub incremental_collection_hours: u32,
    pub max_collection_gap_hours: u32,
    pub enable_time_bounded_queries: bool,
    pub initial_query_suffix: String,
    pub since_query_prefix: String,

    pub enable_duplicate_prevention: bool,
    pub reject_content_duplicates: bool,

    pub min_content_length: usize,
    pub max_content_chars: usize,
    pub max_title_chars: usize,
    pub max_tags: usize,
    pub trusted_domains: Vec<String>,
    pub reject_untrusted_domains: bool,
    pub confidence_thresholds: ConfidenceThresholds,
    pub confidence_weights: ConfidenceWeights,
    pub rules_dir: PathBuf,

    pub frequencies: FrequencyTable,
    pub breaker_failure_threshold: u32,
    /// `None` means a topic's own check frequency is its cooldown.
    pub breaker_cooldown: Option<Duration>,
    pub retry: RetryConfig,

    pub max_topics_per_tick: usize,
    pub max_posts_per_collection: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queries_per_minute: 10,
            max_queries_per_day: 1000,
            query_delay: Duration::from_secs(6),
            max_budget_wait: Duration::from_secs(60),
            budget_utc_offset_hours: 0,
            initial_collection_days: 7,
            incremental_collection_hours: 24,
            max_collection_gap_hours: 48,
            enable_time_bounded_queries: true,
            initial_query_suffix: " latest news".to_string(),
            since_query_prefix: " since ".to_string(),
            enable_duplicate_prevention: true,
            reject_content_duplicates: false,
            min_content_length: 50,
            max_content_chars: 10_000,
            max_title_chars: 500,
            max_tags: 10,
            trusted_domains: DEFAULT_TRUSTED_DOMAINS.iter().map(|d| d.to_string()).collect(),
            reject_untrusted_domains: false,
            confidence_thresholds: ConfidenceThresholds::default(),
            confidence_weights: ConfidenceWeights::default(),
            rules_dir: PathBuf::from("rules"),
            frequencies: FrequencyTable::default(),
            breaker_failure_threshold: 3,
            breaker_cooldown: None,
            retry: RetryConfig::default(),
            max_topics_per_tick: 10,
            max_posts_per_collection: 50,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let trusted_domains = match get("TRUSTED_DOMAINS") {
            Some(raw) => raw
                .split(',')
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            None => d.trusted_domains,
        };

        let config = Self {
            max_queries_per_minute: parse_or(&get, "MAX_QUERIES_PER_MINUTE", d.max_queries_per_minute)?,
            max_queries_per_day: parse_or(&get, "MAX_QUERIES_PER_DAY", d.max_queries_per_day)?,
            query_delay: seconds_or(&get, "QUERY_DELAY_SECONDS", d.query_delay)?,
            max_budget_wait: seconds_or(&get, "MAX_BUDGET_WAIT_SECONDS", d.max_budget_wait)?,
            budget_utc_offset_hours: parse_or(&get, "BUDGET_UTC_OFFSET_HOURS", d.budget_utc_offset_hours)?,
            initial_collection_days: parse_or(&get, "INITIAL_COLLECTION_DAYS", d.initial_collection_days)?,
            incremental_collection_hours: parse_or(
                &get,
                "INCREMENTAL_COLLECTION_HOURS",
                d.incremental_collection_hours,
            )?,
            max_collection_gap_hours: parse_or(&get, "MAX_COLLECTION_GAP_HOURS", d.max_collection_gap_hours)?,
            enable_time_bounded_queries: flag_or(
                &get,
                "ENABLE_TIME_BOUNDED_QUERIES",
                d.enable_time_bounded_queries,
            )?,
            enable_duplicate_prevention: flag_or(
                &get,
                "ENABLE_DUPLICATE_PREVENTION",
                d.enable_duplicate_prevention,
            )?,
            reject_content_duplicates: flag_or(&get, "REJECT_CONTENT_DUPLICATES", d.reject_content_duplicates)?,
            min_content_length: parse_or(&get, "MIN_CONTENT_LENGTH", d.min_content_length)?,
            trusted_domains,
            reject_untrusted_domains: flag_or(&get, "REJECT_UNTRUSTED_DOMAINS", d.reject_untrusted_domains)?,
            confidence_thresholds: ConfidenceThresholds {
                high: parse_or(&get, "HIGH_CONFIDENCE_THRESHOLD", d.confidence_thresholds.high)?,
                medium: parse_or(&get, "MEDIUM_CONFIDENCE_THRESHOLD", d.confidence_thresholds.medium)?,
                low: parse_or(&get, "LOW_CONFIDENCE_THRESHOLD", d.confidence_thresholds.low)?,
            },
            rules_dir: get("ITM_RULES_DIR").map(PathBuf::from).unwrap_or(d.rules_dir),
            frequencies: FrequencyTable {
                critical_hours: parse_or(
                    &get,
                    "CRITICAL_PRIORITY_FREQUENCY_HOURS",
                    d.frequencies.critical_hours,
                )?,
                normal_hours: parse_or(&get, "NORMAL_PRIORITY_FREQUENCY_HOURS", d.frequencies.normal_hours)?,
                low_hours: parse_or(&get, "LOW_PRIORITY_FREQUENCY_HOURS", d.frequencies.low_hours)?,
            },
            breaker_failure_threshold: parse_or(
                &get,
                "BREAKER_FAILURE_THRESHOLD",
                d.breaker_failure_threshold,
            )?,
            breaker_cooldown: get("BREAKER_COOLDOWN_HOURS")
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(|h| Duration::from_secs(h * 3600))
                        .map_err(|_| ConfigError::InvalidValue {
                            key: "BREAKER_COOLDOWN_HOURS",
                            value: raw,
                        })
                })
                .transpose()?,
            max_topics_per_tick: parse_or(&get, "MAX_TOPICS_PER_TICK", d.max_topics_per_tick)?,
            max_posts_per_collection: parse_or(&get, "MAX_POSTS_PER_COLLECTION", d.max_posts_per_collection)?,
            ..d
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("MAX_QUERIES_PER_MINUTE", u64::from(self.max_queries_per_minute))?;
        non_zero("MAX_QUERIES_PER_DAY", u64::from(self.max_queries_per_day))?;
        if self.max_queries_per_minute > self.max_queries_per_day {
            return Err(ConfigError::OutOfRange {
                key: "MAX_QUERIES_PER_MINUTE",
                reason: "must not exceed MAX_QUERIES_PER_DAY".into(),
            });
        }
        non_zero("INITIAL_COLLECTION_DAYS", u64::from(self.initial_collection_days))?;
        non_zero("INCREMENTAL_COLLECTION_HOURS", u64::from(self.incremental_collection_hours))?;
        non_zero("MAX_COLLECTION_GAP_HOURS", u64::from(self.max_collection_gap_hours))?;
        non_zero("BREAKER_FAILURE_THRESHOLD", u64::from(self.breaker_failure_threshold))?;
        non_zero("MAX_TOPICS_PER_TICK", self.max_topics_per_tick as u64)?;
        non_zero("MAX_POSTS_PER_COLLECTION", self.max_posts_per_collection as u64)?;
        non_zero("retry attempts", u64::from(self.retry.max_attempts))?;
        for (key, hours) in [
            ("CRITICAL_PRIORITY_FREQUENCY_HOURS", self.frequencies.critical_hours),
            ("NORMAL_PRIORITY_FREQUENCY_HOURS", self.frequencies.normal_hours),
            ("LOW_PRIORITY_FREQUENCY_HOURS", self.frequencies.low_hours),
        ] {
            if hours == 0 || hours > itm_core::MAX_CHECK_FREQUENCY_HOURS {
                return Err(ConfigError::OutOfRange {
                    key,
                    reason: format!("must be 1..={} hours", itm_core::MAX_CHECK_FREQUENCY_HOURS),
                });
            }
        }
        if self.utc_offset().is_none() {
            return Err(ConfigError::OutOfRange {
                key: "BUDGET_UTC_OFFSET_HOURS",
                reason: "must be within -23..=23".into(),
            });
        }
        let t = self.confidence_thresholds;
        let ordered = 0.0 <= t.low && t.low <= t.medium && t.medium <= t.high && t.high <= 1.0;
        if !ordered {
            return Err(ConfigError::ThresholdOrder {
                low: t.low,
                medium: t.medium,
                high: t.high,
            });
        }
        Ok(())
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.budget_utc_offset_hours.checked_mul(3600)?)
    }
}

fn non_zero(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::OutOfRange {
            key,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn seconds_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn flag_or<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
    }
}
