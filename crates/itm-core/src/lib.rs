//! Core domain model for ITM: monitored topics, collected items and the
//! append-only collection run audit trail.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "itm-core";

pub const MAX_TOPIC_NAME_LENGTH: usize = 255;
pub const MAX_QUERY_LENGTH: usize = 1000;
pub const MAX_CHECK_FREQUENCY_HOURS: u32 = 168;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic name must be 1..={} characters", MAX_TOPIC_NAME_LENGTH)]
    InvalidName,
    #[error("search query must be 1..={} characters", MAX_QUERY_LENGTH)]
    InvalidQuery,
    #[error("check frequency must be 1..={max} hours, got {0}", max = MAX_CHECK_FREQUENCY_HOURS)]
    InvalidFrequency(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Collection priority of a topic. Lower rank is served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Normal, Priority::Low];

    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "priority",
                value: s.to_string(),
            })
    }
}

/// Fixed check frequency per priority, used when a topic has no explicit override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyTable {
    pub critical_hours: u32,
    pub normal_hours: u32,
    pub low_hours: u32,
}

impl Default for FrequencyTable {
    fn default() -> Self {
        Self {
            critical_hours: 6,
            normal_hours: 24,
            low_hours: 72,
        }
    }
}

impl FrequencyTable {
    pub fn hours_for(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical => self.critical_hours,
            Priority::Normal => self.normal_hours,
            Priority::Low => self.low_hours,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: Uuid,
    pub topic_name: String,
    pub search_query: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub active: bool,
    pub priority: Priority,
    /// Explicit override of the priority frequency.
    pub check_frequency_hours: Option<u32>,
    pub last_checked: Option<DateTime<Utc>>,
    pub query_version: u32,
    pub version: u32,
    pub total_posts_collected: u64,
    pub avg_posts_per_query: f64,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Topic {
    pub fn frequency(&self, table: &FrequencyTable) -> Duration {
        let hours = self
            .check_frequency_hours
            .unwrap_or_else(|| table.hours_for(self.priority));
        Duration::hours(i64::from(hours))
    }

    /// A topic is due when it is active and was never checked or its frequency has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>, table: &FrequencyTable) -> bool {
        if !self.active {
            return false;
        }
        match self.last_checked {
            None => true,
            Some(last) => now - last >= self.frequency(table),
        }
    }
}

/// Topic-management input, also the shape of entries in `topics.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTopic {
    pub topic_name: String,
    pub search_query: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub check_frequency_hours: Option<u32>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl NewTopic {
    pub fn new(topic_name: impl Into<String>, search_query: impl Into<String>) -> Self {
        Self {
            topic_name: topic_name.into(),
            search_query: search_query.into(),
            description: None,
            category: None,
            priority: Priority::Normal,
            check_frequency_hours: None,
            active: true,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<(), TopicError> {
        let name = self.topic_name.trim();
        if name.is_empty() || name.chars().count() > MAX_TOPIC_NAME_LENGTH {
            return Err(TopicError::InvalidName);
        }
        let query = self.search_query.trim();
        if query.is_empty() || query.chars().count() > MAX_QUERY_LENGTH {
            return Err(TopicError::InvalidQuery);
        }
        if let Some(hours) = self.check_frequency_hours {
            if hours == 0 || hours > MAX_CHECK_FREQUENCY_HOURS {
                return Err(TopicError::InvalidFrequency(hours));
            }
        }
        Ok(())
    }

    pub fn into_topic(self, id: Uuid, now: DateTime<Utc>) -> Topic {
        Topic {
            id,
            topic_name: self.topic_name,
            search_query: self.search_query,
            description: self.description,
            category: self.category,
            active: self.active,
            priority: self.priority,
            check_frequency_hours: self.check_frequency_hours,
            last_checked: None,
            query_version: 1,
            version: 1,
            total_posts_collected: 0,
            avg_posts_per_query: 0.0,
            run_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields the scheduler writes back after a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicStateUpdate {
    pub last_checked: DateTime<Utc>,
    pub total_posts_collected: u64,
    pub avg_posts_per_query: f64,
    pub run_count: u64,
    pub version: u32,
}

impl TopicStateUpdate {
    /// Fold one successful run into the topic's running totals.
    pub fn after_run(topic: &Topic, checked_at: DateTime<Utc>, new_posts: u32) -> Self {
        let total_posts_collected = topic.total_posts_collected + u64::from(new_posts);
        let run_count = topic.run_count + 1;
        Self {
            last_checked: checked_at,
            total_posts_collected,
            avg_posts_per_query: total_posts_collected as f64 / run_count as f64,
            run_count,
            version: topic.version.saturating_add(1),
        }
    }

    pub fn apply_to(&self, topic: &mut Topic) {
        topic.last_checked = Some(self.last_checked);
        topic.total_posts_collected = self.total_posts_collected;
        topic.avg_posts_per_query = self.avg_posts_per_query;
        topic.run_count = self.run_count;
        topic.version = self.version;
        topic.updated_at = self.last_checked;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: start.min(end),
            end,
        }
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStrategy {
    Initial,
    Incremental,
    GapFill,
}

impl CollectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionStrategy::Initial => "initial",
            CollectionStrategy::Incremental => "incremental",
            CollectionStrategy::GapFill => "gap_fill",
        }
    }
}

impl fmt::Display for CollectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionStrategy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "initial" => Ok(CollectionStrategy::Initial),
            "incremental" => Ok(CollectionStrategy::Incremental),
            "gap_fill" => Ok(CollectionStrategy::GapFill),
            other => Err(ParseEnumError {
                kind: "collection strategy",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    RateLimited,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::RateLimited => "rate_limited",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "success" => Ok(RunStatus::Success),
            "rate_limited" => Ok(RunStatus::RateLimited),
            "error" => Ok(RunStatus::Error),
            other => Err(ParseEnumError {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// One immutable audit record per topic attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub id: Uuid,
    pub topic_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: RunStatus,
    pub query_used: String,
    pub total_results: u32,
    pub new_posts: u32,
    pub duplicate_posts: u32,
    pub invalid_posts: u32,
    pub time_range_start: Option<DateTime<Utc>>,
    pub time_range_end: Option<DateTime<Utc>>,
    pub collection_strategy: CollectionStrategy,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub api_calls_used: u32,
    pub metadata: JsonValue,
}

impl CollectionRun {
    pub fn window(&self) -> Option<TimeWindow> {
        match (self.time_range_start, self.time_range_end) {
            (Some(start), Some(end)) => Some(TimeWindow { start, end }),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    News,
    Government,
    Forum,
    Blog,
    SocialMedia,
    #[default]
    Unknown,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::News => "news",
            SourceType::Government => "government",
            SourceType::Forum => "forum",
            SourceType::Blog => "blog",
            SourceType::SocialMedia => "social_media",
            SourceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "news" => Ok(SourceType::News),
            "government" => Ok(SourceType::Government),
            "forum" => Ok(SourceType::Forum),
            "blog" => Ok(SourceType::Blog),
            "social_media" => Ok(SourceType::SocialMedia),
            "unknown" => Ok(SourceType::Unknown),
            other => Err(ParseEnumError {
                kind: "source type",
                value: other.to_string(),
            }),
        }
    }
}

/// A raw citation as returned by an upstream provider, before any quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub full_answer: Option<String>,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Ordered provider response for one upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CandidateBatch {
    pub candidates: Vec<Candidate>,
    /// Provider-level details recorded on the run (model, response id, digest).
    #[serde(default)]
    pub metadata: JsonValue,
}

impl CandidateBatch {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Item payload accepted by the quality gate and ready for insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub search_query: String,
    pub query_timestamp: DateTime<Utc>,
    pub source_url: String,
    pub source_title: Option<String>,
    pub source_domain: Option<String>,
    pub source_type: SourceType,
    pub content: String,
    pub content_hash: String,
    pub full_answer: Option<String>,
    pub metadata: JsonValue,
    pub relevance_score: Option<f64>,
    pub confidence_score: f64,
    pub is_valid: bool,
    pub tags: Vec<String>,
}

/// Persisted item. `soft_deleted_at` is owned by the retention process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub collected_at: DateTime<Utc>,
    pub soft_deleted_at: Option<DateTime<Utc>>,
    pub data: NewItem,
}

impl Item {
    pub fn is_live(&self) -> bool {
        self.soft_deleted_at.is_none()
    }
}
