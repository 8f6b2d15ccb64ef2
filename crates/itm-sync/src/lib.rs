//! Incremental collection engine: call budget, retry, circuit breaking,
//! window planning, quality gate, dedup and the tick scheduler.

pub mod breaker;
pub mod budget;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod quality;
pub mod retry;
pub mod scheduler;
pub mod window;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itm_core::{NewTopic, Topic};
use itm_storage::CollectionStore;
use tracing::info;

pub use breaker::CircuitBreaker;
pub use budget::{BudgetSnapshot, Permit, RateBudget};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use dedup::{DedupVerdict, Deduplicator};
pub use quality::{
    ClassificationRules, ConfidenceBand, Rejection, ScoredItem, Validator, MAX_SOURCE_URL_CHARS,
};
pub use retry::{RetryOutcome, RetryPolicy};
pub use scheduler::{CollectionEngine, HealthReport, StopSignal, TickSummary, TopicFailure};
pub use window::{WindowPlan, WindowPlanner};

pub const CRATE_NAME: &str = "itm-sync";

/// Read topic seeds from a YAML list of topic definitions.
pub fn load_topic_seeds(path: impl AsRef<Path>) -> Result<Vec<NewTopic>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let seeds: Vec<NewTopic> =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    for seed in &seeds {
        seed.validate()
            .with_context(|| format!("invalid topic `{}` in {}", seed.topic_name, path.display()))?;
    }
    Ok(seeds)
}

/// Upsert every seed; existing topics keep their id and state.
pub async fn seed_topics(
    store: &dyn CollectionStore,
    seeds: Vec<NewTopic>,
    now: DateTime<Utc>,
) -> Result<Vec<Topic>> {
    let mut topics = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let name = seed.topic_name.clone();
        let topic = store
            .upsert_topic(seed, now)
            .await
            .with_context(|| format!("upserting topic {name}"))?;
        info!(topic = %topic.topic_name, version = topic.version, "topic seeded");
        topics.push(topic);
    }
    Ok(topics)
}
