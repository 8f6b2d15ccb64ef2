use chrono::{DateTime, Duration, Utc};
use itm_core::{CollectionRun, CollectionStrategy, TimeWindow, Topic};
use serde::Serialize;

use crate::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowPlan {
    pub strategy: CollectionStrategy,
    pub window: TimeWindow,
    /// Query text actually sent upstream.
    pub query: String,
}

/// Chooses the collection strategy and time range for a topic's next run.
#[derive(Debug, Clone)]
pub struct WindowPlanner {
    initial_lookback: Duration,
    incremental_lookback: Duration,
    max_gap: Duration,
    time_bounded_queries: bool,
    initial_suffix: String,
    since_prefix: String,
}

impl WindowPlanner {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_lookback: Duration::days(i64::from(config.initial_collection_days)),
            incremental_lookback: Duration::hours(i64::from(config.incremental_collection_hours)),
            max_gap: Duration::hours(i64::from(config.max_collection_gap_hours)),
            time_bounded_queries: config.enable_time_bounded_queries,
            initial_suffix: config.initial_query_suffix.clone(),
            since_prefix: config.since_query_prefix.clone(),
        }
    }

    pub fn plan(
        &self,
        topic: &Topic,
        last_success: Option<&CollectionRun>,
        now: DateTime<Utc>,
    ) -> WindowPlan {
        let (strategy, start) = match last_success {
            Some(run) => {
                // Legacy runs have no recorded window; their completion time stands in.
                let last_end = run.time_range_end.unwrap_or(run.completed_at).min(now);
                if now - last_end <= self.max_gap {
                    (CollectionStrategy::Incremental, last_end)
                } else {
                    (CollectionStrategy::GapFill, last_end)
                }
            }
            None if topic.last_checked.is_some() => {
                (CollectionStrategy::Incremental, now - self.incremental_lookback)
            }
            None => (CollectionStrategy::Initial, now - self.initial_lookback),
        };
        let window = TimeWindow::new(start, now);
        WindowPlan {
            strategy,
            query: self.render_query(&topic.search_query, strategy, &window),
            window,
        }
    }

    pub fn render_query(
        &self,
        template: &str,
        strategy: CollectionStrategy,
        window: &TimeWindow,
    ) -> String {
        let base = template.trim();
        if !self.time_bounded_queries {
            return base.to_string();
        }
        match strategy {
            CollectionStrategy::Initial => format!("{base}{}", self.initial_suffix),
            CollectionStrategy::Incremental | CollectionStrategy::GapFill => format!(
                "{base}{}{}",
                self.since_prefix,
                window.start.format("%Y-%m-%d")
            ),
        }
    }
}
