use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use itm_adapters::{CollectError, CollectRequest, SearchCollector};
use itm_core::{
    Candidate, CandidateBatch, CollectionRun, CollectionStrategy, FrequencyTable, NewItem,
    NewTopic, Priority, RunStatus, SourceType, Topic, TopicStateUpdate,
};
use itm_storage::{content_fingerprint, CollectionStore, InsertOutcome, MemoryStore, StorageError};
use itm_sync::{
    Clock, CollectionEngine, EngineConfig, ManualClock, StopSignal, MAX_SOURCE_URL_CHARS,
};
use uuid::Uuid;

fn tick_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("ts")
}

fn test_config() -> EngineConfig {
    EngineConfig {
        query_delay: Duration::ZERO,
        rules_dir: PathBuf::from("/nonexistent/itm-rules"),
        ..EngineConfig::default()
    }
}

fn citation(url: &str, body: &str) -> Candidate {
    Candidate {
        url: url.to_string(),
        title: format!("Report on {body}"),
        content: format!("{body}. Scientists published new findings this week with detailed regional data."),
        full_answer: None,
        metadata: serde_json::json!({}),
    }
}

fn batch(candidates: Vec<Candidate>) -> CandidateBatch {
    CandidateBatch {
        candidates,
        metadata: serde_json::json!({"provider": "scripted"}),
    }
}

/// Collector that replays queued responses per topic and records every request.
#[derive(Default)]
struct ScriptedCollector {
    responses: Mutex<HashMap<String, VecDeque<Result<CandidateBatch, CollectError>>>>,
    requests: Mutex<Vec<CollectRequest>>,
    stop_on_collect: Mutex<Option<StopSignal>>,
}

impl ScriptedCollector {
    fn push(&self, topic: &str, response: Result<CandidateBatch, CollectError>) {
        self.responses
            .lock()
            .expect("lock")
            .entry(topic.to_string())
            .or_default()
            .push_back(response);
    }

    fn requests(&self) -> Vec<CollectRequest> {
        self.requests.lock().expect("lock").clone()
    }

    fn topics_called(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.topic_name).collect()
    }
}

#[async_trait]
impl SearchCollector for ScriptedCollector {
    fn provider(&self) -> &'static str {
        "scripted"
    }

    async fn collect(&self, request: &CollectRequest) -> Result<CandidateBatch, CollectError> {
        self.requests.lock().expect("lock").push(request.clone());
        if let Some(stop) = self.stop_on_collect.lock().expect("lock").as_ref() {
            stop.request_stop();
        }
        self.responses
            .lock()
            .expect("lock")
            .get_mut(&request.topic_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(CandidateBatch::default()))
    }
}

/// Memory store whose item inserts can be switched to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_items: AtomicBool,
}

#[async_trait]
impl CollectionStore for FlakyStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }

    async fn query_due_topics(
        &self,
        now: DateTime<Utc>,
        frequencies: &FrequencyTable,
    ) -> Result<Vec<Topic>, StorageError> {
        self.inner.query_due_topics(now, frequencies).await
    }

    async fn list_topics(&self, active_only: bool) -> Result<Vec<Topic>, StorageError> {
        self.inner.list_topics(active_only).await
    }

    async fn upsert_topic(&self, topic: NewTopic, now: DateTime<Utc>) -> Result<Topic, StorageError> {
        self.inner.upsert_topic(topic, now).await
    }

    async fn set_topic_active(
        &self,
        topic_name: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Topic, StorageError> {
        self.inner.set_topic_active(topic_name, active, now).await
    }

    async fn update_topic_state(
        &self,
        topic_id: Uuid,
        update: &TopicStateUpdate,
    ) -> Result<(), StorageError> {
        self.inner.update_topic_state(topic_id, update).await
    }

    async fn last_successful_run(&self, topic_id: Uuid) -> Result<Option<CollectionRun>, StorageError> {
        self.inner.last_successful_run(topic_id).await
    }

    async fn insert_run(&self, run: &CollectionRun) -> Result<(), StorageError> {
        self.inner.insert_run(run).await
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<CollectionRun>, StorageError> {
        self.inner.recent_runs(limit).await
    }

    async fn exists_by_url(&self, url: &str) -> Result<bool, StorageError> {
        self.inner.exists_by_url(url).await
    }

    async fn item_id_by_url(&self, url: &str) -> Result<Option<Uuid>, StorageError> {
        self.inner.item_id_by_url(url).await
    }

    async fn exists_by_content_hash(&self, content_hash: &str) -> Result<bool, StorageError> {
        self.inner.exists_by_content_hash(content_hash).await
    }

    async fn insert_item(
        &self,
        item: &NewItem,
        collected_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, StorageError> {
        if self.fail_items.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("items table locked".into()));
        }
        self.inner.insert_item(item, collected_at).await
    }

    async fn link(&self, topic_id: Uuid, item_id: Uuid, linked_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.inner.link(topic_id, item_id, linked_at).await
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    collector: Arc<ScriptedCollector>,
    clock: Arc<ManualClock>,
    engine: CollectionEngine,
}

fn harness(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let collector = Arc::new(ScriptedCollector::default());
    let clock = Arc::new(ManualClock::new(tick_time()));
    let engine = CollectionEngine::new(config, store.clone(), collector.clone(), clock.clone())
        .expect("engine");
    Harness {
        store,
        collector,
        clock,
        engine,
    }
}

async fn add_topic(store: &dyn CollectionStore, name: &str, priority: Priority) -> Topic {
    store
        .upsert_topic(NewTopic::new(name, format!("{name} query")).with_priority(priority), tick_time())
        .await
        .expect("topic")
}

async fn preload_item(store: &dyn CollectionStore, url: &str, content: &str) {
    let item = NewItem {
        search_query: "earlier".into(),
        query_timestamp: tick_time(),
        source_url: url.into(),
        source_title: None,
        source_domain: None,
        source_type: SourceType::Unknown,
        content: content.into(),
        content_hash: content_fingerprint(content),
        full_answer: None,
        metadata: serde_json::json!({}),
        relevance_score: None,
        confidence_score: 0.5,
        is_valid: true,
        tags: vec![],
    };
    store.insert_item(&item, tick_time()).await.expect("preload");
}

#[tokio::test]
async fn first_run_stores_new_items_and_counts_the_duplicate() {
    let h = harness(test_config());
    let topic = add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    preload_item(h.store.as_ref(), "https://www.reuters.com/climate/1", "previously stored story").await;
    h.collector.push(
        "climate-news",
        Ok(batch(vec![
            citation("https://www.reuters.com/climate/1", "Sea levels rise"),
            citation("https://www.bbc.com/news/science-2", "Glaciers retreat"),
            citation("https://example.org/reports/3", "Heatwaves intensify"),
        ])),
    );

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.posts_collected, 2);

    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.collection_strategy, CollectionStrategy::Initial);
    assert_eq!((run.total_results, run.new_posts, run.duplicate_posts, run.invalid_posts), (3, 2, 1, 0));
    assert_eq!(run.api_calls_used, 1);
    assert_eq!(run.time_range_end, Some(tick_time()));
    assert_eq!(run.time_range_start, Some(tick_time() - chrono::Duration::days(7)));
    assert_eq!(run.query_used, "climate-news query latest news");
    assert!(run.completed_at >= run.started_at);

    let stored = h.store.topic(topic.id).await.expect("topic");
    assert_eq!(stored.last_checked, Some(tick_time()));
    assert_eq!(stored.total_posts_collected, 2);
    assert_eq!(stored.run_count, 1);
    assert_eq!(h.store.items().await.len(), 3);
    // The already stored citation is attached to this topic too.
    assert_eq!(h.store.links().await.len(), 3);

    let request = &h.collector.requests()[0];
    assert_eq!(request.window.map(|w| w.end), Some(tick_time()));
}

#[tokio::test]
async fn rate_limited_first_call_leaves_topic_and_breaker_alone() {
    let h = harness(test_config());
    let topic = add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    h.collector.push(
        "climate-news",
        Err(CollectError::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        }),
    );

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.rate_limited, 1);

    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::RateLimited);
    assert_eq!(runs[0].api_calls_used, 1);
    assert_eq!(h.engine.breaker().consecutive_failures(topic.id), 0);
    assert_eq!(h.store.topic(topic.id).await.expect("topic").last_checked, None);

    let snapshot = h.engine.budget().snapshot(h.clock.now());
    assert_eq!(snapshot.blocked_until, Some(tick_time() + chrono::Duration::seconds(120)));
}

#[tokio::test]
async fn transient_failures_are_retried_then_recorded_once() {
    let h = harness(test_config());
    let topic = add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    for _ in 0..3 {
        h.collector
            .push("climate-news", Err(CollectError::Transient("502 bad gateway".into())));
    }

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.failed, 1);

    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Error);
    assert_eq!(runs[0].api_calls_used, 3);
    assert!(runs[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("502 bad gateway"));
    assert_eq!(
        h.clock.sleeps(),
        vec![Duration::from_secs(4), Duration::from_secs(8)]
    );
    assert_eq!(h.engine.breaker().consecutive_failures(topic.id), 1);
}

#[tokio::test]
async fn budget_exhausted_before_retry_is_not_recorded_as_a_rate_limit() {
    let config = EngineConfig {
        max_queries_per_minute: 1,
        max_budget_wait: Duration::from_secs(10),
        ..test_config()
    };
    let h = harness(config);
    add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    h.collector
        .push("climate-news", Err(CollectError::Transient("502 bad gateway".into())));
    h.collector.push(
        "climate-news",
        Ok(batch(vec![citation("https://example.org/a", "Storm surge")])),
    );

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!((summary.rate_limited, summary.failed), (0, 1));

    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Error);
    assert_eq!(runs[0].api_calls_used, 1);
    assert_eq!(runs[0].metadata["budget_exhausted"], true);
    let message = runs[0].error_message.as_deref().unwrap_or_default();
    assert!(message.contains("call budget exhausted"), "{message}");
    assert!(message.contains("502 bad gateway"), "{message}");

    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(4)]);
    let snapshot = h.engine.budget().snapshot(h.clock.now());
    assert_eq!(snapshot.blocked_until, None);
    assert_eq!(h.collector.requests().len(), 1);
}

#[tokio::test]
async fn breaker_opens_after_three_failed_runs_and_skips_the_topic() {
    let h = harness(test_config());
    let topic = add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    for _ in 0..4 {
        h.collector
            .push("climate-news", Err(CollectError::Permanent("401 unauthorized".into())));
    }

    for _ in 0..3 {
        h.engine.run_tick(&StopSignal::new()).await.expect("tick");
        h.clock.advance(Duration::from_secs(60));
    }
    assert!(!h.engine.breaker().allow(topic.id, h.clock.now()));

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.skipped_by_breaker, 1);
    assert_eq!(h.collector.requests().len(), 3);

    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 4);
    let skipped = &runs[3];
    assert_eq!(skipped.status, RunStatus::Error);
    assert_eq!(skipped.api_calls_used, 0);
    assert!(skipped
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("circuit open"));
    assert_eq!(skipped.metadata["circuit_open"], true);

    // Cooldown defaults to the topic frequency (24h for normal priority).
    h.clock.advance(Duration::from_secs(24 * 3600));
    h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(h.collector.requests().len(), 4);
}

#[tokio::test]
async fn success_after_failures_closes_the_breaker() {
    let h = harness(test_config());
    let topic = add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    h.collector
        .push("climate-news", Err(CollectError::Permanent("400".into())));
    h.collector.push(
        "climate-news",
        Ok(batch(vec![citation("https://example.org/a", "Storm surge")])),
    );

    h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(h.engine.breaker().consecutive_failures(topic.id), 1);
    h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(h.engine.breaker().consecutive_failures(topic.id), 0);
}

#[tokio::test]
async fn persistence_failure_ends_run_in_error_without_touching_topic() {
    let store = Arc::new(FlakyStore::default());
    let collector = Arc::new(ScriptedCollector::default());
    let clock = Arc::new(ManualClock::new(tick_time()));
    let engine =
        CollectionEngine::new(test_config(), store.clone(), collector.clone(), clock.clone())
            .expect("engine");
    let topic = add_topic(store.as_ref(), "climate-news", Priority::Normal).await;
    collector.push(
        "climate-news",
        Ok(batch(vec![citation("https://example.org/a", "Storm surge")])),
    );
    store.fail_items.store(true, Ordering::SeqCst);

    let summary = engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.failed, 1);

    let runs = store.inner.runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Error);
    assert!(runs[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("persistence error"));
    let stored = store.inner.topic(topic.id).await.expect("topic");
    assert_eq!(stored.last_checked, None);
    assert_eq!(stored.version, topic.version);
    assert_eq!(engine.breaker().consecutive_failures(topic.id), 0);
}

#[tokio::test]
async fn one_topic_failing_does_not_abort_the_tick() {
    let h = harness(test_config());
    add_topic(h.store.as_ref(), "broken", Priority::Critical).await;
    let healthy = add_topic(h.store.as_ref(), "healthy", Priority::Normal).await;
    h.collector
        .push("broken", Err(CollectError::Permanent("bad request".into())));
    h.collector.push(
        "healthy",
        Ok(batch(vec![citation("https://example.org/ok", "Wildfire season")])),
    );

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!((summary.failed, summary.succeeded), (1, 1));
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].topic_name, "broken");
    assert_eq!(h.store.runs().await.len(), 2);
    assert!(h.store.topic(healthy.id).await.expect("topic").last_checked.is_some());
}

#[tokio::test]
async fn topics_run_in_priority_then_staleness_order() {
    let h = harness(test_config());
    add_topic(h.store.as_ref(), "low", Priority::Low).await;
    add_topic(h.store.as_ref(), "normal-fresh", Priority::Normal).await;
    let mut stale = add_topic(h.store.as_ref(), "normal-stale", Priority::Normal).await;
    stale.last_checked = Some(tick_time() - chrono::Duration::hours(30));
    h.store.put_topic(stale).await;
    add_topic(h.store.as_ref(), "critical", Priority::Critical).await;

    h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(
        h.collector.topics_called(),
        vec!["critical", "normal-fresh", "normal-stale", "low"]
    );
}

#[tokio::test]
async fn stop_signal_lets_the_current_topic_finish() {
    let h = harness(test_config());
    add_topic(h.store.as_ref(), "first", Priority::Critical).await;
    add_topic(h.store.as_ref(), "second", Priority::Normal).await;
    let stop = StopSignal::new();
    *h.collector.stop_on_collect.lock().expect("lock") = Some(stop.clone());

    let summary = h.engine.run_tick(&stop).await.expect("tick");
    assert!(summary.stopped_early);
    assert_eq!(summary.topics_processed, 1);
    assert_eq!(summary.deferred, 1);
    assert_eq!(h.store.runs().await.len(), 1);
    assert_eq!(h.collector.topics_called(), vec!["first"]);
}

#[tokio::test]
async fn exhausted_budget_ends_the_tick_without_audit_for_deferred_topics() {
    let config = EngineConfig {
        max_queries_per_minute: 1,
        max_budget_wait: Duration::from_secs(10),
        ..test_config()
    };
    let h = harness(config);
    add_topic(h.store.as_ref(), "first", Priority::Critical).await;
    add_topic(h.store.as_ref(), "second", Priority::Normal).await;

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.topics_processed, 1);
    assert_eq!(summary.deferred, 1);
    assert!(summary.stopped_early);
    assert_eq!(h.store.runs().await.len(), 1);
}

#[tokio::test]
async fn short_budget_waits_are_slept_through() {
    let config = EngineConfig {
        query_delay: Duration::from_secs(6),
        ..test_config()
    };
    let h = harness(config);
    add_topic(h.store.as_ref(), "first", Priority::Critical).await;
    add_topic(h.store.as_ref(), "second", Priority::Normal).await;

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.succeeded, 2);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(6)]);
}

#[tokio::test]
async fn tick_cap_defers_excess_topics() {
    let config = EngineConfig {
        max_topics_per_tick: 1,
        ..test_config()
    };
    let h = harness(config);
    add_topic(h.store.as_ref(), "a", Priority::Normal).await;
    add_topic(h.store.as_ref(), "b", Priority::Normal).await;

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.topics_due, 2);
    assert_eq!(summary.topics_processed, 1);
    assert_eq!(summary.deferred, 1);
}

#[tokio::test]
async fn repeated_and_syndicated_citations_are_classified() {
    let h = harness(test_config());
    add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    let original = citation("https://example.org/a", "Coral bleaching spreads");
    let mut syndicated = original.clone();
    syndicated.url = "https://mirror.example.net/a".into();
    let too_short = Candidate {
        content: "tiny".into(),
        ..citation("https://example.org/short", "x")
    };
    h.collector.push(
        "climate-news",
        Ok(batch(vec![original.clone(), original, syndicated, too_short])),
    );

    h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    let run = &h.store.runs().await[0];
    assert_eq!((run.new_posts, run.duplicate_posts, run.invalid_posts), (2, 1, 1));
    assert_eq!(run.metadata["rejections"]["content_too_short"], 1);

    let items = h.store.items().await;
    let mirror = items
        .iter()
        .find(|i| i.data.source_url == "https://mirror.example.net/a")
        .expect("mirror stored");
    assert!(mirror.data.tags.iter().any(|t| t == "syndicated"));
}

#[tokio::test]
async fn over_long_source_url_is_rejected_per_item() {
    let h = harness(test_config());
    let topic = add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    let long_url = format!("https://example.org/{}", "a".repeat(MAX_SOURCE_URL_CHARS));
    h.collector.push(
        "climate-news",
        Ok(batch(vec![
            citation(&long_url, "Ocean heat content"),
            citation("https://example.org/ok", "Wildfire season"),
        ])),
    );

    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    assert_eq!(summary.succeeded, 1);
    let run = &h.store.runs().await[0];
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!((run.new_posts, run.invalid_posts), (1, 1));
    assert_eq!(run.metadata["rejections"]["url_malformed"], 1);
    assert!(h.store.topic(topic.id).await.expect("topic").last_checked.is_some());
}

#[tokio::test]
async fn citation_seen_by_another_topic_is_linked_to_both() {
    let h = harness(test_config());
    let first = add_topic(h.store.as_ref(), "climate-news", Priority::Critical).await;
    let second = add_topic(h.store.as_ref(), "renewable-energy", Priority::Normal).await;
    let shared = citation("https://example.org/solar-record", "Solar output record");
    h.collector.push("climate-news", Ok(batch(vec![shared.clone()])));
    h.collector.push("renewable-energy", Ok(batch(vec![shared])));

    h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    let runs = h.store.runs().await;
    assert_eq!((runs[0].new_posts, runs[1].duplicate_posts), (1, 1));

    let items = h.store.items().await;
    assert_eq!(items.len(), 1);
    let mut linked_topics = h
        .store
        .links()
        .await
        .into_iter()
        .filter(|l| l.item_id == items[0].id)
        .map(|l| l.topic_id)
        .collect::<Vec<_>>();
    linked_topics.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(linked_topics, expected);
}

#[tokio::test]
async fn wait_idle_returns_when_no_tick_is_running() {
    let h = harness(test_config());
    tokio::time::timeout(Duration::from_secs(1), h.engine.wait_idle())
        .await
        .expect("idle engine");
}

#[tokio::test]
async fn content_duplicates_can_be_rejected_by_policy() {
    let config = EngineConfig {
        reject_content_duplicates: true,
        ..test_config()
    };
    let h = harness(config);
    add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    let original = citation("https://example.org/a", "Coral bleaching spreads");
    let mut copy = original.clone();
    copy.url = "https://mirror.example.net/a".into();
    h.collector
        .push("climate-news", Ok(batch(vec![original, copy])));

    h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    let run = &h.store.runs().await[0];
    assert_eq!((run.new_posts, run.duplicate_posts), (1, 1));
    assert_eq!(h.store.items().await.len(), 1);
}

#[tokio::test]
async fn candidates_beyond_the_per_run_cap_are_counted_but_skipped() {
    let config = EngineConfig {
        max_posts_per_collection: 2,
        ..test_config()
    };
    let h = harness(config);
    add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    h.collector.push(
        "climate-news",
        Ok(batch(vec![
            citation("https://example.org/1", "First story"),
            citation("https://example.org/2", "Second story"),
            citation("https://example.org/3", "Third story"),
        ])),
    );

    h.engine.run_tick(&StopSignal::new()).await.expect("tick");
    let run = &h.store.runs().await[0];
    assert_eq!((run.total_results, run.new_posts), (3, 2));
    assert_eq!(run.metadata["over_cap"], 1);
}

#[tokio::test]
async fn next_run_continues_from_the_previous_window() {
    let h = harness(test_config());
    let topic = add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    h.engine.run_tick(&StopSignal::new()).await.expect("first tick");

    h.clock.advance(Duration::from_secs(12 * 3600));
    let summary = h.engine.run_tick(&StopSignal::new()).await.expect("not due yet");
    assert_eq!(summary.topics_due, 0);

    h.clock.advance(Duration::from_secs(12 * 3600));
    h.engine.run_tick(&StopSignal::new()).await.expect("second tick");
    let runs = h.store.runs().await;
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].collection_strategy, CollectionStrategy::Incremental);
    assert_eq!(runs[1].time_range_start, runs[0].time_range_end);
    assert_eq!(runs[1].query_used, "climate-news query since 2026-03-01");
    let stored = h.store.topic(topic.id).await.expect("topic");
    assert_eq!(stored.run_count, 2);
}

#[tokio::test]
async fn health_report_reflects_store_and_runs() {
    let h = harness(test_config());
    add_topic(h.store.as_ref(), "climate-news", Priority::Normal).await;
    h.collector
        .push("climate-news", Err(CollectError::Permanent("403".into())));
    h.engine.run_tick(&StopSignal::new()).await.expect("tick");

    let report = h.engine.health(10).await;
    assert!(report.store_reachable);
    assert_eq!(report.active_topics, 1);
    assert_eq!(report.due_topics, 1);
    assert_eq!(report.recent_runs.len(), 1);
    assert_eq!(report.recent_errors.len(), 1);
    assert_eq!(report.budget.day_used, 1);

    h.store.set_unavailable(true);
    let report = h.engine.health(10).await;
    assert!(!report.store_reachable);
    assert!(report.store_error.is_some());
}

#[tokio::test]
async fn listing_failure_fails_the_tick() {
    let h = harness(test_config());
    h.store.set_unavailable(true);
    assert!(h.engine.run_tick(&StopSignal::new()).await.is_err());
}
