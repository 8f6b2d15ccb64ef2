use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itm_adapters::{CollectError, CollectRequest, SearchCollector};
use itm_core::{CandidateBatch, CollectionRun, RunStatus, Topic, TopicStateUpdate};
use itm_storage::{CollectionStore, InsertOutcome, StorageError};
use serde::Serialize;
use serde_json::json;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::budget::{BudgetSnapshot, Permit, RateBudget};
use crate::breaker::CircuitBreaker;
use crate::clock::{to_std, Clock};
use crate::dedup::{DedupVerdict, Deduplicator};
use crate::quality::{ClassificationRules, Validator};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::window::{WindowPlan, WindowPlanner};
use crate::EngineConfig;

/// Penalty applied when the provider rate-limits without a `Retry-After`.
const DEFAULT_RATE_LIMIT_PENALTY: Duration = Duration::from_secs(60);
const SYNDICATED_TAG: &str = "syndicated";
const BUDGET_EXHAUSTED_BEFORE_RETRY: &str = "call budget exhausted before retry";

/// Cooperative stop flag, checked between topics.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicFailure {
    pub topic_name: String,
    pub status: RunStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSummary {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub topics_due: usize,
    /// Topics that produced an audit record this tick.
    pub topics_processed: usize,
    pub succeeded: usize,
    pub rate_limited: usize,
    pub failed: usize,
    pub skipped_by_breaker: usize,
    /// Due topics left for a later tick (cap, stop signal or exhausted budget).
    pub deferred: usize,
    pub posts_collected: u64,
    pub stopped_early: bool,
    pub errors: Vec<TopicFailure>,
}

impl TickSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            completed_at: started_at,
            topics_due: 0,
            topics_processed: 0,
            succeeded: 0,
            rate_limited: 0,
            failed: 0,
            skipped_by_breaker: 0,
            deferred: 0,
            posts_collected: 0,
            stopped_early: false,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDigest {
    pub topic_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub new_posts: u32,
    pub duplicate_posts: u32,
    pub error_message: Option<String>,
}

impl From<&CollectionRun> for RunDigest {
    fn from(run: &CollectionRun) -> Self {
        Self {
            topic_id: run.topic_id,
            started_at: run.started_at,
            status: run.status,
            new_posts: run.new_posts,
            duplicate_posts: run.duplicate_posts,
            error_message: run.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub store_reachable: bool,
    pub store_error: Option<String>,
    pub active_topics: usize,
    pub due_topics: usize,
    pub open_circuits: usize,
    pub recent_runs: Vec<RunDigest>,
    pub recent_errors: Vec<RunDigest>,
    pub budget: BudgetSnapshot,
}

#[derive(Debug, Default)]
struct RunCounts {
    total_results: u32,
    new_posts: u32,
    duplicate_posts: u32,
    invalid_posts: u32,
    syndicated: u32,
    over_cap: u32,
    rejections: BTreeMap<&'static str, u32>,
}

enum TopicOutcome {
    Completed(CollectionRun),
    /// The breaker was open; the run records the skip without a call.
    CircuitOpen(CollectionRun),
    /// No permit within the wait limit; the topic was not started.
    BudgetExhausted,
}

/// The collection engine: one `run_tick` call is one scheduler tick.
pub struct CollectionEngine {
    config: EngineConfig,
    store: Arc<dyn CollectionStore>,
    collector: Arc<dyn SearchCollector>,
    clock: Arc<dyn Clock>,
    budget: Arc<RateBudget>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    planner: WindowPlanner,
    validator: Validator,
    tick_gate: Arc<tokio::sync::Mutex<()>>,
}

impl CollectionEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CollectionStore>,
        collector: Arc<dyn SearchCollector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().context("invalid engine configuration")?;
        let rules = ClassificationRules::load_dir(&config.rules_dir)?;
        let validator = Validator::new(&config, rules)?;
        Ok(Self {
            budget: Arc::new(RateBudget::from_config(&config)),
            breaker: Arc::new(CircuitBreaker::new(config.breaker_failure_threshold)),
            retry: RetryPolicy::from(config.retry),
            planner: WindowPlanner::from_config(&config),
            validator,
            tick_gate: Arc::new(tokio::sync::Mutex::new(())),
            config,
            store,
            collector,
            clock,
        })
    }

    pub fn with_budget(mut self, budget: Arc<RateBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Resolves once no scheduled tick is running.
    pub async fn wait_idle(&self) {
        let _idle = self.tick_gate.lock().await;
    }

    /// Process due topics in priority order. Only a failure to list due
    /// topics fails the tick; per-topic failures end up in audit records.
    pub async fn run_tick(&self, stop: &StopSignal) -> Result<TickSummary, StorageError> {
        let tick_started = self.clock.now();
        let mut summary = TickSummary::new(tick_started);

        let mut topics = self
            .store
            .query_due_topics(tick_started, &self.config.frequencies)
            .await?;
        topics.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.last_checked.cmp(&b.last_checked))
        });
        summary.topics_due = topics.len();
        if topics.len() > self.config.max_topics_per_tick {
            summary.deferred = topics.len() - self.config.max_topics_per_tick;
            topics.truncate(self.config.max_topics_per_tick);
        }
        info!(
            due = summary.topics_due,
            attempting = topics.len(),
            "collection tick started"
        );

        let total = topics.len();
        for (index, topic) in topics.iter().enumerate() {
            if stop.is_stop_requested() {
                info!(remaining = total - index, "stop requested; ending tick");
                summary.deferred += total - index;
                summary.stopped_early = true;
                break;
            }

            let run_id = Uuid::new_v4();
            let span = info_span!("collection_run", topic = %topic.topic_name, %run_id);
            let outcome = self.run_topic(topic, run_id).instrument(span).await;
            let (run, circuit_open) = match outcome {
                TopicOutcome::Completed(run) => (run, false),
                TopicOutcome::CircuitOpen(run) => (run, true),
                TopicOutcome::BudgetExhausted => {
                    warn!(
                        topic = %topic.topic_name,
                        remaining = total - index,
                        "no call budget within wait limit; ending tick"
                    );
                    summary.deferred += total - index;
                    summary.stopped_early = true;
                    break;
                }
            };

            summary.topics_processed += 1;
            match run.status {
                _ if circuit_open => summary.skipped_by_breaker += 1,
                RunStatus::Success => {
                    summary.succeeded += 1;
                    summary.posts_collected += u64::from(run.new_posts);
                }
                RunStatus::RateLimited => summary.rate_limited += 1,
                RunStatus::Error => summary.failed += 1,
            }
            if run.status != RunStatus::Success {
                summary.errors.push(TopicFailure {
                    topic_name: topic.topic_name.clone(),
                    status: run.status,
                    message: run.error_message.clone().unwrap_or_default(),
                });
            }

            if let Err(err) = self.store.insert_run(&run).await {
                error!(topic = %topic.topic_name, run_id = %run.id, error = %err, "failed to write audit record");
                summary.errors.push(TopicFailure {
                    topic_name: topic.topic_name.clone(),
                    status: RunStatus::Error,
                    message: format!("audit record not written: {err}"),
                });
            }
        }

        summary.completed_at = self.clock.now();
        info!(
            processed = summary.topics_processed,
            succeeded = summary.succeeded,
            rate_limited = summary.rate_limited,
            failed = summary.failed,
            skipped_by_breaker = summary.skipped_by_breaker,
            deferred = summary.deferred,
            posts = summary.posts_collected,
            "collection tick finished"
        );
        Ok(summary)
    }

    async fn run_topic(&self, topic: &Topic, run_id: Uuid) -> TopicOutcome {
        let planned_at = self.clock.now();
        let last_success = match self.store.last_successful_run(topic.id).await {
            Ok(run) => run,
            Err(err) => {
                let plan = self.planner.plan(topic, None, planned_at);
                return TopicOutcome::Completed(self.failed_run(
                    run_id,
                    topic,
                    &plan,
                    planned_at,
                    0,
                    format!("persistence error: {err}"),
                    format!("{err:?}"),
                ));
            }
        };
        let plan = self.planner.plan(topic, last_success.as_ref(), planned_at);

        if let Some(until) = self.breaker.open_until(topic.id, planned_at) {
            warn!(open_until = %until, "circuit open; skipping topic");
            let mut run = self.failed_run(
                run_id,
                topic,
                &plan,
                planned_at,
                0,
                format!("circuit open until {}", until.to_rfc3339()),
                String::new(),
            );
            run.metadata = json!({
                "provider": self.collector.provider(),
                "circuit_open": true,
                "open_until": until,
            });
            return TopicOutcome::CircuitOpen(run);
        }

        if !self.acquire_permit().await {
            return TopicOutcome::BudgetExhausted;
        }

        let started_at = self.clock.now();
        // The permit may have taken a while; the window still ends when the run starts.
        let plan = self.planner.plan(topic, last_success.as_ref(), started_at);
        let request = CollectRequest {
            run_id,
            topic_id: topic.id,
            topic_name: topic.topic_name.clone(),
            query: plan.query.clone(),
            window: Some(plan.window),
        };
        info!(
            strategy = %plan.strategy,
            window_start = %plan.window.start,
            window_end = %plan.window.end,
            query = %plan.query,
            "collecting"
        );

        let calls = AtomicU32::new(0);
        let budget_short = AtomicBool::new(false);
        let last_upstream_error = tokio::sync::Mutex::new(None::<CollectError>);
        let outcome = {
            let calls = &calls;
            let budget_short = &budget_short;
            let last_upstream_error = &last_upstream_error;
            let request = &request;
            let collector = self.collector.as_ref();
            self.retry
                .run(self.clock.as_ref(), move |attempt| async move {
                    if attempt > 1 && !self.acquire_permit().await {
                        // Not retryable, so the loop ends here.
                        budget_short.store(true, Ordering::SeqCst);
                        return Err(CollectError::Permanent(BUDGET_EXHAUSTED_BEFORE_RETRY.into()));
                    }
                    calls.fetch_add(1, Ordering::SeqCst);
                    let result = collector.collect(request).await;
                    if let Err(err) = &result {
                        *last_upstream_error.lock().await = Some(err.clone());
                    }
                    result
                })
                .await
        };
        let api_calls = calls.load(Ordering::SeqCst);
        let budget_short = budget_short.load(Ordering::SeqCst);
        let last_upstream_error = last_upstream_error.into_inner();

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                self.ingest_batch(run_id, topic, &plan, started_at, value, api_calls, attempts)
                    .await
            }
            RetryOutcome::RateLimited { retry_after, .. } => {
                let penalty = retry_after.unwrap_or(DEFAULT_RATE_LIMIT_PENALTY);
                self.budget.penalize(penalty, self.clock.now());
                warn!(penalty_secs = penalty.as_secs(), "rate limited by upstream");
                let mut run = self.failed_run(
                    run_id,
                    topic,
                    &plan,
                    started_at,
                    api_calls,
                    "rate limited by upstream".to_string(),
                    String::new(),
                );
                run.status = RunStatus::RateLimited;
                run.error_traceback = None;
                run.metadata = json!({
                    "provider": self.collector.provider(),
                    "retry_after_secs": retry_after.map(|d| d.as_secs()),
                });
                TopicOutcome::Completed(run)
            }
            RetryOutcome::Failed { error, attempts } => {
                let error = match last_upstream_error {
                    Some(upstream) if budget_short => upstream,
                    _ => error,
                };
                let message = if budget_short {
                    format!(
                        "{BUDGET_EXHAUSTED_BEFORE_RETRY} attempt {attempts}; \
                         last upstream error: {error}"
                    )
                } else {
                    error.to_string()
                };
                let cooldown = self
                    .config
                    .breaker_cooldown
                    .unwrap_or_else(|| to_std(topic.frequency(&self.config.frequencies)));
                let opened = self.breaker.record_failure(topic.id, self.clock.now(), cooldown);
                error!(%error, attempts, budget_short, breaker_opened = opened, "upstream call failed");
                let mut run = self.failed_run(
                    run_id,
                    topic,
                    &plan,
                    started_at,
                    api_calls,
                    message,
                    format!("{error:?}"),
                );
                run.metadata = json!({
                    "provider": self.collector.provider(),
                    "attempts": attempts,
                    "budget_exhausted": budget_short,
                    "consecutive_failures": self.breaker.consecutive_failures(topic.id),
                    "circuit_opened": opened,
                });
                TopicOutcome::Completed(run)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn ingest_batch(
        &self,
        run_id: Uuid,
        topic: &Topic,
        plan: &WindowPlan,
        started_at: DateTime<Utc>,
        batch: CandidateBatch,
        api_calls: u32,
        attempts: u32,
    ) -> TopicOutcome {
        let mut counts = RunCounts {
            total_results: u32::try_from(batch.len()).unwrap_or(u32::MAX),
            ..RunCounts::default()
        };
        let ingested = self
            .ingest_candidates(topic, plan, started_at, &batch, &mut counts)
            .await;
        let ingested = match ingested {
            Ok(()) => {
                let update = TopicStateUpdate::after_run(topic, started_at, counts.new_posts);
                self.store.update_topic_state(topic.id, &update).await
            }
            Err(err) => Err(err),
        };

        let completed_at = self.clock.now();
        let metadata = json!({
            "provider": self.collector.provider(),
            "attempts": attempts,
            "batch": batch.metadata,
            "rejections": counts.rejections,
            "syndicated": counts.syndicated,
            "over_cap": counts.over_cap,
        });
        let mut run = CollectionRun {
            id: run_id,
            topic_id: Some(topic.id),
            started_at,
            completed_at: completed_at.max(started_at),
            status: RunStatus::Success,
            query_used: plan.query.clone(),
            total_results: counts.total_results,
            new_posts: counts.new_posts,
            duplicate_posts: counts.duplicate_posts,
            invalid_posts: counts.invalid_posts,
            time_range_start: Some(plan.window.start),
            time_range_end: Some(plan.window.end),
            collection_strategy: plan.strategy,
            error_message: None,
            error_traceback: None,
            api_calls_used: api_calls,
            metadata,
        };

        match ingested {
            Ok(()) => {
                self.breaker.record_success(topic.id);
                info!(
                    new = counts.new_posts,
                    duplicates = counts.duplicate_posts,
                    invalid = counts.invalid_posts,
                    "run succeeded"
                );
            }
            Err(err) => {
                error!(error = %err, "persistence failed; topic state left unchanged");
                run.status = RunStatus::Error;
                run.error_message = Some(format!("persistence error: {err}"));
                run.error_traceback = Some(format!("{err:?}"));
            }
        }
        TopicOutcome::Completed(run)
    }

    async fn ingest_candidates(
        &self,
        topic: &Topic,
        plan: &WindowPlan,
        queried_at: DateTime<Utc>,
        batch: &CandidateBatch,
        counts: &mut RunCounts,
    ) -> Result<(), StorageError> {
        let mut dedup = Deduplicator::new(
            self.store.as_ref(),
            self.config.enable_duplicate_prevention,
        );
        let cap = self.config.max_posts_per_collection;
        counts.over_cap = u32::try_from(batch.len().saturating_sub(cap)).unwrap_or(u32::MAX);

        for candidate in batch.candidates.iter().take(cap) {
            let url = candidate.url.trim();
            if dedup.check_url(url).await? == DedupVerdict::DuplicateByUrl {
                counts.duplicate_posts += 1;
                self.link_existing(topic, url).await?;
                continue;
            }

            let mut scored = match self.validator.assess(
                candidate,
                &plan.query,
                &topic.search_query,
                queried_at,
            ) {
                Ok(scored) => scored,
                Err(rejection) => {
                    counts.invalid_posts += 1;
                    *counts.rejections.entry(rejection.as_str()).or_default() += 1;
                    continue;
                }
            };

            let item = &mut scored.item;
            if dedup.check_content_hash(&item.content_hash).await? == DedupVerdict::DuplicateByContent {
                if self.config.reject_content_duplicates {
                    counts.duplicate_posts += 1;
                    dedup.remember(&item.source_url, &item.content_hash);
                    continue;
                }
                counts.syndicated += 1;
                if !item.tags.iter().any(|t| t == SYNDICATED_TAG) {
                    item.tags.push(SYNDICATED_TAG.to_string());
                }
                if let Some(meta) = item.metadata.as_object_mut() {
                    meta.insert("content_duplicate".into(), true.into());
                }
            }

            let linked_at = self.clock.now();
            match self.store.insert_item(item, linked_at).await? {
                InsertOutcome::Created(item_id) => {
                    self.store.link(topic.id, item_id, linked_at).await?;
                    counts.new_posts += 1;
                }
                InsertOutcome::Conflict => {
                    counts.duplicate_posts += 1;
                    self.link_existing(topic, &item.source_url).await?;
                }
            }
            dedup.remember(&item.source_url, &item.content_hash);
        }
        Ok(())
    }

    /// Attach an already stored item to this topic as well.
    async fn link_existing(&self, topic: &Topic, url: &str) -> Result<(), StorageError> {
        if let Some(item_id) = self.store.item_id_by_url(url).await? {
            self.store.link(topic.id, item_id, self.clock.now()).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn failed_run(
        &self,
        run_id: Uuid,
        topic: &Topic,
        plan: &WindowPlan,
        started_at: DateTime<Utc>,
        api_calls: u32,
        message: String,
        traceback: String,
    ) -> CollectionRun {
        CollectionRun {
            id: run_id,
            topic_id: Some(topic.id),
            started_at,
            completed_at: self.clock.now().max(started_at),
            status: RunStatus::Error,
            query_used: plan.query.clone(),
            total_results: 0,
            new_posts: 0,
            duplicate_posts: 0,
            invalid_posts: 0,
            time_range_start: Some(plan.window.start),
            time_range_end: Some(plan.window.end),
            collection_strategy: plan.strategy,
            error_message: Some(message),
            error_traceback: (!traceback.is_empty()).then_some(traceback),
            api_calls_used: api_calls,
            metadata: json!({ "provider": self.collector.provider() }),
        }
    }

    /// Wait for a budget permit, sleeping at most `max_budget_wait` in total.
    async fn acquire_permit(&self) -> bool {
        let mut waited = Duration::ZERO;
        loop {
            match self.budget.acquire(self.clock.now()) {
                Permit::Granted => return true,
                Permit::Wait(wait) => {
                    if waited + wait > self.config.max_budget_wait {
                        return false;
                    }
                    info!(wait_secs = wait.as_secs_f64(), "waiting for call budget");
                    self.clock.sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }

    pub async fn health(&self, recent: usize) -> HealthReport {
        let now = self.clock.now();
        let mut report = HealthReport {
            checked_at: now,
            store_reachable: false,
            store_error: None,
            active_topics: 0,
            due_topics: 0,
            open_circuits: self.breaker.open_topics(now).len(),
            recent_runs: Vec::new(),
            recent_errors: Vec::new(),
            budget: self.budget.snapshot(now),
        };
        let gathered = async {
            self.store.ping().await?;
            report.store_reachable = true;
            report.active_topics = self.store.list_topics(true).await?.len();
            report.due_topics = self
                .store
                .query_due_topics(now, &self.config.frequencies)
                .await?
                .len();
            let runs = self.store.recent_runs(recent).await?;
            report.recent_errors = runs
                .iter()
                .filter(|r| r.status != RunStatus::Success)
                .map(RunDigest::from)
                .collect();
            report.recent_runs = runs.iter().map(RunDigest::from).collect();
            Ok::<(), StorageError>(())
        }
        .await;
        if let Err(err) = gathered {
            report.store_error = Some(err.to_string());
        }
        report
    }

    /// Repeated-tick scheduler for continuous mode, or `None` for a single run.
    /// A firing that finds the previous tick still running is skipped.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        interval: Option<Duration>,
        stop: StopSignal,
    ) -> Result<Option<JobScheduler>> {
        let Some(interval) = interval else {
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let engine = Arc::clone(self);
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            let stop = stop.clone();
            Box::pin(async move {
                let Ok(_running) = engine.tick_gate.try_lock() else {
                    warn!("previous tick still running; skipping this firing");
                    return;
                };
                if stop.is_stop_requested() {
                    return;
                }
                match engine.run_tick(&stop).await {
                    Ok(summary) => info!(
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        posts = summary.posts_collected,
                        "scheduled tick complete"
                    ),
                    Err(err) => error!(error = %err, "scheduled tick failed"),
                }
            })
        })
        .with_context(|| format!("creating repeated job every {}s", interval.as_secs()))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
