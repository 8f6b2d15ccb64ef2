use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itm_core::{
    CollectionRun, FrequencyTable, NewItem, NewTopic, Topic, TopicStateUpdate,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{CollectionStore, InsertOutcome, StorageError};

const TOPIC_COLUMNS: &str = "id, topic_name, search_query, description, category, active, \
    collection_priority, check_frequency_hours, last_checked, query_version, version, \
    total_posts_collected, avg_posts_per_query, run_count, created_at, updated_at";

const RUN_COLUMNS: &str = "id, topic_id, started_at, completed_at, status, query_used, \
    total_results, new_posts, duplicate_posts, invalid_posts, time_range_start, time_range_end, \
    collection_strategy, error_message, error_traceback, api_calls_used, metadata";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn non_negative_u32(value: i32, column: &str) -> Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::Decode(format!("{column}={value}")))
}

fn non_negative_u64(value: i64, column: &str) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Decode(format!("{column}={value}")))
}

fn parse_column<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StorageError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|e| StorageError::Decode(format!("{column}: {e}")))
}

fn topic_from_row(row: &PgRow) -> Result<Topic, StorageError> {
    let check_frequency_hours: Option<i32> = row.try_get("check_frequency_hours")?;
    Ok(Topic {
        id: row.try_get("id")?,
        topic_name: row.try_get("topic_name")?,
        search_query: row.try_get("search_query")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        active: row.try_get("active")?,
        priority: parse_column(row, "collection_priority")?,
        check_frequency_hours: check_frequency_hours
            .map(|h| non_negative_u32(h, "check_frequency_hours"))
            .transpose()?,
        last_checked: row.try_get("last_checked")?,
        query_version: non_negative_u32(row.try_get("query_version")?, "query_version")?,
        version: non_negative_u32(row.try_get("version")?, "version")?,
        total_posts_collected: non_negative_u64(
            row.try_get("total_posts_collected")?,
            "total_posts_collected",
        )?,
        avg_posts_per_query: row.try_get("avg_posts_per_query")?,
        run_count: non_negative_u64(row.try_get("run_count")?, "run_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<CollectionRun, StorageError> {
    Ok(CollectionRun {
        id: row.try_get("id")?,
        topic_id: row.try_get("topic_id")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: parse_column(row, "status")?,
        query_used: row.try_get("query_used")?,
        total_results: non_negative_u32(row.try_get("total_results")?, "total_results")?,
        new_posts: non_negative_u32(row.try_get("new_posts")?, "new_posts")?,
        duplicate_posts: non_negative_u32(row.try_get("duplicate_posts")?, "duplicate_posts")?,
        invalid_posts: non_negative_u32(row.try_get("invalid_posts")?, "invalid_posts")?,
        time_range_start: row.try_get("time_range_start")?,
        time_range_end: row.try_get("time_range_end")?,
        collection_strategy: parse_column(row, "collection_strategy")?,
        error_message: row.try_get("error_message")?,
        error_traceback: row.try_get("error_traceback")?,
        api_calls_used: non_negative_u32(row.try_get("api_calls_used")?, "api_calls_used")?,
        metadata: row.try_get("metadata")?,
    })
}

#[async_trait]
impl CollectionStore for PgStore {
    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn query_due_topics(
        &self,
        now: DateTime<Utc>,
        frequencies: &FrequencyTable,
    ) -> Result<Vec<Topic>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {TOPIC_COLUMNS} FROM monitored_topics WHERE active = TRUE"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut due = Vec::new();
        for row in &rows {
            let topic = topic_from_row(row)?;
            if topic.is_due(now, frequencies) {
                due.push(topic);
            }
        }
        debug!(active = rows.len(), due = due.len(), "loaded due topics");
        Ok(due)
    }

    async fn list_topics(&self, active_only: bool) -> Result<Vec<Topic>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {TOPIC_COLUMNS} FROM monitored_topics \
             WHERE ($1 = FALSE OR active = TRUE) ORDER BY topic_name"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(topic_from_row).collect()
    }

    async fn upsert_topic(
        &self,
        topic: NewTopic,
        now: DateTime<Utc>,
    ) -> Result<Topic, StorageError> {
        topic.validate()?;
        let row = sqlx::query(&format!(
            "INSERT INTO monitored_topics \
               (id, topic_name, search_query, description, category, active, \
                collection_priority, check_frequency_hours, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) \
             ON CONFLICT (topic_name) DO UPDATE SET \
               query_version = monitored_topics.query_version + \
                 CASE WHEN monitored_topics.search_query <> EXCLUDED.search_query THEN 1 ELSE 0 END, \
               query_history = CASE WHEN monitored_topics.search_query <> EXCLUDED.search_query \
                 THEN monitored_topics.query_history || jsonb_build_array(jsonb_build_object( \
                   'query', monitored_topics.search_query, \
                   'query_version', monitored_topics.query_version, \
                   'replaced_at', EXCLUDED.updated_at)) \
                 ELSE monitored_topics.query_history END, \
               search_query = EXCLUDED.search_query, \
               description = EXCLUDED.description, \
               category = EXCLUDED.category, \
               active = EXCLUDED.active, \
               collection_priority = EXCLUDED.collection_priority, \
               check_frequency_hours = EXCLUDED.check_frequency_hours, \
               version = monitored_topics.version + 1, \
               updated_at = EXCLUDED.updated_at \
             RETURNING {TOPIC_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&topic.topic_name)
        .bind(&topic.search_query)
        .bind(&topic.description)
        .bind(&topic.category)
        .bind(topic.active)
        .bind(topic.priority.as_str())
        .bind(topic.check_frequency_hours.map(to_i32))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        topic_from_row(&row)
    }

    async fn set_topic_active(
        &self,
        topic_name: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Topic, StorageError> {
        let row = sqlx::query(&format!(
            "UPDATE monitored_topics SET active = $2, version = version + 1, updated_at = $3 \
             WHERE topic_name = $1 RETURNING {TOPIC_COLUMNS}"
        ))
        .bind(topic_name)
        .bind(active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::TopicNotFound(topic_name.to_string()))?;
        topic_from_row(&row)
    }

    async fn update_topic_state(
        &self,
        topic_id: Uuid,
        update: &TopicStateUpdate,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE monitored_topics SET last_checked = $2, total_posts_collected = $3, \
             avg_posts_per_query = $4, run_count = $5, version = $6, updated_at = $2 \
             WHERE id = $1",
        )
        .bind(topic_id)
        .bind(update.last_checked)
        .bind(to_i64(update.total_posts_collected))
        .bind(update.avg_posts_per_query)
        .bind(to_i64(update.run_count))
        .bind(to_i32(update.version))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TopicNotFound(topic_id.to_string()));
        }
        Ok(())
    }

    async fn last_successful_run(
        &self,
        topic_id: Uuid,
    ) -> Result<Option<CollectionRun>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM collection_runs \
             WHERE topic_id = $1 AND status = 'success' \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn insert_run(&self, run: &CollectionRun) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO collection_runs \
               (id, topic_id, started_at, completed_at, status, query_used, total_results, \
                new_posts, duplicate_posts, invalid_posts, time_range_start, time_range_end, \
                collection_strategy, error_message, error_traceback, api_calls_used, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
        )
        .bind(run.id)
        .bind(run.topic_id)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(&run.query_used)
        .bind(to_i32(run.total_results))
        .bind(to_i32(run.new_posts))
        .bind(to_i32(run.duplicate_posts))
        .bind(to_i32(run.invalid_posts))
        .bind(run.time_range_start)
        .bind(run.time_range_end)
        .bind(run.collection_strategy.as_str())
        .bind(&run.error_message)
        .bind(&run.error_traceback)
        .bind(to_i32(run.api_calls_used))
        .bind(&run.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<CollectionRun>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM collection_runs ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn exists_by_url(&self, url: &str) -> Result<bool, StorageError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM items WHERE source_url = $1)")
                .bind(url)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn item_id_by_url(&self, url: &str) -> Result<Option<Uuid>, StorageError> {
        let id = sqlx::query_scalar("SELECT id FROM items WHERE source_url = $1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn exists_by_content_hash(&self, content_hash: &str) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM items \
             WHERE content_hash = $1 AND soft_deleted_at IS NULL)",
        )
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_item(
        &self,
        item: &NewItem,
        collected_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, StorageError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO items \
               (id, search_query, query_timestamp, source_url, source_title, source_domain, \
                source_type, content, content_hash, full_answer, metadata, relevance_score, \
                confidence_score, is_valid, tags, collected_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT (source_url) DO NOTHING \
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(&item.search_query)
        .bind(item.query_timestamp)
        .bind(&item.source_url)
        .bind(&item.source_title)
        .bind(&item.source_domain)
        .bind(item.source_type.as_str())
        .bind(&item.content)
        .bind(&item.content_hash)
        .bind(&item.full_answer)
        .bind(&item.metadata)
        .bind(item.relevance_score)
        .bind(item.confidence_score)
        .bind(item.is_valid)
        .bind(&item.tags)
        .bind(collected_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match id {
            Some(id) => InsertOutcome::Created(id),
            None => InsertOutcome::Conflict,
        })
    }

    async fn link(
        &self,
        topic_id: Uuid,
        item_id: Uuid,
        linked_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO topic_items (topic_id, item_id, linked_at) VALUES ($1, $2, $3) \
             ON CONFLICT (topic_id, item_id) DO NOTHING",
        )
        .bind(topic_id)
        .bind(item_id)
        .bind(linked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
