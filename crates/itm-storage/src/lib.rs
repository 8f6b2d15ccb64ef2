//! Persistence boundary for ITM: the store contract the engine talks to,
//! an in-memory store and a Postgres store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itm_core::{
    CollectionRun, FrequencyTable, NewItem, NewTopic, Topic, TopicError, TopicStateUpdate,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{MemoryStore, TopicItemLink};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "itm-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("topic `{0}` not found")]
    TopicNotFound(String),
    #[error("invalid stored value: {0}")]
    Decode(String),
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Result of inserting an item keyed by its source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(Uuid),
    /// The URL is already stored; callers count this as a duplicate.
    Conflict,
}

/// Store contract used by the collection engine. Every call is atomic at the
/// single-row level; nothing here spans topics.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;

    async fn query_due_topics(
        &self,
        now: DateTime<Utc>,
        frequencies: &FrequencyTable,
    ) -> Result<Vec<Topic>, StorageError>;

    async fn list_topics(&self, active_only: bool) -> Result<Vec<Topic>, StorageError>;

    /// Create a topic or update the one with the same name. A changed query
    /// bumps `query_version`; any change bumps `version`.
    async fn upsert_topic(&self, topic: NewTopic, now: DateTime<Utc>)
        -> Result<Topic, StorageError>;

    async fn set_topic_active(
        &self,
        topic_name: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Topic, StorageError>;

    async fn update_topic_state(
        &self,
        topic_id: Uuid,
        update: &TopicStateUpdate,
    ) -> Result<(), StorageError>;

    async fn last_successful_run(
        &self,
        topic_id: Uuid,
    ) -> Result<Option<CollectionRun>, StorageError>;

    async fn insert_run(&self, run: &CollectionRun) -> Result<(), StorageError>;

    async fn recent_runs(&self, limit: usize) -> Result<Vec<CollectionRun>, StorageError>;

    async fn exists_by_url(&self, url: &str) -> Result<bool, StorageError>;

    async fn item_id_by_url(&self, url: &str) -> Result<Option<Uuid>, StorageError>;

    async fn exists_by_content_hash(&self, content_hash: &str) -> Result<bool, StorageError>;

    async fn insert_item(
        &self,
        item: &NewItem,
        collected_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, StorageError>;

    /// Link an item to a topic. Linking the same pair twice is a no-op.
    async fn link(
        &self,
        topic_id: Uuid,
        item_id: Uuid,
        linked_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint of item content: trimmed, case-folded, whitespace-collapsed, SHA-256.
pub fn content_fingerprint(content: &str) -> String {
    let normalized = content
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    sha256_hex(normalized.as_bytes())
}
