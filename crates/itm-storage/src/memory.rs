use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itm_core::{
    CollectionRun, FrequencyTable, Item, NewItem, NewTopic, Topic, TopicStateUpdate,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{CollectionStore, InsertOutcome, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicItemLink {
    pub topic_id: Uuid,
    pub item_id: Uuid,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    topics: Vec<Topic>,
    items: Vec<Item>,
    url_index: HashMap<String, Uuid>,
    live_hashes: HashSet<String>,
    links: Vec<TopicItemLink>,
    runs: Vec<CollectionRun>,
}

/// Process-local store with the same conflict semantics as the Postgres schema.
/// `set_unavailable(true)` makes every call fail, to exercise outage paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    pub async fn topic(&self, topic_id: Uuid) -> Option<Topic> {
        let state = self.state.lock().await;
        state.topics.iter().find(|t| t.id == topic_id).cloned()
    }

    pub async fn topic_by_name(&self, topic_name: &str) -> Option<Topic> {
        let state = self.state.lock().await;
        state
            .topics
            .iter()
            .find(|t| t.topic_name == topic_name)
            .cloned()
    }

    pub async fn items(&self) -> Vec<Item> {
        self.state.lock().await.items.clone()
    }

    pub async fn runs(&self) -> Vec<CollectionRun> {
        self.state.lock().await.runs.clone()
    }

    pub async fn links(&self) -> Vec<TopicItemLink> {
        self.state.lock().await.links.clone()
    }

    /// Replace a topic wholesale; test setup uses this to backdate `last_checked`.
    pub async fn put_topic(&self, topic: Topic) {
        let mut state = self.state.lock().await;
        match state.topics.iter_mut().find(|t| t.id == topic.id) {
            Some(existing) => *existing = topic,
            None => state.topics.push(topic),
        }
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.check_available()
    }

    async fn query_due_topics(
        &self,
        now: DateTime<Utc>,
        frequencies: &FrequencyTable,
    ) -> Result<Vec<Topic>, StorageError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .topics
            .iter()
            .filter(|t| t.is_due(now, frequencies))
            .cloned()
            .collect())
    }

    async fn list_topics(&self, active_only: bool) -> Result<Vec<Topic>, StorageError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .topics
            .iter()
            .filter(|t| !active_only || t.active)
            .cloned()
            .collect())
    }

    async fn upsert_topic(
        &self,
        topic: NewTopic,
        now: DateTime<Utc>,
    ) -> Result<Topic, StorageError> {
        self.check_available()?;
        topic.validate()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .topics
            .iter_mut()
            .find(|t| t.topic_name == topic.topic_name)
        {
            if existing.search_query != topic.search_query {
                existing.query_version += 1;
            }
            existing.search_query = topic.search_query;
            existing.description = topic.description;
            existing.category = topic.category;
            existing.priority = topic.priority;
            existing.check_frequency_hours = topic.check_frequency_hours;
            existing.active = topic.active;
            existing.version += 1;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let created = topic.into_topic(Uuid::new_v4(), now);
        state.topics.push(created.clone());
        Ok(created)
    }

    async fn set_topic_active(
        &self,
        topic_name: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Topic, StorageError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let topic = state
            .topics
            .iter_mut()
            .find(|t| t.topic_name == topic_name)
            .ok_or_else(|| StorageError::TopicNotFound(topic_name.to_string()))?;
        topic.active = active;
        topic.version += 1;
        topic.updated_at = now;
        Ok(topic.clone())
    }

    async fn update_topic_state(
        &self,
        topic_id: Uuid,
        update: &TopicStateUpdate,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let topic = state
            .topics
            .iter_mut()
            .find(|t| t.id == topic_id)
            .ok_or_else(|| StorageError::TopicNotFound(topic_id.to_string()))?;
        update.apply_to(topic);
        Ok(())
    }

    async fn last_successful_run(
        &self,
        topic_id: Uuid,
    ) -> Result<Option<CollectionRun>, StorageError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.topic_id == Some(topic_id) && r.is_success())
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn insert_run(&self, run: &CollectionRun) -> Result<(), StorageError> {
        self.check_available()?;
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<CollectionRun>, StorageError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn exists_by_url(&self, url: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        Ok(self.state.lock().await.url_index.contains_key(url))
    }

    async fn item_id_by_url(&self, url: &str) -> Result<Option<Uuid>, StorageError> {
        self.check_available()?;
        Ok(self.state.lock().await.url_index.get(url).copied())
    }

    async fn exists_by_content_hash(&self, content_hash: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        Ok(self.state.lock().await.live_hashes.contains(content_hash))
    }

    async fn insert_item(
        &self,
        item: &NewItem,
        collected_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, StorageError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.url_index.contains_key(&item.source_url) {
            return Ok(InsertOutcome::Conflict);
        }
        let id = Uuid::new_v4();
        state.url_index.insert(item.source_url.clone(), id);
        state.live_hashes.insert(item.content_hash.clone());
        state.items.push(Item {
            id,
            collected_at,
            soft_deleted_at: None,
            data: item.clone(),
        });
        Ok(InsertOutcome::Created(id))
    }

    async fn link(
        &self,
        topic_id: Uuid,
        item_id: Uuid,
        linked_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state
            .links
            .iter()
            .any(|l| l.topic_id == topic_id && l.item_id == item_id)
        {
            return Ok(());
        }
        state.links.push(TopicItemLink {
            topic_id,
            item_id,
            linked_at,
        });
        Ok(())
    }
}
