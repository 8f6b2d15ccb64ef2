use std::collections::HashSet;

use itm_storage::{content_fingerprint, CollectionStore, StorageError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupVerdict {
    New,
    DuplicateByUrl,
    DuplicateByContent,
}

/// Duplicate detection for one run. The URL verdict is authoritative; the
/// store's unique constraint backs it up. Seen keys are cached so repeated
/// citations in one response do not hit the store again.
pub struct Deduplicator<'a> {
    store: &'a dyn CollectionStore,
    enabled: bool,
    seen_urls: HashSet<String>,
    seen_hashes: HashSet<String>,
}

impl<'a> Deduplicator<'a> {
    pub fn new(store: &'a dyn CollectionStore, enabled: bool) -> Self {
        Self {
            store,
            enabled,
            seen_urls: HashSet::new(),
            seen_hashes: HashSet::new(),
        }
    }

    pub async fn check(&mut self, url: &str, content: &str) -> Result<DedupVerdict, StorageError> {
        let verdict = self.check_url(url).await?;
        if verdict != DedupVerdict::New {
            return Ok(verdict);
        }
        self.check_content_hash(&content_fingerprint(content)).await
    }

    pub async fn check_url(&mut self, url: &str) -> Result<DedupVerdict, StorageError> {
        if !self.enabled {
            return Ok(DedupVerdict::New);
        }
        if self.seen_urls.contains(url) {
            return Ok(DedupVerdict::DuplicateByUrl);
        }
        if self.store.exists_by_url(url).await? {
            self.seen_urls.insert(url.to_string());
            return Ok(DedupVerdict::DuplicateByUrl);
        }
        Ok(DedupVerdict::New)
    }

    pub async fn check_content_hash(&mut self, content_hash: &str) -> Result<DedupVerdict, StorageError> {
        if !self.enabled {
            return Ok(DedupVerdict::New);
        }
        if self.seen_hashes.contains(content_hash)
            || self.store.exists_by_content_hash(content_hash).await?
        {
            return Ok(DedupVerdict::DuplicateByContent);
        }
        Ok(DedupVerdict::New)
    }

    /// Record keys of an item handled in this run.
    pub fn remember(&mut self, url: &str, content_hash: &str) {
        self.seen_urls.insert(url.to_string());
        self.seen_hashes.insert(content_hash.to_string());
    }
}
