use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::clock::to_chrono;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BreakerEntry {
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
}

/// Per-topic circuit breaker. Entries appear on the first failure and are
/// dropped on the first success after it.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    entries: Mutex<HashMap<Uuid, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, topic_id: Uuid, now: DateTime<Utc>) -> bool {
        self.open_until(topic_id, now).is_none()
    }

    /// End of the open period if the breaker is open at `now`.
    pub fn open_until(&self, topic_id: Uuid, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lock()
            .get(&topic_id)
            .and_then(|e| e.open_until)
            .filter(|until| *until > now)
    }

    pub fn record_success(&self, topic_id: Uuid) {
        self.lock().remove(&topic_id);
    }

    /// Count a failure; opening the breaker for `cooldown` once the threshold
    /// is reached. Returns true when this call opened it.
    pub fn record_failure(&self, topic_id: Uuid, now: DateTime<Utc>, cooldown: Duration) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(topic_id).or_insert(BreakerEntry {
            consecutive_failures: 0,
            open_until: None,
        });
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.failure_threshold {
            let until = now + to_chrono(cooldown);
            entry.open_until = Some(until);
            warn!(
                %topic_id,
                failures = entry.consecutive_failures,
                open_until = %until,
                "circuit opened"
            );
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self, topic_id: Uuid) -> u32 {
        self.lock()
            .get(&topic_id)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }

    /// Topics whose breaker is open at `now`.
    pub fn open_topics(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.open_until.is_some_and(|until| until > now))
            .map(|(id, _)| *id)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, BreakerEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
