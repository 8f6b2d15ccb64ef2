use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::clock::{to_chrono, to_std};

/// Answer to a permit request. `Wait` never blocks; the caller decides
/// whether to sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Granted,
    Wait(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub minute_used: u32,
    pub minute_limit: u32,
    pub day_used: u32,
    pub day_limit: u32,
    pub blocked_until: Option<DateTime<Utc>>,
    pub last_grant: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BudgetState {
    minute_start: Option<DateTime<Utc>>,
    minute_count: u32,
    day_start: Option<DateTime<Utc>>,
    day_count: u32,
    blocked_until: Option<DateTime<Utc>>,
    last_grant: Option<DateTime<Utc>>,
}

/// Process-wide call budget with per-minute and per-day ceilings that reset
/// on wall-clock boundaries.
#[derive(Debug)]
pub struct RateBudget {
    per_minute: u32,
    per_day: u32,
    min_spacing: Duration,
    offset: FixedOffset,
    state: Mutex<BudgetState>,
}

impl RateBudget {
    pub fn new(per_minute: u32, per_day: u32, min_spacing: Duration, offset: FixedOffset) -> Self {
        Self {
            per_minute,
            per_day,
            min_spacing,
            offset,
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub fn from_config(config: &crate::EngineConfig) -> Self {
        Self::new(
            config.max_queries_per_minute,
            config.max_queries_per_day,
            config.query_delay,
            config.utc_offset().unwrap_or_else(|| Utc.fix()),
        )
    }

    pub fn acquire(&self, now: DateTime<Utc>) -> Permit {
        let mut state = self.lock();
        self.roll(&mut state, now);

        let mut wait = chrono::Duration::zero();
        if let Some(until) = state.blocked_until {
            wait = wait.max(until - now);
        }
        if state.minute_count >= self.per_minute {
            wait = wait.max(next_minute(now) - now);
        }
        if state.day_count >= self.per_day {
            wait = wait.max(self.next_day(now) - now);
        }
        if let Some(last) = state.last_grant {
            wait = wait.max(last + to_chrono(self.min_spacing) - now);
        }

        if wait > chrono::Duration::zero() {
            return Permit::Wait(to_std(wait));
        }

        state.minute_count += 1;
        state.day_count += 1;
        state.last_grant = Some(now);
        state.blocked_until = None;
        Permit::Granted
    }

    /// Make the next `acquire` wait at least `duration` from `now`.
    pub fn penalize(&self, duration: Duration, now: DateTime<Utc>) {
        let mut state = self.lock();
        let until = now + to_chrono(duration);
        state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> BudgetSnapshot {
        let state = self.lock();
        let minute_used = if state.minute_start == Some(minute_floor(now)) {
            state.minute_count
        } else {
            0
        };
        let day_used = if state.day_start == Some(self.day_floor(now)) {
            state.day_count
        } else {
            0
        };
        BudgetSnapshot {
            minute_used,
            minute_limit: self.per_minute,
            day_used,
            day_limit: self.per_day,
            blocked_until: state.blocked_until.filter(|b| *b > now),
            last_grant: state.last_grant,
        }
    }

    fn roll(&self, state: &mut BudgetState, now: DateTime<Utc>) {
        let minute = minute_floor(now);
        if state.minute_start != Some(minute) {
            state.minute_start = Some(minute);
            state.minute_count = 0;
        }
        let day = self.day_floor(now);
        if state.day_start != Some(day) {
            state.day_start = Some(day);
            state.day_count = 0;
        }
    }

    /// Midnight of `now`'s day in the reference zone.
    fn day_floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset).date_naive();
        local
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.offset.from_local_datetime(&midnight).single())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now)
    }

    fn next_day(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.day_floor(now) + chrono::Duration::days(1)
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn minute_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    minute_floor(now) + chrono::Duration::minutes(1)
}
