//! Outcome history, running counters and statistics for the scheduler

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::limits::CooldownStatus;
use crate::models::{MinuteBucket, MinuteSeries, RetryBucket};

/// Outcomes inspected by the failure-rate monitor
pub const MONITOR_WINDOW: usize = 100;

/// Minimum outcomes before the failure rate is evaluated
pub const MONITOR_MIN_SAMPLES: usize = 10;

const RECENT_LIMIT: usize = 20;
const SERIES_LIMIT: usize = 30;

/// Terminal outcome of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// One finished task
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub task_id: Uuid,
    pub category: String,
    pub outcome: Outcome,
    pub attempts: u32,
    pub error: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Failure share over the recent window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureRate {
    pub failures: usize,
    pub total: usize,
    pub rate: f64,
}

/// Per-category counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

/// Running totals
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overview {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_attempts: f64,
    /// Percentage of finished tasks that succeeded
    pub success_rate: f64,
}

/// Hourly attempt budget usage
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub used: u32,
    pub limit: u32,
}

/// Snapshot returned by `RetryScheduler::statistics`
#[derive(Debug, Clone, Serialize)]
pub struct RetryStatistics {
    pub overview: Overview,
    pub by_category: BTreeMap<String, CategoryStats>,
    /// Newest finished tasks inside the requested range
    pub recent: Vec<HistoryEntry>,
    pub time_series: Vec<MinuteBucket<RetryBucket>>,
    pub active: usize,
    pub queued: usize,
    pub cooldown: CooldownStatus,
    pub hourly_budget: BudgetStatus,
}

/// Ledger contents copied out for statistics
pub(crate) struct LedgerView {
    pub overview: Overview,
    pub by_category: BTreeMap<String, CategoryStats>,
    pub recent: Vec<HistoryEntry>,
    pub time_series: Vec<MinuteBucket<RetryBucket>>,
}

/// Counters and bounded history owned by the scheduler state
#[derive(Debug)]
pub(crate) struct Ledger {
    overview: Overview,
    attempts_total: u64,
    by_category: BTreeMap<String, CategoryStats>,
    history: VecDeque<HistoryEntry>,
    series: MinuteSeries<RetryBucket>,
    max_history: usize,
    store_history: bool,
}

impl Ledger {
    pub fn new(max_history: usize, store_history: bool) -> Self {
        Self {
            overview: Overview::default(),
            attempts_total: 0,
            by_category: BTreeMap::new(),
            history: VecDeque::new(),
            series: MinuteSeries::new(),
            max_history: max_history.max(2),
            store_history,
        }
    }

    /// Count a scheduled retry in the time series
    pub fn record_retry(&mut self, at: DateTime<Utc>) {
        self.series.bucket_mut(at).retries += 1;
    }

    pub fn record_cancelled(&mut self) {
        self.overview.cancelled += 1;
    }

    /// Count a terminal outcome
    pub fn record(&mut self, entry: HistoryEntry) {
        let success = entry.outcome == Outcome::Success;

        self.overview.total += 1;
        self.attempts_total += u64::from(entry.attempts);
        if success {
            self.overview.successful += 1;
        } else {
            self.overview.failed += 1;
        }
        self.overview.average_attempts =
            round2(self.attempts_total as f64 / self.overview.total as f64);
        self.overview.success_rate =
            round2(self.overview.successful as f64 * 100.0 / self.overview.total as f64);

        let category = self.by_category.entry(entry.category.clone()).or_default();
        category.total += 1;
        if success {
            category.successful += 1;
        } else {
            category.failed += 1;
        }

        let bucket = self.series.bucket_mut(entry.timestamp);
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }

        if self.store_history {
            self.history.push_back(entry);
            if self.history.len() > self.max_history {
                let keep = self.max_history / 2;
                let excess = self.history.len() - keep;
                self.history.drain(..excess);
            }
        }
    }

    /// Failure share among the newest `MONITOR_WINDOW` outcomes
    pub fn failure_rate(&self) -> Option<FailureRate> {
        let total = self.history.len().min(MONITOR_WINDOW);
        if total < MONITOR_MIN_SAMPLES {
            return None;
        }
        let failures = self
            .history
            .iter()
            .rev()
            .take(total)
            .filter(|e| e.outcome == Outcome::Failure)
            .count();
        Some(FailureRate {
            failures,
            total,
            rate: failures as f64 / total as f64,
        })
    }

    /// Drop history older than `cutoff`; returns how many entries went
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.history.len();
        self.history.retain(|e| e.timestamp >= cutoff);
        before - self.history.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Counters and series, with `recent` restricted to entries newer than `since`
    pub fn snapshot(&self, since: Option<DateTime<Utc>>) -> LedgerView {
        let in_range: Vec<&HistoryEntry> = self
            .history
            .iter()
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .collect();
        let skip = in_range.len().saturating_sub(RECENT_LIMIT);
        let recent = in_range.into_iter().skip(skip).cloned().collect();

        LedgerView {
            overview: self.overview.clone(),
            by_category: self.by_category.clone(),
            recent,
            time_series: self.series.tail(SERIES_LIMIT),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
