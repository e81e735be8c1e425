//! Per-minute time series shared by the scheduler and the exception store

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One minute of aggregated samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBucket<B> {
    /// Minutes since the Unix epoch
    pub minute: i64,
    #[serde(flatten)]
    pub data: B,
}

/// Ring buffer of one-minute buckets.
///
/// Buckets are strictly increasing in `minute` and the buffer never holds more
/// than `capacity` of them; the oldest bucket is evicted first. A sample
/// stamped before the newest bucket is folded into the newest bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteSeries<B> {
    buckets: VecDeque<MinuteBucket<B>>,
    capacity: usize,
}

impl<B: Default> MinuteSeries<B> {
    /// Default number of buckets kept (one hour)
    pub const DEFAULT_CAPACITY: usize = 60;

    /// Create an empty series holding one hour
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create an empty series with a custom bucket limit
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buckets: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Bucket for the minute containing `at`, created if needed
    pub fn bucket_mut(&mut self, at: DateTime<Utc>) -> &mut B {
        let minute = at.timestamp().div_euclid(60);
        let needs_new = self.buckets.back().map_or(true, |last| minute > last.minute);

        if needs_new {
            self.buckets.push_back(MinuteBucket {
                minute,
                data: B::default(),
            });
            while self.buckets.len() > self.capacity {
                self.buckets.pop_front();
            }
        }

        let newest = self.buckets.len() - 1;
        &mut self.buckets[newest].data
    }

    /// Number of buckets held
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no sample was recorded yet
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &MinuteBucket<B>> {
        self.buckets.iter()
    }
}

impl<B: Default + Clone> MinuteSeries<B> {
    /// Copy of the newest `n` buckets, oldest first
    pub fn tail(&self, n: usize) -> Vec<MinuteBucket<B>> {
        let skip = self.buckets.len().saturating_sub(n);
        self.buckets.iter().skip(skip).cloned().collect()
    }
}

impl<B: Default> Default for MinuteSeries<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler outcomes in one minute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBucket {
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Exceptions handled in one minute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionBucket {
    pub count: u64,
    pub categories: BTreeMap<String, u64>,
}

/// Direction of the exception rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at_minute(m: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(m * 60 + 5, 0).unwrap()
    }

    #[test]
    fn test_same_minute_shares_bucket() {
        let mut series: MinuteSeries<RetryBucket> = MinuteSeries::new();
        series.bucket_mut(at_minute(10)).retries += 1;
        series.bucket_mut(at_minute(10) + Duration::seconds(30)).retries += 1;

        assert_eq!(series.len(), 1);
        assert_eq!(series.tail(1)[0].data.retries, 2);
    }

    #[test]
    fn test_evicts_oldest_beyond_capacity() {
        let mut series: MinuteSeries<RetryBucket> = MinuteSeries::new();
        for m in 0..75 {
            series.bucket_mut(at_minute(m)).successes += 1;
        }

        assert_eq!(series.len(), 60);
        let minutes: Vec<i64> = series.iter().map(|b| b.minute).collect();
        assert_eq!(minutes.first(), Some(&15));
        assert_eq!(minutes.last(), Some(&74));
        assert!(minutes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_late_sample_folds_into_newest() {
        let mut series: MinuteSeries<ExceptionBucket> = MinuteSeries::new();
        series.bucket_mut(at_minute(20)).count += 1;
        series.bucket_mut(at_minute(19)).count += 1;

        assert_eq!(series.len(), 1);
        assert_eq!(series.tail(1)[0].minute, 20);
        assert_eq!(series.tail(1)[0].data.count, 2);
    }
}
