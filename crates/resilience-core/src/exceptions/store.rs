//! Classified exception store

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::snapshot::{ExceptionCounters, Snapshot, SnapshotStore};
use crate::alerting::AlertManager;
use crate::classifier::ErrorClassifier;
use crate::clock::{SharedClock, TokioClock};
use crate::config::PersistenceConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::models::{
    Alert, ClassifiedException, ErrorContext, ErrorDetails, ExceptionBucket, LogEntry, MinuteBucket,
    OperationError, Resolution, RetryPolicy, SearchCriteria, SearchResults, Severity, Trend,
};

const RECENT_LIMIT: usize = 10;

/// Exception rates over the last hour and day
#[derive(Debug, Clone, Serialize)]
pub struct Trends {
    /// Entries in the last hour
    pub hourly_rate: usize,
    /// Entries in the last 24 hours
    pub daily_rate: usize,
    /// Last hour against the 23 hours before it
    pub trend: Trend,
}

/// Snapshot returned by `ExceptionStore::statistics`
#[derive(Debug, Clone, Serialize)]
pub struct ExceptionStatistics {
    /// Log entries inside the requested range
    pub total: usize,
    pub by_level: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_component: BTreeMap<String, usize>,
    pub recent: Vec<LogEntry>,
    pub trends: Trends,
    /// Counters since the store was created
    pub running: ExceptionCounters,
    pub time_series: Vec<MinuteBucket<ExceptionBucket>>,
    /// Records currently held
    pub stored: usize,
    pub unresolved: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<Uuid, ClassifiedException>,
    /// Insertion order of `records`
    order: VecDeque<Uuid>,
    logs: VecDeque<LogEntry>,
    counters: ExceptionCounters,
}

impl StoreState {
    fn insert(&mut self, exception: ClassifiedException, max_entries: usize) {
        self.logs.push_back(LogEntry::from(&exception));
        self.order.push_back(exception.id);
        self.records.insert(exception.id, exception);

        if self.records.len() > max_entries {
            let keep = max_entries / 2;
            while self.order.len() > keep {
                if let Some(id) = self.order.pop_front() {
                    self.records.remove(&id);
                }
            }
            debug!(kept = keep, "Exception store truncated");
        }
        if self.logs.len() > max_entries {
            let excess = self.logs.len() - max_entries / 2;
            self.logs.drain(..excess);
        }
    }

    fn count(&mut self, exception: &ClassifiedException) {
        let counters = &mut self.counters;
        let category = exception.category.as_str().to_string();
        counters.total += 1;
        *counters.by_category.entry(category.clone()).or_default() += 1;
        *counters
            .by_severity
            .entry(exception.severity.as_str().to_string())
            .or_default() += 1;
        *counters
            .by_component
            .entry(exception.context.component_or_unknown().to_string())
            .or_default() += 1;

        let bucket = counters.time_series.bucket_mut(exception.timestamp);
        bucket.count += 1;
        *bucket.categories.entry(category).or_default() += 1;
    }

    fn snapshot(&self, alerts: Vec<(Uuid, Alert)>, now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            logs: self.logs.iter().cloned().collect(),
            exceptions: self
                .order
                .iter()
                .filter_map(|id| self.records.get(id).map(|r| (*id, r.clone())))
                .collect(),
            statistics: self.counters.clone(),
            alerts,
            timestamp: now,
        }
    }
}

struct StoreInner {
    config: PersistenceConfig,
    classifier: ErrorClassifier,
    default_policy: RetryPolicy,
    clock: SharedClock,
    events: EventBus,
    alerts: Option<AlertManager>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    state: Mutex<StoreState>,
}

/// Builder for [`ExceptionStore`]
pub struct ExceptionStoreBuilder {
    config: PersistenceConfig,
    classifier: ErrorClassifier,
    default_policy: RetryPolicy,
    clock: Option<SharedClock>,
    events: Option<EventBus>,
    alerts: Option<AlertManager>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl ExceptionStoreBuilder {
    #[must_use]
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Policy merged under the classifier's strategies
    #[must_use]
    pub fn default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Manager every handled exception is routed to
    #[must_use]
    pub fn alerts(mut self, alerts: AlertManager) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Persistence backend; without one the store is memory-only
    #[must_use]
    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn build(self) -> ExceptionStore {
        ExceptionStore {
            inner: Arc::new(StoreInner {
                config: self.config,
                classifier: self.classifier,
                default_policy: self.default_policy,
                clock: self.clock.unwrap_or_else(TokioClock::shared),
                events: self.events.unwrap_or_default(),
                alerts: self.alerts,
                snapshots: self.snapshots,
                state: Mutex::new(StoreState::default()),
            }),
        }
    }
}

/// Classifies, stores and routes exceptions; cheap to clone
#[derive(Clone)]
pub struct ExceptionStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ExceptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionStore")
            .field("len", &self.len())
            .finish()
    }
}

impl ExceptionStore {
    pub fn builder(config: PersistenceConfig) -> ExceptionStoreBuilder {
        ExceptionStoreBuilder {
            config,
            classifier: ErrorClassifier::default(),
            default_policy: RetryPolicy::default(),
            clock: None,
            events: None,
            alerts: None,
            snapshots: None,
        }
    }

    /// Classify, store and route a failure. Never fails.
    pub async fn handle(
        &self,
        error: &OperationError,
        context: ErrorContext,
    ) -> ClassifiedException {
        let inner = &self.inner;
        let verdict = inner
            .classifier
            .classify(error, &context, &inner.default_policy);

        let message = error.message.to_lowercase();
        let escalated = message.contains("critical") || message.contains("fatal");
        let severity = if escalated {
            Severity::Critical
        } else {
            verdict.severity
        };

        let context = normalize_context(context);
        let mut tags: Vec<String> = verdict
            .error_type
            .tags()
            .iter()
            .map(|t| t.to_string())
            .collect();
        if escalated {
            tags.push("system-critical".to_string());
        }
        if let Some(workflow) = &context.workflow_id {
            tags.push(format!("workflow:{workflow}"));
        }
        if let Some(task) = &context.task_id {
            tags.push(format!("task:{task}"));
        }
        if let Some(execution) = &context.execution_id {
            tags.push(format!("execution:{execution}"));
        }
        for tag in &context.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        let exception = ClassifiedException {
            id: Uuid::new_v4(),
            timestamp: inner.clock.now(),
            error: ErrorDetails::from(error),
            context,
            category: verdict.error_type,
            severity,
            retryable: verdict.retryable,
            tags,
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        };

        {
            let mut state = inner.state.lock();
            state.count(&exception);
            state.insert(exception.clone(), inner.config.max_entries);
        }

        debug!(
            exception_id = %exception.id,
            category = %exception.category,
            severity = %exception.severity,
            component = exception.context.component_or_unknown(),
            "Exception handled"
        );
        inner.events.publish(LifecycleEvent::ExceptionHandled {
            exception_id: exception.id,
            category: exception.category,
            severity: exception.severity,
        });

        if let Some(alerts) = &inner.alerts {
            alerts.route(&exception).await;
        }

        self.persist().await;
        exception
    }

    /// Mark an exception resolved and resolve the alerts raised for it.
    /// Resolving an already resolved record returns it unchanged.
    pub async fn resolve(&self, id: Uuid, resolution: Resolution) -> Result<ClassifiedException> {
        let now = self.inner.clock.now();
        let resolved = {
            let mut state = self.inner.state.lock();
            let record = state
                .records
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("exception", id.to_string()))?;

            if record.resolved {
                return Ok(record.clone());
            }

            record.resolved = true;
            record.resolved_at = Some(now);
            record.resolved_by = Some(
                resolution
                    .resolved_by
                    .unwrap_or_else(|| "system".to_string()),
            );
            record.resolution_note = resolution.note;
            record.clone()
        };

        let resolved_by = resolved.resolved_by.clone().unwrap_or_default();
        info!(exception_id = %id, resolved_by = %resolved_by, "Exception resolved");
        self.inner.events.publish(LifecycleEvent::ExceptionResolved {
            exception_id: id,
            resolved_by,
        });

        if let Some(alerts) = &self.inner.alerts {
            alerts.resolve_for_exception(id);
        }

        self.persist().await;
        Ok(resolved)
    }

    /// Filter and paginate stored exceptions, oldest first
    pub fn search(&self, criteria: &SearchCriteria) -> SearchResults<ClassifiedException> {
        let state = self.inner.state.lock();
        let matched: Vec<&ClassifiedException> = state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|record| criteria.matches(record))
            .collect();

        let limit = criteria.limit.unwrap_or(SearchCriteria::DEFAULT_LIMIT);
        let total = matched.len();
        let results = matched
            .into_iter()
            .skip(criteria.offset)
            .take(limit)
            .cloned()
            .collect();

        SearchResults {
            results,
            total,
            has_more: total > criteria.offset.saturating_add(limit),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<ClassifiedException> {
        self.inner.state.lock().records.get(&id).cloned()
    }

    /// Records currently held
    pub fn len(&self) -> usize {
        self.inner.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Breakdowns over log entries newer than `now - time_range`, plus running counters
    pub fn statistics(&self, time_range: Option<Duration>) -> ExceptionStatistics {
        let now = self.inner.clock.now();
        let since = time_range
            .and_then(|range| chrono::Duration::from_std(range).ok())
            .map(|range| now - range);

        let state = self.inner.state.lock();
        let logs: Vec<&LogEntry> = state
            .logs
            .iter()
            .filter(|log| since.map_or(true, |s| log.timestamp >= s))
            .collect();

        let mut by_level: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_component: BTreeMap<String, usize> = BTreeMap::new();
        for log in &logs {
            *by_level.entry(log.level.clone()).or_default() += 1;
            *by_category.entry(log.category.as_str().to_string()).or_default() += 1;
            *by_severity.entry(log.severity.as_str().to_string()).or_default() += 1;
            *by_component.entry(log.component.clone()).or_default() += 1;
        }

        let skip = logs.len().saturating_sub(RECENT_LIMIT);
        let recent = logs.iter().skip(skip).map(|log| (*log).clone()).collect();

        ExceptionStatistics {
            total: logs.len(),
            by_level,
            by_category,
            by_severity,
            by_component,
            recent,
            trends: trends(&logs, now),
            running: state.counters.clone(),
            time_series: state.counters.time_series.tail(60),
            stored: state.records.len(),
            unresolved: state.records.values().filter(|r| !r.resolved).count(),
        }
    }

    /// Load the persisted snapshot; returns how many records were restored
    pub async fn load(&self) -> usize {
        let Some(snapshots) = self.inner.snapshots.as_ref().filter(|_| self.inner.config.enabled)
        else {
            return 0;
        };

        let snapshot = match snapshots.load().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Failed to load exception snapshot, continuing in memory");
                return 0;
            }
        };

        let max_entries = self.inner.config.max_entries;
        let restored = {
            let mut state = self.inner.state.lock();
            let skip_logs = snapshot.logs.len().saturating_sub(max_entries);
            state.logs = snapshot.logs.into_iter().skip(skip_logs).collect();

            let skip_records = snapshot.exceptions.len().saturating_sub(max_entries);
            state.records.clear();
            state.order.clear();
            for (id, record) in snapshot.exceptions.into_iter().skip(skip_records) {
                state.order.push_back(id);
                state.records.insert(id, record);
            }
            state.counters = snapshot.statistics;
            state.records.len()
        };

        if let Some(alerts) = &self.inner.alerts {
            alerts.restore(snapshot.alerts);
        }

        info!(restored, "Exception snapshot loaded");
        restored
    }

    /// Evict resolved records past the retention window, then persist.
    /// Returns how many records were evicted.
    pub async fn run_maintenance(&self) -> usize {
        if !self.inner.config.auto_cleanup {
            return 0;
        }

        let now = self.inner.clock.now();
        let cutoff = now - self.inner.config.retention();
        let max_entries = self.inner.config.max_entries;

        let (evicted, remaining) = {
            let mut state = self.inner.state.lock();
            let expired: Vec<Uuid> = state
                .records
                .values()
                .filter(|r| r.resolved && r.resolved_at.is_some_and(|at| at < cutoff))
                .map(|r| r.id)
                .collect();

            for id in &expired {
                state.records.remove(id);
            }
            let StoreState { order, records, .. } = &mut *state;
            order.retain(|id| records.contains_key(id));

            if state.logs.len() > max_entries {
                let excess = state.logs.len() - max_entries / 2;
                state.logs.drain(..excess);
            }
            (expired.len(), state.records.len())
        };

        if evicted > 0 {
            info!(evicted, remaining, "Evicted resolved exceptions");
        }
        self.inner.events.publish(LifecycleEvent::MaintenancePerformed {
            component: "exception_store".to_string(),
            active: remaining,
            queued: 0,
            reclaimed: evicted,
        });

        self.persist().await;
        evicted
    }

    /// Run maintenance every `cleanup_interval`
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let store = self.clone();
        let interval = self.inner.config.cleanup_interval();
        info!(interval_ms = interval.as_millis() as u64, "Starting exception store cleanup");

        tokio::spawn(async move {
            loop {
                store.inner.clock.sleep(interval).await;
                store.run_maintenance().await;
            }
        })
    }

    /// Save a snapshot; failures are logged and the store stays memory-only
    pub async fn persist(&self) {
        let inner = &self.inner;
        let Some(snapshots) = inner.snapshots.as_ref().filter(|_| inner.config.enabled) else {
            return;
        };

        let alerts = inner
            .alerts
            .as_ref()
            .map(AlertManager::snapshot_entries)
            .unwrap_or_default();
        let snapshot = inner.state.lock().snapshot(alerts, inner.clock.now());

        if let Err(e) = snapshots.save(&snapshot).await {
            error!(error = %e, "Failed to persist exception snapshot");
        }
    }
}

/// Fill the fields every record carries
fn normalize_context(mut context: ErrorContext) -> ErrorContext {
    if context.component.is_none() {
        context.component = Some("unknown".to_string());
    }
    if context.operation.is_none() {
        context.operation = Some("unknown".to_string());
    }
    if context.request_id.is_none() {
        context.request_id = Some(Uuid::new_v4().to_string());
    }
    context
}

fn trends(logs: &[&LogEntry], now: DateTime<Utc>) -> Trends {
    let hour_ago = now - chrono::Duration::hours(1);
    let day_ago = now - chrono::Duration::hours(24);

    let hourly_rate = logs.iter().filter(|l| l.timestamp >= hour_ago).count();
    let daily_rate = logs.iter().filter(|l| l.timestamp >= day_ago).count();
    let earlier = daily_rate - hourly_rate;

    let trend = match hourly_rate.cmp(&earlier) {
        std::cmp::Ordering::Greater => Trend::Increasing,
        std::cmp::Ordering::Less => Trend::Decreasing,
        std::cmp::Ordering::Equal => Trend::Stable,
    };

    Trends {
        hourly_rate,
        daily_rate,
        trend,
    }
}
