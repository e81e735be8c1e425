//! Retry scheduler
//!
//! Admits operations under a concurrency cap, an hourly attempt budget and a
//! global cooldown, then drives each one through attempts and backoff delays on
//! its own tokio task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backoff::next_delay;
use super::history::{BudgetStatus, HistoryEntry, Ledger, Outcome, RetryStatistics};
use super::limits::{Cooldown, HourlyBudget};
use super::task::{
    RetryHandle, ScheduleEntry, SubmitOptions, TaskContext, TaskInfo, TaskState,
};
use crate::classifier::{ErrorClassifier, ErrorType};
use crate::clock::{SharedClock, TokioClock};
use crate::config::{LimitsConfig, MonitoringConfig, RetryConfig};
use crate::error::{AdmissionReason, RetryError};
use crate::events::{EventBus, LifecycleEvent};
use crate::exceptions::ExceptionStore;
use crate::models::{ErrorContext, OperationError, PolicyOverride, RetryPolicy};

/// Category used when a submission names none
pub const DEFAULT_CATEGORY: &str = "default";

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    /// Tasks past `max_task_age` that were cancelled and released
    pub reclaimed: usize,
    /// History entries older than the retention window
    pub history_pruned: usize,
    pub active: usize,
    pub queued: usize,
}

/// Type-erased task waiting to run
trait PendingTask: Send {
    fn start(self: Box<Self>, inner: Arc<Inner>);
    fn reject(self: Box<Self>, error: RetryError);
}

/// What a task needs to run, fixed at admission
#[derive(Debug, Clone)]
struct TaskPlan {
    id: Uuid,
    category: String,
    context: ErrorContext,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

/// Tasks moved into free slots, started once the state lock is released
type Launches = Vec<(Uuid, String, u32, Box<dyn PendingTask>)>;

struct Pending<T, F> {
    plan: TaskPlan,
    operation: F,
    tx: oneshot::Sender<Result<T, RetryError>>,
}

impl<T, F, Fut> PendingTask for Pending<T, F>
where
    T: Send + 'static,
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
{
    fn start(self: Box<Self>, inner: Arc<Inner>) {
        let Pending { plan, operation, tx } = *self;
        tokio::spawn(run_task(inner, plan, operation, tx));
    }

    fn reject(self: Box<Self>, error: RetryError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Bookkeeping for a task the scheduler knows about
struct TaskRecord {
    info: TaskInfo,
    cancel: CancellationToken,
}

struct Waiting {
    record: TaskRecord,
    pending: Box<dyn PendingTask>,
}

struct SchedulerState {
    active: HashMap<Uuid, TaskRecord>,
    /// Sorted by priority, higher first; FIFO among equals
    queue: Vec<Waiting>,
    budget: HourlyBudget,
    cooldown: Cooldown,
    ledger: Ledger,
    shutting_down: bool,
}

struct Inner {
    retry: RetryConfig,
    limits: LimitsConfig,
    monitoring: MonitoringConfig,
    classifier: ErrorClassifier,
    clock: SharedClock,
    events: EventBus,
    exceptions: Option<ExceptionStore>,
    state: Mutex<SchedulerState>,
}

/// Builder for [`RetryScheduler`]
pub struct RetrySchedulerBuilder {
    retry: RetryConfig,
    limits: LimitsConfig,
    monitoring: MonitoringConfig,
    clock: Option<SharedClock>,
    events: Option<EventBus>,
    exceptions: Option<ExceptionStore>,
}

impl RetrySchedulerBuilder {
    /// Time source for delays and timestamps
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Bus lifecycle events are published on
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Store receiving every terminal failure
    #[must_use]
    pub fn exception_store(mut self, store: ExceptionStore) -> Self {
        self.exceptions = Some(store);
        self
    }

    pub fn build(self) -> RetryScheduler {
        let state = SchedulerState {
            active: HashMap::new(),
            queue: Vec::new(),
            budget: HourlyBudget::new(self.limits.max_retries_per_hour),
            cooldown: Cooldown::default(),
            ledger: Ledger::new(self.monitoring.max_history_size, self.monitoring.store_history),
            shutting_down: false,
        };

        RetryScheduler {
            inner: Arc::new(Inner {
                classifier: ErrorClassifier::new(self.retry.strategies.clone()),
                retry: self.retry,
                limits: self.limits,
                monitoring: self.monitoring,
                clock: self.clock.unwrap_or_else(TokioClock::shared),
                events: self.events.unwrap_or_default(),
                exceptions: self.exceptions,
                state: Mutex::new(state),
            }),
        }
    }
}

/// Schedules operations for retry with backoff; cheap to clone
#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RetryScheduler")
            .field("active", &state.active.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl RetryScheduler {
    /// Start building a scheduler from its configuration sections
    pub fn builder(
        retry: RetryConfig,
        limits: LimitsConfig,
        monitoring: MonitoringConfig,
    ) -> RetrySchedulerBuilder {
        RetrySchedulerBuilder {
            retry,
            limits,
            monitoring,
            clock: None,
            events: None,
            exceptions: None,
        }
    }

    /// Scheduler with default limits and policies
    pub fn with_defaults() -> Self {
        Self::builder(
            RetryConfig::default(),
            LimitsConfig::default(),
            MonitoringConfig::default(),
        )
        .build()
    }

    /// Admission limits in force
    pub fn limits(&self) -> &LimitsConfig {
        &self.inner.limits
    }

    /// Retry policies in force
    pub fn retry_config(&self) -> &RetryConfig {
        &self.inner.retry
    }

    /// Bus this scheduler publishes on
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Submit an operation.
    ///
    /// Admission is decided synchronously; a rejected submission never invokes
    /// the operation. Must be called from within a tokio runtime.
    pub fn submit<T, F, Fut>(
        &self,
        operation: F,
        options: SubmitOptions,
    ) -> Result<RetryHandle<T>, RetryError>
    where
        T: Send + 'static,
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        let inner = &self.inner;
        let now = inner.clock.now();
        let category = options
            .category
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

        let mut state = inner.state.lock();
        inner.check_admission(&mut state, now)?;

        let policy = inner.resolve_policy(&category, &options.policy);
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let plan = TaskPlan {
            id,
            category: category.clone(),
            context: options.context.clone(),
            policy: policy.clone(),
            cancel: cancel.clone(),
        };
        let mut record = TaskRecord {
            info: TaskInfo {
                id,
                category: category.clone(),
                state: TaskState::Queued,
                attempts: 0,
                max_attempts: policy.max_attempts,
                priority: options.priority,
                queued_at: now,
                started_at: None,
                context: options.context,
                schedule: Vec::new(),
            },
            cancel,
        };
        let pending: Box<dyn PendingTask> = Box::new(Pending { plan, operation, tx });

        if state.active.len() < inner.limits.max_concurrent_retries {
            record.info.state = TaskState::Admitted;
            record.info.started_at = Some(now);
            state.active.insert(id, record);
            drop(state);

            debug!(task_id = %id, category = %category, "Retry task admitted");
            inner.events.publish(LifecycleEvent::Admitted {
                task_id: id,
                category,
                max_attempts: policy.max_attempts,
            });
            pending.start(Arc::clone(inner));
        } else {
            let priority = record.info.priority;
            let position = state
                .queue
                .iter()
                .position(|w| w.record.info.priority < priority)
                .unwrap_or(state.queue.len());
            state.queue.insert(position, Waiting { record, pending });
            drop(state);

            debug!(task_id = %id, position, "Retry task queued");
            inner.events.publish(LifecycleEvent::Queued {
                task_id: id,
                position,
            });
        }

        Ok(RetryHandle::new(id, rx))
    }

    /// Cancel a task. Queued tasks are rejected at once; running tasks stop at
    /// their next suspension point, dropping an attempt that is still in
    /// progress. Returns false for unknown ids.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let mut state = self.inner.state.lock();

        if let Some(pos) = state.queue.iter().position(|w| w.record.info.id == task_id) {
            let waiting = state.queue.remove(pos);
            state.ledger.record_cancelled();
            drop(state);

            debug!(task_id = %task_id, "Queued retry task cancelled");
            waiting.pending.reject(RetryError::Cancelled { task_id });
            self.inner
                .events
                .publish(LifecycleEvent::Cancelled { task_id });
            return true;
        }

        match state.active.get(&task_id) {
            Some(record) => {
                debug!(task_id = %task_id, "Cancelling running retry task");
                record.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Reject every queued task with `Cancelled`; returns how many were dropped
    pub fn clear_queue(&self) -> usize {
        let drained: Vec<Waiting> = {
            let mut state = self.inner.state.lock();
            let drained: Vec<Waiting> = state.queue.drain(..).collect();
            for _ in &drained {
                state.ledger.record_cancelled();
            }
            drained
        };

        let cancelled = drained.len();
        for waiting in drained {
            let task_id = waiting.record.info.id;
            waiting.pending.reject(RetryError::Cancelled { task_id });
        }

        if cancelled > 0 {
            info!(cancelled, "Retry queue cleared");
        }
        self.inner
            .events
            .publish(LifecycleEvent::QueueCleared { cancelled });
        cancelled
    }

    /// Tasks holding a concurrency slot
    pub fn active_tasks(&self) -> Vec<TaskInfo> {
        let state = self.inner.state.lock();
        let mut tasks: Vec<TaskInfo> = state.active.values().map(|r| r.info.clone()).collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    /// Tasks waiting for a slot, in dispatch order
    pub fn queue(&self) -> Vec<TaskInfo> {
        let state = self.inner.state.lock();
        state.queue.iter().map(|w| w.record.info.clone()).collect()
    }

    /// State of a live task; `None` once it finished or was never known.
    ///
    /// Finished tasks leave the scheduler before their handle resolves, so the
    /// terminal states are observed through [`RetryHandle`] instead, see
    /// [`TaskState::of_outcome`].
    pub fn task_state(&self, task_id: Uuid) -> Option<TaskState> {
        let state = self.inner.state.lock();
        state
            .active
            .get(&task_id)
            .map(|r| r.info.state)
            .or_else(|| {
                state
                    .queue
                    .iter()
                    .find(|w| w.record.info.id == task_id)
                    .map(|w| w.record.info.state)
            })
    }

    /// Counters, recent outcomes and the per-minute series.
    ///
    /// `time_range` restricts `recent` to outcomes newer than `now - time_range`.
    pub fn statistics(&self, time_range: Option<Duration>) -> RetryStatistics {
        let now = self.inner.clock.now();
        let since = time_range
            .and_then(|range| chrono::Duration::from_std(range).ok())
            .map(|range| now - range);

        let mut state = self.inner.state.lock();
        let view = state.ledger.snapshot(since);
        let used = state.budget.used(now);

        RetryStatistics {
            overview: view.overview,
            by_category: view.by_category,
            recent: view.recent,
            time_series: view.time_series,
            active: state.active.len(),
            queued: state.queue.len(),
            cooldown: state.cooldown.status(now),
            hourly_budget: BudgetStatus {
                used,
                limit: state.budget.limit(),
            },
        }
    }

    /// Whether admissions are currently suspended
    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock();
        state.cooldown.status(now).until
    }

    /// Reclaim tasks past `max_task_age`, prune old history and roll the
    /// hourly budget
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let inner = &self.inner;
        let now = inner.clock.now();
        let max_age = chrono::Duration::from_std(inner.limits.max_task_age())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let retention =
            chrono::Duration::hours(i64::from(inner.monitoring.history_retention_hours));

        let (report, started) = {
            let mut state = inner.state.lock();

            let expired: Vec<Uuid> = state
                .active
                .iter()
                .filter(|(_, r)| r.info.started_at.is_some_and(|s| now - s > max_age))
                .map(|(id, _)| *id)
                .collect();

            // The task's own loop resolves its handle once it sees the token
            for id in &expired {
                if let Some(record) = state.active.remove(id) {
                    warn!(
                        task_id = %id,
                        category = %record.info.category,
                        "Reclaiming expired retry task"
                    );
                    record.cancel.cancel();
                }
            }

            let started = inner.fill_slots(&mut state, now);
            let history_pruned = state.ledger.prune(now - retention);
            state.budget.roll(now);

            let report = MaintenanceReport {
                reclaimed: expired.len(),
                history_pruned,
                active: state.active.len(),
                queued: state.queue.len(),
            };
            (report, started)
        };

        inner.start_all(started);

        debug!(
            reclaimed = report.reclaimed,
            active = report.active,
            queued = report.queued,
            "Retry maintenance complete"
        );
        inner.events.publish(LifecycleEvent::MaintenancePerformed {
            component: "retry_scheduler".to_string(),
            active: report.active,
            queued: report.queued,
            reclaimed: report.reclaimed,
        });
        report
    }

    /// Run maintenance every `maintenance_interval` until `shutdown`
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let interval = self.inner.limits.maintenance_interval();
        info!(interval_ms = interval.as_millis() as u64, "Starting retry maintenance");

        tokio::spawn(async move {
            loop {
                scheduler.inner.clock.sleep(interval).await;
                if scheduler.inner.state.lock().shutting_down {
                    break;
                }
                scheduler.run_maintenance();
            }
        })
    }

    /// Refuse new submissions, cancel running tasks and clear the queue
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            for record in state.active.values() {
                record.cancel.cancel();
            }
        }
        info!("Retry scheduler shutting down");
        self.clear_queue();
    }
}

impl Inner {
    fn check_admission(
        &self,
        state: &mut SchedulerState,
        now: DateTime<Utc>,
    ) -> Result<(), RetryError> {
        if state.shutting_down {
            return Err(RetryError::AdmissionRejected(AdmissionReason::ShuttingDown));
        }
        if state.cooldown.active_at(now) {
            let until = state.cooldown.until().unwrap_or(now);
            debug!(%until, "Admission rejected: cooldown active");
            return Err(RetryError::AdmissionRejected(AdmissionReason::Cooldown { until }));
        }
        if state.budget.exhausted(now) {
            let used = state.budget.used(now);
            let limit = state.budget.limit();
            debug!(used, limit, "Admission rejected: hourly budget exhausted");
            return Err(RetryError::AdmissionRejected(AdmissionReason::RateBudget {
                used,
                limit,
            }));
        }
        if state.active.len() >= self.limits.max_concurrent_retries
            && state.queue.len() >= self.limits.retry_queue_size
        {
            debug!(
                active = state.active.len(),
                queued = state.queue.len(),
                "Admission rejected: at capacity"
            );
            return Err(RetryError::AdmissionRejected(AdmissionReason::Capacity {
                active: state.active.len(),
                queued: state.queue.len(),
            }));
        }
        Ok(())
    }

    /// Default policy, then the strategy for the category, then the caller's overrides
    fn resolve_policy(&self, category: &str, overrides: &PolicyOverride) -> RetryPolicy {
        let base = &self.retry.default_policy;
        let strategy = match category.parse::<ErrorType>() {
            Ok(error_type) => self.classifier.strategy_for(error_type, base),
            Err(_) => base.clone(),
        };
        let mut policy = strategy.merge(overrides);
        policy.max_attempts = policy.max_attempts.max(1);
        policy
    }

    /// Move queued tasks into free slots
    fn fill_slots(
        &self,
        state: &mut SchedulerState,
        now: DateTime<Utc>,
    ) -> Launches {
        let mut started = Vec::new();
        while !state.shutting_down
            && state.active.len() < self.limits.max_concurrent_retries
            && !state.queue.is_empty()
        {
            let Waiting { mut record, pending } = state.queue.remove(0);
            let id = record.info.id;
            record.info.state = TaskState::Admitted;
            record.info.started_at = Some(now);
            started.push((id, record.info.category.clone(), record.info.max_attempts, pending));
            state.active.insert(id, record);
        }
        started
    }

    fn start_all(self: &Arc<Self>, started: Launches) {
        for (task_id, category, max_attempts, pending) in started {
            debug!(task_id = %task_id, "Queued retry task admitted");
            self.events.publish(LifecycleEvent::Admitted {
                task_id,
                category,
                max_attempts,
            });
            pending.start(Arc::clone(self));
        }
    }

    /// Count an attempt against the hourly budget; trips the cooldown on overflow
    fn begin_attempt(&self, id: Uuid, attempt: u32) {
        let now = self.clock.now();
        let tripped = {
            let mut state = self.state.lock();
            if let Some(record) = state.active.get_mut(&id) {
                record.info.state = TaskState::Attempting;
                record.info.attempts = attempt;
            }
            if state.budget.record(now) {
                Some(state.cooldown.trigger(now, self.limits.global_retry_cooldown()))
            } else {
                None
            }
        };

        if let Some(until) = tripped {
            warn!(%until, "Hourly retry budget exceeded, cooldown triggered");
            self.events.publish(LifecycleEvent::CooldownTriggered {
                until,
                reason: "hourly_limit".to_string(),
            });
        }
    }

    fn schedule_retry(&self, plan: &TaskPlan, entry: ScheduleEntry, error: &OperationError) {
        {
            let mut state = self.state.lock();
            state.ledger.record_retry(entry.timestamp);
            if let Some(record) = state.active.get_mut(&plan.id) {
                record.info.state = TaskState::Retrying;
                record.info.schedule.push(entry.clone());
            }
        }

        debug!(
            task_id = %plan.id,
            attempt = entry.attempt,
            delay_ms = entry.delay.as_millis() as u64,
            error_type = %entry.error_type,
            "Retry scheduled"
        );
        self.events.publish(LifecycleEvent::Attempt {
            task_id: plan.id,
            attempt: entry.attempt - 1,
            max_attempts: plan.policy.max_attempts,
            error: error.message.clone(),
            error_type: entry.error_type,
            delay: entry.delay,
        });
    }

    /// Remove a finished task and admit queued ones into the freed slot
    fn release(&self, state: &mut SchedulerState, id: Uuid, now: DateTime<Utc>) -> Launches {
        if state.active.remove(&id).is_some() {
            self.fill_slots(state, now)
        } else {
            Vec::new()
        }
    }

    fn finish_success(self: &Arc<Self>, plan: &TaskPlan, attempts: u32, elapsed: Duration) {
        let now = self.clock.now();
        let (started, cleared) = {
            let mut state = self.state.lock();
            state.ledger.record(HistoryEntry {
                task_id: plan.id,
                category: plan.category.clone(),
                outcome: Outcome::Success,
                attempts,
                error: None,
                duration: elapsed,
                timestamp: now,
            });
            let cleared = state.cooldown.clear(now);
            (self.release(&mut state, plan.id, now), cleared)
        };

        debug!(task_id = %plan.id, attempts, "Retry task succeeded");
        self.events.publish(LifecycleEvent::Success {
            task_id: plan.id,
            attempts,
            elapsed,
        });
        if cleared {
            info!("Retry cooldown cleared after success");
            self.events.publish(LifecycleEvent::CooldownCleared);
        }
        self.start_all(started);
    }

    fn finish_failure(
        self: &Arc<Self>,
        plan: &TaskPlan,
        attempts: u32,
        elapsed: Duration,
        error: &OperationError,
        error_type: ErrorType,
    ) {
        let now = self.clock.now();
        let final_attempt = attempts >= plan.policy.max_attempts;

        let (started, tripped, rate) = {
            let mut state = self.state.lock();
            state.ledger.record(HistoryEntry {
                task_id: plan.id,
                category: plan.category.clone(),
                outcome: Outcome::Failure,
                attempts,
                error: Some(error.message.clone()),
                duration: elapsed,
                timestamp: now,
            });
            let tripped = final_attempt
                .then(|| state.cooldown.trigger(now, self.limits.global_retry_cooldown()));
            let rate = if self.monitoring.enabled {
                state
                    .ledger
                    .failure_rate()
                    .filter(|r| r.rate >= self.monitoring.failure_rate_threshold)
            } else {
                None
            };
            (self.release(&mut state, plan.id, now), tripped, rate)
        };

        warn!(
            task_id = %plan.id,
            attempts,
            error_type = %error_type,
            error = %error,
            "Retry task failed"
        );
        self.events.publish(LifecycleEvent::Failure {
            task_id: plan.id,
            attempts,
            error: error.message.clone(),
            error_type,
        });

        if let Some(until) = tripped {
            warn!(%until, "Retry attempts exhausted, cooldown triggered");
            self.events.publish(LifecycleEvent::CooldownTriggered {
                until,
                reason: "max_attempts_exceeded".to_string(),
            });
        }

        if let Some(rate) = rate {
            warn!(
                failure_rate = rate.rate,
                failures = rate.failures,
                total = rate.total,
                "High retry failure rate"
            );
            self.events.publish(LifecycleEvent::HighFailureRate {
                failure_rate: rate.rate,
                failures: rate.failures,
                total: rate.total,
                threshold: self.monitoring.failure_rate_threshold,
            });
        }

        self.start_all(started);
    }

    fn finish_cancelled(self: &Arc<Self>, plan: &TaskPlan) {
        let now = self.clock.now();
        let started = {
            let mut state = self.state.lock();
            state.ledger.record_cancelled();
            self.release(&mut state, plan.id, now)
        };

        debug!(task_id = %plan.id, "Retry task cancelled");
        self.events
            .publish(LifecycleEvent::Cancelled { task_id: plan.id });
        self.start_all(started);
    }
}

/// Drive one task through its attempts
async fn run_task<T, F, Fut>(
    inner: Arc<Inner>,
    plan: TaskPlan,
    operation: F,
    tx: oneshot::Sender<Result<T, RetryError>>,
) where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
{
    let started = tokio::time::Instant::now();
    let started_at = inner.clock.now();
    let mut attempt = 0u32;

    let outcome = loop {
        if plan.cancel.is_cancelled() {
            inner.finish_cancelled(&plan);
            break Err(RetryError::Cancelled { task_id: plan.id });
        }

        attempt += 1;
        inner.begin_attempt(plan.id, attempt);

        let call = operation(TaskContext {
            task_id: plan.id,
            attempt,
            category: plan.category.clone(),
            context: plan.context.clone(),
        });
        let result = tokio::select! {
            biased;
            _ = plan.cancel.cancelled() => {
                inner.finish_cancelled(&plan);
                break Err(RetryError::Cancelled { task_id: plan.id });
            }
            result = call => result,
        };
        let elapsed = elapsed_since(&inner, started, started_at);

        let error = match result {
            Ok(value) => {
                inner.finish_success(&plan, attempt, elapsed);
                break Ok(value);
            }
            Err(error) => error,
        };

        let verdict = inner
            .classifier
            .classify(&error, &plan.context, &plan.policy);

        if !verdict.retryable || attempt >= plan.policy.max_attempts {
            inner.finish_failure(&plan, attempt, elapsed, &error, verdict.error_type);

            if let Some(store) = &inner.exceptions {
                let mut context = plan.context.clone();
                if context.task_id.is_none() {
                    context.task_id = Some(plan.id.to_string());
                }
                if context.operation.is_none() {
                    context.operation = Some(plan.category.clone());
                }
                store.handle(&error, context).await;
            }

            break Err(RetryError::RetryExhausted {
                task_id: plan.id,
                attempts: attempt,
                elapsed,
                error_type: verdict.error_type,
                cause: error,
            });
        }

        let delay = {
            let mut rng = rand::thread_rng();
            next_delay(&plan.policy, attempt, verdict.error_type, &mut rng)
        };
        inner.schedule_retry(
            &plan,
            ScheduleEntry {
                attempt: attempt + 1,
                delay,
                error_type: verdict.error_type,
                timestamp: inner.clock.now(),
            },
            &error,
        );

        tokio::select! {
            _ = plan.cancel.cancelled() => {
                inner.finish_cancelled(&plan);
                break Err(RetryError::Cancelled { task_id: plan.id });
            }
            _ = inner.clock.sleep(delay) => {}
        }
    };

    if let Some(state) = TaskState::of_outcome(&outcome) {
        debug!(task_id = %plan.id, state = ?state, attempts = attempt, "Retry task finished");
    }
    let _ = tx.send(outcome);
}

/// Elapsed time on the injected clock, falling back to tokio's when it stands still
fn elapsed_since(
    inner: &Inner,
    started: tokio::time::Instant,
    started_at: DateTime<Utc>,
) -> Duration {
    (inner.clock.now() - started_at)
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{AutoAdvanceClock, ManualClock};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn scheduler_with(limits: LimitsConfig, clock: SharedClock) -> RetryScheduler {
        RetryScheduler::builder(RetryConfig::default(), limits, MonitoringConfig::default())
            .clock(clock)
            .build()
    }

    fn no_jitter() -> PolicyOverride {
        PolicyOverride::default().jitter(false)
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let scheduler = scheduler_with(LimitsConfig::default(), Arc::new(ManualClock::fixed()));

        let handle = scheduler
            .submit(|_ctx| async { Ok::<_, OperationError>(42) }, SubmitOptions::new())
            .unwrap();

        assert_eq!(handle.await.unwrap(), 42);
        let stats = scheduler.statistics(None);
        assert_eq!(stats.overview.successful, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_category_strategy_is_applied() {
        let clock = Arc::new(AutoAdvanceClock::fixed());
        let scheduler = scheduler_with(LimitsConfig::default(), clock.clone());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let handle = scheduler
            .submit(
                move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(OperationError::new("server error")) }
                },
                SubmitOptions::new()
                    .category("server_error")
                    .policy(no_jitter()),
            )
            .unwrap();

        let err = handle.await.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(2_000), Duration::from_millis(6_000)]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_triggers_cooldown() {
        let clock = Arc::new(AutoAdvanceClock::fixed());
        let scheduler = scheduler_with(LimitsConfig::default(), clock.clone());

        let handle = scheduler
            .submit(
                |_ctx| async { Err::<(), _>(OperationError::new("boom")) },
                SubmitOptions::new().policy(no_jitter().max_attempts(2).initial_delay_ms(10)),
            )
            .unwrap();
        assert!(handle.await.unwrap_err().is_exhausted());

        let rejected = scheduler
            .submit(|_ctx| async { Ok::<_, OperationError>(()) }, SubmitOptions::new())
            .unwrap_err();
        assert!(matches!(
            rejected,
            RetryError::AdmissionRejected(AdmissionReason::Cooldown { .. })
        ));

        clock.advance(Duration::from_millis(60_000));
        assert!(scheduler
            .submit(|_ctx| async { Ok::<_, OperationError>(()) }, SubmitOptions::new())
            .is_ok());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_does_not_trigger_cooldown() {
        let scheduler = scheduler_with(LimitsConfig::default(), Arc::new(ManualClock::fixed()));

        let handle = scheduler
            .submit(
                |_ctx| async { Err::<(), _>(OperationError::new("permission denied")) },
                SubmitOptions::new(),
            )
            .unwrap();

        let err = handle.await.unwrap_err();
        assert_eq!(err.attempts(), Some(1));
        assert!(scheduler.cooldown_until().is_none());
    }

    #[tokio::test]
    async fn test_hourly_budget_rejects_admission() {
        let limits = LimitsConfig {
            max_retries_per_hour: 2,
            ..LimitsConfig::default()
        };
        let scheduler = scheduler_with(limits, Arc::new(ManualClock::fixed()));

        for _ in 0..2 {
            scheduler
                .submit(|_ctx| async { Ok::<_, OperationError>(()) }, SubmitOptions::new())
                .unwrap()
                .await
                .unwrap();
        }

        let err = scheduler
            .submit(|_ctx| async { Ok::<_, OperationError>(()) }, SubmitOptions::new())
            .unwrap_err();
        assert!(matches!(
            err,
            RetryError::AdmissionRejected(AdmissionReason::RateBudget { used: 2, limit: 2 })
        ));
    }

    #[tokio::test]
    async fn test_capacity_rejection_when_queue_full() {
        let limits = LimitsConfig {
            max_concurrent_retries: 1,
            retry_queue_size: 1,
            ..LimitsConfig::default()
        };
        let scheduler = scheduler_with(limits, Arc::new(ManualClock::fixed()));
        let never = || std::future::pending::<Result<(), OperationError>>();

        let _a = scheduler.submit(move |_ctx| never(), SubmitOptions::new()).unwrap();
        let _b = scheduler.submit(move |_ctx| never(), SubmitOptions::new()).unwrap();
        let err = scheduler
            .submit(move |_ctx| never(), SubmitOptions::new())
            .unwrap_err();

        assert!(matches!(
            err,
            RetryError::AdmissionRejected(AdmissionReason::Capacity { active: 1, queued: 1 })
        ));
    }

    #[tokio::test]
    async fn test_queue_orders_by_priority() {
        let limits = LimitsConfig {
            max_concurrent_retries: 1,
            ..LimitsConfig::default()
        };
        let scheduler = scheduler_with(limits, Arc::new(ManualClock::fixed()));
        let never = || std::future::pending::<Result<(), OperationError>>();

        let _running = scheduler.submit(move |_ctx| never(), SubmitOptions::new()).unwrap();
        let low = scheduler
            .submit(move |_ctx| never(), SubmitOptions::new().priority(1))
            .unwrap();
        let high = scheduler
            .submit(move |_ctx| never(), SubmitOptions::new().priority(5))
            .unwrap();
        let low2 = scheduler
            .submit(move |_ctx| never(), SubmitOptions::new().priority(1))
            .unwrap();

        let order: Vec<Uuid> = scheduler.queue().iter().map(|t| t.id).collect();
        assert_eq!(order, vec![high.task_id(), low.task_id(), low2.task_id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task_during_backoff() {
        let scheduler = scheduler_with(LimitsConfig::default(), TokioClock::shared());

        let handle = scheduler
            .submit(
                |_ctx| async { Err::<(), _>(OperationError::new("flaky")) },
                SubmitOptions::new()
                    .policy(no_jitter().initial_delay_ms(10_000).max_delay_ms(10_000)),
            )
            .unwrap();
        let task_id = handle.task_id();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.task_state(task_id), Some(TaskState::Retrying));

        assert!(scheduler.cancel(task_id));
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(scheduler.active_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_reclaims_expired_tasks() {
        let limits = LimitsConfig {
            max_concurrent_retries: 1,
            max_task_age_ms: 1_000,
            ..LimitsConfig::default()
        };
        let scheduler = scheduler_with(limits, TokioClock::shared());

        let stuck = scheduler
            .submit(
                |_ctx| std::future::pending::<Result<(), OperationError>>(),
                SubmitOptions::new(),
            )
            .unwrap();
        let waiting = scheduler
            .submit(|_ctx| async { Ok::<_, OperationError>(7) }, SubmitOptions::new())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let report = scheduler.run_maintenance();

        assert_eq!(report.reclaimed, 1);
        assert_eq!(waiting.await.unwrap(), 7);
        assert_eq!(scheduler.task_state(stuck.task_id()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaimed_task_resolves_as_cancelled() {
        let limits = LimitsConfig {
            max_concurrent_retries: 1,
            max_task_age_ms: 1_000,
            ..LimitsConfig::default()
        };
        let scheduler = scheduler_with(limits, TokioClock::shared());
        let dropped = Arc::new(AtomicU32::new(0));

        struct DropCount(Arc<AtomicU32>);
        impl Drop for DropCount {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = dropped.clone();
        let stuck = scheduler
            .submit(
                move |_ctx| {
                    let guard = DropCount(counter.clone());
                    async move {
                        let _guard = guard;
                        std::future::pending::<Result<(), OperationError>>().await
                    }
                },
                SubmitOptions::new(),
            )
            .unwrap();
        let stuck_id = stuck.task_id();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(scheduler.run_maintenance().reclaimed, 1);

        let outcome = tokio::time::timeout(Duration::from_secs(5), stuck)
            .await
            .expect("reclaimed handle should resolve");
        assert!(matches!(outcome, Err(RetryError::Cancelled { task_id }) if task_id == stuck_id));
        assert_eq!(TaskState::of_outcome(&outcome), Some(TaskState::Cancelled));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(scheduler.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_success_clears_active_cooldown() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let scheduler =
            RetryScheduler::builder(RetryConfig::default(), LimitsConfig::default(), MonitoringConfig::default())
                .clock(Arc::new(ManualClock::fixed()))
                .events(bus)
                .build();
        let gate = Arc::new(Notify::new());

        let release = gate.clone();
        let in_flight = scheduler
            .submit(
                move |_ctx| {
                    let release = release.clone();
                    async move {
                        release.notified().await;
                        Ok::<_, OperationError>("late success")
                    }
                },
                SubmitOptions::new(),
            )
            .unwrap();

        let failing = scheduler
            .submit(
                |_ctx| async { Err::<(), _>(OperationError::new("boom")) },
                SubmitOptions::new().policy(no_jitter().max_attempts(1)),
            )
            .unwrap();
        assert!(failing.await.unwrap_err().is_exhausted());
        assert!(scheduler.cooldown_until().is_some());
        assert!(matches!(
            scheduler
                .submit(|_ctx| async { Ok::<_, OperationError>(()) }, SubmitOptions::new())
                .unwrap_err(),
            RetryError::AdmissionRejected(AdmissionReason::Cooldown { .. })
        ));

        gate.notify_one();
        assert_eq!(in_flight.await.unwrap(), "late success");

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            LifecycleEvent::CooldownTriggered { reason, .. } if reason == "max_attempts_exceeded"
        )));
        assert!(events.iter().any(|e| matches!(e, LifecycleEvent::CooldownCleared)));
        assert!(scheduler.cooldown_until().is_none());
        assert!(scheduler
            .submit(|_ctx| async { Ok::<_, OperationError>(()) }, SubmitOptions::new())
            .is_ok());
    }

    #[tokio::test]
    async fn test_hourly_overflow_mid_task_triggers_cooldown() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let limits = LimitsConfig {
            max_retries_per_hour: 2,
            ..LimitsConfig::default()
        };
        let scheduler =
            RetryScheduler::builder(RetryConfig::default(), limits, MonitoringConfig::default())
                .clock(Arc::new(AutoAdvanceClock::fixed()))
                .events(bus)
                .build();

        // Fails twice, then the third attempt hangs inside the budget overflow
        let handle = scheduler
            .submit(
                |ctx| async move {
                    if ctx.attempt < 3 {
                        Err(OperationError::new("something odd"))
                    } else {
                        std::future::pending::<Result<(), OperationError>>().await
                    }
                },
                SubmitOptions::new().policy(no_jitter().max_attempts(5).initial_delay_ms(10)),
            )
            .unwrap();
        let task_id = handle.task_id();

        let reason = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match rx.recv().await {
                    Ok(LifecycleEvent::CooldownTriggered { reason, .. }) => break reason,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await
        .expect("cooldown should trigger on the third attempt");
        assert_eq!(reason, "hourly_limit");

        // Admission is refused, the in-flight task keeps its attempt
        let err = scheduler
            .submit(|_ctx| async { Ok::<_, OperationError>(()) }, SubmitOptions::new())
            .unwrap_err();
        assert!(matches!(
            err,
            RetryError::AdmissionRejected(AdmissionReason::Cooldown { .. })
        ));
        assert_eq!(scheduler.task_state(task_id), Some(TaskState::Attempting));
        assert_eq!(scheduler.statistics(None).hourly_budget.used, 3);

        assert!(scheduler.cancel(task_id));
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_high_failure_rate_published_after_ten_outcomes() {
        let bus = EventBus::new(256);
        let mut rx = bus.subscribe();
        let scheduler =
            RetryScheduler::builder(RetryConfig::default(), LimitsConfig::default(), MonitoringConfig::default())
                .clock(Arc::new(ManualClock::fixed()))
                .events(bus)
                .build();

        let mut flagged_after = Vec::new();
        for i in 1..=10 {
            let handle = scheduler
                .submit(
                    |_ctx| async { Err::<(), _>(OperationError::new("permission denied")) },
                    SubmitOptions::new(),
                )
                .unwrap();
            assert_eq!(handle.await.unwrap_err().attempts(), Some(1));

            let events = drain_events(&mut rx);
            if events
                .iter()
                .any(|e| matches!(e, LifecycleEvent::HighFailureRate { .. }))
            {
                flagged_after.push(i);
            }
            assert!(!events
                .iter()
                .any(|e| matches!(e, LifecycleEvent::CooldownTriggered { .. })));
        }

        assert_eq!(flagged_after, vec![10]);
        let stats = scheduler.statistics(None);
        assert_eq!(stats.overview.failed, 10);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let scheduler = scheduler_with(LimitsConfig::default(), Arc::new(ManualClock::fixed()));
        scheduler.shutdown();

        let err = scheduler
            .submit(|_ctx| async { Ok::<_, OperationError>(()) }, SubmitOptions::new())
            .unwrap_err();
        assert!(matches!(
            err,
            RetryError::AdmissionRejected(AdmissionReason::ShuttingDown)
        ));
    }
}
