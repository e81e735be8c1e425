//! Severity routing, threshold detection and alert bookkeeping

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{channel_from_name, AlertChannel};
use super::queue::NotificationQueue;
use crate::clock::{SharedClock, TokioClock};
use crate::config::{AlertingConfig, RefirePolicy};
use crate::error::{Error, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::models::{
    Alert, AlertDetails, ClassifiedException, DispatchResult, NotificationPayload, Priority,
    Severity,
};

/// Alert counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStatistics {
    pub total: u64,
    pub active: usize,
    pub acknowledged: usize,
    pub resolved: usize,
    pub by_level: BTreeMap<String, u64>,
    pub threshold_alerts: u64,
    pub dispatch_failures: u64,
}

#[derive(Debug, Default)]
struct AlertState {
    alerts: HashMap<Uuid, Alert>,
    /// Creation order of `alerts`
    order: VecDeque<Uuid>,
    /// Timestamps of qualifying entries inside the threshold window
    window: VecDeque<DateTime<Utc>>,
    last_fired: Option<DateTime<Utc>>,
    total: u64,
    by_level: BTreeMap<String, u64>,
    threshold_alerts: u64,
    dispatch_failures: u64,
}

impl AlertState {
    fn store(&mut self, alert: Alert, max_history: usize) {
        self.total += 1;
        *self
            .by_level
            .entry(alert.level.as_str().to_string())
            .or_default() += 1;
        self.order.push_back(alert.id);
        self.alerts.insert(alert.id, alert);

        while self.order.len() > max_history {
            if let Some(id) = self.order.pop_front() {
                self.alerts.remove(&id);
            }
        }
    }

    fn ordered(&self) -> impl Iterator<Item = &Alert> {
        self.order.iter().filter_map(|id| self.alerts.get(id))
    }
}

struct ManagerInner {
    config: AlertingConfig,
    clock: SharedClock,
    events: EventBus,
    channels: Vec<Arc<dyn AlertChannel>>,
    notifications: Option<NotificationQueue>,
    state: Mutex<AlertState>,
}

/// Builder for [`AlertManager`]
pub struct AlertManagerBuilder {
    config: AlertingConfig,
    clock: Option<SharedClock>,
    events: Option<EventBus>,
    channels: Option<Vec<Arc<dyn AlertChannel>>>,
    notifications: Option<NotificationQueue>,
}

impl AlertManagerBuilder {
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

    /// Add a channel; once called, the configured built-in names are ignored
    #[must_use]
    pub fn channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.channels.get_or_insert_with(Vec::new).push(channel);
        self
    }

    /// Queue notifications are sent through
    #[must_use]
    pub fn notifications(mut self, queue: NotificationQueue) -> Self {
        self.notifications = Some(queue);
        self
    }

    pub fn build(self) -> AlertManager {
        let config = self.config;
        let channels = self.channels.unwrap_or_else(|| {
            config
                .channels
                .iter()
                .filter_map(|name| {
                    let channel = channel_from_name(name);
                    if channel.is_none() {
                        warn!(channel = %name, "Unknown alert channel, skipping");
                    }
                    channel
                })
                .collect()
        });

        AlertManager {
            inner: Arc::new(ManagerInner {
                config,
                clock: self.clock.unwrap_or_else(TokioClock::shared),
                events: self.events.unwrap_or_default(),
                channels,
                notifications: self.notifications,
                state: Mutex::new(AlertState::default()),
            }),
        }
    }
}

/// Routes exceptions to alerts and notifications; cheap to clone
#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.inner.channels.iter().map(|c| c.name()).collect();
        f.debug_struct("AlertManager")
            .field("channels", &names)
            .finish()
    }
}

impl AlertManager {
    pub fn builder(config: AlertingConfig) -> AlertManagerBuilder {
        AlertManagerBuilder {
            config,
            clock: None,
            events: None,
            channels: None,
            notifications: None,
        }
    }

    /// Route a stored exception by severity. Returns the alerts raised.
    ///
    /// Critical raises an alert and an urgent notification, high an alert and a
    /// standard notification. Medium feeds the threshold window and sends a
    /// batched notification. Low and info are only logged.
    pub async fn route(&self, exception: &ClassifiedException) -> Vec<Alert> {
        let config = &self.inner.config;
        if !config.enabled {
            return Vec::new();
        }

        let now = self.inner.clock.now();
        if exception.severity >= Severity::Medium {
            self.inner.state.lock().window.push_back(now);
        }

        let mut raised = Vec::new();
        match exception.severity {
            Severity::Critical | Severity::High => {
                let alert = self.create_alert(
                    exception.severity,
                    Some(exception.id),
                    exception.error.message.clone(),
                    details_of(exception, 1),
                );
                self.dispatch(&alert).await;
                raised.push(alert);

                let priority = if exception.severity == Severity::Critical {
                    Priority::Urgent
                } else {
                    Priority::Standard
                };
                self.notify(exception, priority).await;
            }
            Severity::Medium => {
                if let Some(alert) = self.check_threshold(exception, now) {
                    self.dispatch(&alert).await;
                    raised.push(alert);
                }
                self.notify(exception, Priority::Batched).await;
            }
            Severity::Low | Severity::Info => {
                if !config.suppress_low_severity {
                    info!(
                        exception_id = %exception.id,
                        category = %exception.category,
                        component = exception.context.component_or_unknown(),
                        "Low severity exception: {}",
                        exception.error.message
                    );
                }
            }
        }
        raised
    }

    /// Count qualifying entries in the window; raises a threshold alert when
    /// the count reaches `error_threshold`
    fn check_threshold(
        &self,
        exception: &ClassifiedException,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let config = &self.inner.config;
        let window = chrono::Duration::from_std(config.time_window())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let count = {
            let mut state = self.inner.state.lock();
            let cutoff = now - window;
            while state.window.front().is_some_and(|t| *t < cutoff) {
                state.window.pop_front();
            }
            let count = state.window.len();
            if count < config.error_threshold {
                return None;
            }

            let fire = match config.refire {
                RefirePolicy::EveryEntry => true,
                RefirePolicy::OncePerWindow => {
                    state.last_fired.map_or(true, |last| now >= last + window)
                }
            };
            if !fire {
                debug!(count, "Error threshold still exceeded, alert suppressed");
                return None;
            }
            state.last_fired = Some(now);
            state.threshold_alerts += 1;
            count
        };

        let message = format!(
            "Error threshold exceeded: {count} errors in {}s",
            config.time_window().as_secs()
        );
        warn!(count, threshold = config.error_threshold, "Error threshold exceeded");
        Some(self.create_alert(Severity::High, None, message, details_of(exception, count)))
    }

    fn create_alert(
        &self,
        level: Severity,
        exception_id: Option<Uuid>,
        message: String,
        details: AlertDetails,
    ) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            level,
            exception_id,
            message,
            details,
            created_at: self.inner.clock.now(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
        };

        self.inner
            .state
            .lock()
            .store(alert.clone(), self.inner.config.max_history.max(1));

        info!(alert_id = %alert.id, level = %alert.level, "Alert created");
        self.inner.events.publish(LifecycleEvent::AlertCreated {
            alert_id: alert.id,
            level: alert.level,
            message: alert.message.clone(),
        });
        alert
    }

    /// Send an alert to every channel. A failing channel does not stop the others.
    pub async fn dispatch(&self, alert: &Alert) -> Vec<DispatchResult> {
        let mut results = Vec::with_capacity(self.inner.channels.len());

        for channel in &self.inner.channels {
            let sent_at = self.inner.clock.now();
            let result = channel.dispatch(alert).await;

            if let Err(e) = &result {
                error!(
                    alert_id = %alert.id,
                    channel = channel.name(),
                    error = %e,
                    "Alert channel failed"
                );
                self.inner.state.lock().dispatch_failures += 1;
            }

            results.push(DispatchResult {
                channel: channel.name().to_string(),
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                sent_at,
            });
        }

        results
    }

    async fn notify(&self, exception: &ClassifiedException, priority: Priority) {
        let Some(queue) = &self.inner.notifications else {
            return;
        };
        let payload = NotificationPayload {
            exception_id: exception.id,
            severity: exception.severity,
            category: exception.category.as_str().to_string(),
            component: exception.context.component_or_unknown().to_string(),
            workflow_id: exception.context.workflow_id.clone(),
            message: exception.error.message.clone(),
        };
        queue.enqueue(payload, priority).await;
    }

    /// Mark an alert as seen
    pub fn acknowledge(&self, alert_id: Uuid, by: impl Into<String>) -> Result<Alert> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        let alert = state
            .alerts
            .get_mut(&alert_id)
            .ok_or_else(|| Error::not_found("alert", alert_id.to_string()))?;

        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_by = Some(by.into());
            alert.acknowledged_at = Some(now);
            debug!(alert_id = %alert_id, "Alert acknowledged");
        }
        Ok(alert.clone())
    }

    /// Mark an alert resolved
    pub fn resolve_alert(&self, alert_id: Uuid) -> Result<Alert> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        let alert = state
            .alerts
            .get_mut(&alert_id)
            .ok_or_else(|| Error::not_found("alert", alert_id.to_string()))?;

        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(now);
            debug!(alert_id = %alert_id, "Alert resolved");
        }
        Ok(alert.clone())
    }

    /// Resolve every alert raised for an exception; returns how many changed
    pub fn resolve_for_exception(&self, exception_id: Uuid) -> usize {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        let mut resolved = 0;
        for alert in state.alerts.values_mut() {
            if alert.exception_id == Some(exception_id) && !alert.resolved {
                alert.resolved = true;
                alert.resolved_at = Some(now);
                resolved += 1;
            }
        }
        if resolved > 0 {
            debug!(exception_id = %exception_id, resolved, "Alerts resolved with their exception");
        }
        resolved
    }

    pub fn get(&self, alert_id: Uuid) -> Option<Alert> {
        self.inner.state.lock().alerts.get(&alert_id).cloned()
    }

    /// Unresolved alerts, oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let state = self.inner.state.lock();
        state.ordered().filter(|a| !a.resolved).cloned().collect()
    }

    /// Alert history, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        let state = self.inner.state.lock();
        state.ordered().cloned().collect()
    }

    pub fn statistics(&self) -> AlertStatistics {
        let state = self.inner.state.lock();
        let mut stats = AlertStatistics {
            total: state.total,
            by_level: state.by_level.clone(),
            threshold_alerts: state.threshold_alerts,
            dispatch_failures: state.dispatch_failures,
            ..AlertStatistics::default()
        };
        for alert in state.alerts.values() {
            if alert.resolved {
                stats.resolved += 1;
            } else {
                stats.active += 1;
            }
            if alert.acknowledged {
                stats.acknowledged += 1;
            }
        }
        stats
    }

    /// Alerts as `(id, alert)` pairs for snapshots
    pub fn snapshot_entries(&self) -> Vec<(Uuid, Alert)> {
        let state = self.inner.state.lock();
        state.ordered().map(|a| (a.id, a.clone())).collect()
    }

    /// Replace the alert history with snapshot entries
    pub fn restore(&self, entries: Vec<(Uuid, Alert)>) {
        let max_history = self.inner.config.max_history.max(1);
        let mut state = self.inner.state.lock();
        state.alerts.clear();
        state.order.clear();
        let skip = entries.len().saturating_sub(max_history);
        for (id, alert) in entries.into_iter().skip(skip) {
            state.order.push_back(id);
            state.alerts.insert(id, alert);
        }
    }

    /// Names of the configured channels
    pub fn channel_names(&self) -> Vec<String> {
        self.inner
            .channels
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }
}

fn details_of(exception: &ClassifiedException, count: usize) -> AlertDetails {
    AlertDetails {
        category: exception.category.as_str().to_string(),
        component: exception.context.component_or_unknown().to_string(),
        workflow_id: exception.context.workflow_id.clone(),
        count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{MemoryChannel, MemorySink};
    use crate::classifier::ErrorType;
    use crate::clock::ManualClock;
    use crate::config::NotificationConfig;
    use crate::error::ChannelError;
    use crate::models::{ErrorContext, ErrorDetails};
    use async_trait::async_trait;
    use std::time::Duration;

    fn exception(severity: Severity) -> ClassifiedException {
        ClassifiedException {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            error: ErrorDetails {
                name: "Error".into(),
                message: format!("{severity} failure"),
                stack: None,
                code: None,
                cause: None,
            },
            context: ErrorContext::new().with_component("billing"),
            category: ErrorType::Timeout,
            severity,
            retryable: true,
            tags: Vec::new(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_note: None,
        }
    }

    struct BrokenChannel;

    #[async_trait]
    impl AlertChannel for BrokenChannel {
        fn name(&self) -> &str {
            "broken"
        }

        async fn dispatch(&self, _alert: &Alert) -> std::result::Result<(), ChannelError> {
            Err(ChannelError::Unavailable("offline".into()))
        }
    }

    fn manager(
        config: AlertingConfig,
        clock: Arc<ManualClock>,
    ) -> (AlertManager, Arc<MemoryChannel>) {
        let memory = Arc::new(MemoryChannel::new());
        let manager = AlertManager::builder(config)
            .clock(clock)
            .channel(memory.clone())
            .build();
        (manager, memory)
    }

    #[tokio::test]
    async fn test_high_raises_alert() {
        let (manager, memory) = manager(AlertingConfig::default(), Arc::new(ManualClock::fixed()));
        let record = exception(Severity::High);

        let raised = manager.route(&record).await;

        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].exception_id, Some(record.id));
        assert_eq!(raised[0].level, Severity::High);
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_low_is_logged_only() {
        let (manager, memory) = manager(AlertingConfig::default(), Arc::new(ManualClock::fixed()));
        assert!(manager.route(&exception(Severity::Low)).await.is_empty());
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_fires_once_per_window() {
        let clock = Arc::new(ManualClock::fixed());
        let (manager, _) = manager(AlertingConfig::default(), clock.clone());

        let mut fired_at = Vec::new();
        for i in 1..=11 {
            clock.advance(Duration::from_secs(1));
            if !manager.route(&exception(Severity::Medium)).await.is_empty() {
                fired_at.push(i);
            }
        }
        assert_eq!(fired_at, vec![10]);

        let alert = &manager.alerts()[0];
        assert_eq!(alert.level, Severity::High);
        assert_eq!(alert.exception_id, None);
        assert_eq!(alert.details.count, 10);

        clock.advance(Duration::from_secs(300));
        for _ in 0..10 {
            manager.route(&exception(Severity::Medium)).await;
        }
        assert_eq!(manager.statistics().threshold_alerts, 2);
    }

    #[tokio::test]
    async fn test_threshold_every_entry() {
        let config = AlertingConfig {
            refire: RefirePolicy::EveryEntry,
            ..AlertingConfig::default()
        };
        let (manager, _) = manager(config, Arc::new(ManualClock::fixed()));

        for _ in 0..12 {
            manager.route(&exception(Severity::Medium)).await;
        }
        assert_eq!(manager.statistics().threshold_alerts, 3);
    }

    #[tokio::test]
    async fn test_failing_channel_is_isolated() {
        let memory = Arc::new(MemoryChannel::new());
        let manager = AlertManager::builder(AlertingConfig::default())
            .clock(Arc::new(ManualClock::fixed()))
            .channel(Arc::new(BrokenChannel))
            .channel(memory.clone())
            .build();

        let alert = manager.route(&exception(Severity::Critical)).await.remove(0);
        let results = manager.dispatch(&alert).await;

        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("Channel unavailable: offline"));
        assert!(results[1].success);
        assert_eq!(memory.len(), 2);
        assert_eq!(manager.statistics().dispatch_failures, 2);
    }

    #[tokio::test]
    async fn test_critical_sends_urgent_notification() {
        let clock = Arc::new(ManualClock::fixed());
        let sink = Arc::new(MemorySink::new());
        let queue = NotificationQueue::new(
            NotificationConfig::default(),
            sink.clone(),
            clock.clone(),
            EventBus::default(),
        );
        let manager = AlertManager::builder(AlertingConfig::default())
            .clock(clock)
            .notifications(queue)
            .build();

        manager.route(&exception(Severity::Critical)).await;

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].priority, Priority::Urgent);
    }

    #[tokio::test]
    async fn test_acknowledge_and_resolve() {
        let (manager, _) = manager(AlertingConfig::default(), Arc::new(ManualClock::fixed()));
        let record = exception(Severity::High);
        let alert = manager.route(&record).await.remove(0);

        let acked = manager.acknowledge(alert.id, "oncall").unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("oncall"));

        assert_eq!(manager.resolve_for_exception(record.id), 1);
        assert!(manager.active_alerts().is_empty());
        assert!(manager.get(alert.id).unwrap().resolved);

        assert!(matches!(
            manager.resolve_alert(Uuid::new_v4()),
            Err(Error::NotFound { .. })
        ));
    }
}
