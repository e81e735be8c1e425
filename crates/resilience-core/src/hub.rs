//! Wires every component together
//!
//! [`Resilience`] owns one event bus, clock and classifier and hands them to
//! the scheduler, the exception store, the alert manager and the notification
//! queue so they all observe the same time and publish on the same bus.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::alerting::{AlertManager, EventSink, LogSink, NotificationQueue, NotificationSink};
use crate::classifier::ErrorClassifier;
use crate::clock::{SharedClock, TokioClock};
use crate::config::Config;
use crate::events::EventBus;
use crate::exceptions::{ExceptionStore, JsonFileSnapshotStore, SnapshotStore};
use crate::retry::RetryScheduler;

/// Fully wired resilience subsystem
pub struct Resilience {
    config: Config,
    events: EventBus,
    clock: SharedClock,
    classifier: ErrorClassifier,
    notifications: NotificationQueue,
    alerts: AlertManager,
    exceptions: ExceptionStore,
    scheduler: RetryScheduler,
    maintenance: Vec<JoinHandle<()>>,
}

impl Resilience {
    /// Build every component from a configuration, on tokio time
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, TokioClock::shared())
    }

    /// Build every component with an explicit clock
    pub fn with_clock(config: Config, clock: SharedClock) -> Self {
        let events = EventBus::default();
        let classifier = ErrorClassifier::new(config.retry.strategies.clone());

        // Notifications end up on the bus when the event channel is enabled
        let publishes = config
            .alerts
            .channels
            .iter()
            .any(|name| matches!(name.as_str(), "event" | "notification"));
        let sink: Arc<dyn NotificationSink> = if publishes {
            Arc::new(EventSink::new(events.clone()))
        } else {
            Arc::new(LogSink)
        };
        let notifications = NotificationQueue::new(
            config.notifications.clone(),
            sink,
            clock.clone(),
            events.clone(),
        );

        let alerts = AlertManager::builder(config.alerts.clone())
            .clock(clock.clone())
            .events(events.clone())
            .notifications(notifications.clone())
            .build();

        let mut store = ExceptionStore::builder(config.persistence.clone())
            .classifier(classifier.clone())
            .default_policy(config.retry.default_policy.clone())
            .clock(clock.clone())
            .events(events.clone())
            .alerts(alerts.clone());
        if let Some(path) = config.persistence.snapshot_path.as_ref() {
            let snapshots: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshotStore::new(path));
            store = store.snapshots(snapshots);
        }
        let exceptions = store.build();

        let scheduler = RetryScheduler::builder(
            config.retry.clone(),
            config.limits.clone(),
            config.monitoring.clone(),
        )
        .clock(clock.clone())
        .events(events.clone())
        .exception_store(exceptions.clone())
        .build();

        debug!(channels = ?alerts.channel_names(), "Resilience subsystem assembled");

        Self {
            config,
            events,
            clock,
            classifier,
            notifications,
            alerts,
            exceptions,
            scheduler,
            maintenance: Vec::new(),
        }
    }

    /// Restore persisted exceptions and alerts; returns the number of exceptions loaded
    pub async fn load(&self) -> usize {
        let loaded = self.exceptions.load().await;
        if loaded > 0 {
            info!(loaded, "Restored exception snapshot");
        }
        loaded
    }

    /// Start the periodic maintenance loops. Calling twice is a no-op.
    pub fn start_maintenance(&mut self) {
        if !self.maintenance.is_empty() {
            return;
        }
        self.maintenance.push(self.scheduler.spawn_maintenance());
        if self.config.persistence.auto_cleanup {
            self.maintenance.push(self.exceptions.spawn_maintenance());
        }
        info!(loops = self.maintenance.len(), "Maintenance started");
    }

    /// Stop admissions, flush notifications and persist the store
    pub async fn shutdown(&mut self) {
        info!("Shutting down resilience subsystem");
        self.scheduler.shutdown();
        for handle in self.maintenance.drain(..) {
            handle.abort();
        }

        let flushed = self.notifications.flush().await;
        if flushed > 0 {
            debug!(flushed, "Flushed pending notifications");
        }
        self.exceptions.persist().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub fn exceptions(&self) -> &ExceptionStore {
        &self.exceptions
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }
}

impl std::fmt::Debug for Resilience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resilience")
            .field("scheduler", &self.scheduler)
            .field("exceptions", &self.exceptions)
            .field("alerts", &self.alerts)
            .finish_non_exhaustive()
    }
}
