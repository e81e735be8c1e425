//! Lifecycle event stream
//!
//! Components publish typed events on a shared broadcast bus; hosts subscribe
//! to observe admissions, attempts, alerts and so on.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::classifier::ErrorType;
use crate::models::{Priority, Severity};

/// Events published by the subsystem
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Task passed admission and holds a concurrency slot
    Admitted { task_id: Uuid, category: String, max_attempts: u32 },
    /// Task passed admission and waits for a slot
    Queued { task_id: Uuid, position: usize },
    /// A failed attempt will be retried after `delay`
    Attempt {
        task_id: Uuid,
        attempt: u32,
        max_attempts: u32,
        error: String,
        error_type: ErrorType,
        delay: Duration,
    },
    /// Task succeeded
    Success { task_id: Uuid, attempts: u32, elapsed: Duration },
    /// Task failed for good
    Failure { task_id: Uuid, attempts: u32, error: String, error_type: ErrorType },
    /// Task was cancelled
    Cancelled { task_id: Uuid },
    /// Admissions are suspended until `until`
    CooldownTriggered { until: DateTime<Utc>, reason: String },
    /// A success lifted the cooldown early
    CooldownCleared,
    /// Recent failure share crossed the monitoring threshold
    HighFailureRate { failure_rate: f64, failures: usize, total: usize, threshold: f64 },
    /// Queued tasks were dropped by `clear_queue`
    QueueCleared { cancelled: usize },
    /// An exception was classified and stored
    ExceptionHandled { exception_id: Uuid, category: ErrorType, severity: Severity },
    /// An exception was resolved
    ExceptionResolved { exception_id: Uuid, resolved_by: String },
    /// An alert was raised
    AlertCreated { alert_id: Uuid, level: Severity, message: String },
    /// A notification ran out of delivery attempts
    NotificationDropped { notification_id: Uuid, priority: Priority, attempts: u32 },
    /// A notification reached its sink
    NotificationDelivered { notification_id: Uuid, priority: Priority },
    /// A maintenance pass ran
    MaintenancePerformed { component: String, active: usize, queued: usize, reclaimed: usize },
}

/// Broadcast bus shared by every component
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    /// Default number of buffered events per subscriber
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; a bus without subscribers drops it
    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
