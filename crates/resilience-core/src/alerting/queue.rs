//! Batched notification delivery
//!
//! Notifications are kept in priority order. Urgent ones are delivered at once,
//! the rest when a batch fills up or the batch timeout expires. Failed
//! deliveries go back to the tail of their priority class until they run out
//! of attempts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{SharedClock, TokioClock};
use crate::config::{DropPolicy, NotificationConfig};
use crate::error::ChannelError;
use crate::events::{EventBus, LifecycleEvent};
use crate::models::{Notification, NotificationPayload, Priority};

/// Final destination of notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError>;
}

/// Writes notifications to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        let payload = &notification.payload;
        info!(
            notification_id = %notification.id,
            priority = ?notification.priority,
            severity = %payload.severity,
            category = %payload.category,
            component = %payload.component,
            "Notification: {}",
            payload.message
        );
        Ok(())
    }
}

/// Publishes `NotificationDelivered` on the event bus
#[derive(Debug, Clone)]
pub struct EventSink {
    events: EventBus,
}

impl EventSink {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl NotificationSink for EventSink {
    fn name(&self) -> &str {
        "event"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.events.publish(LifecycleEvent::NotificationDelivered {
            notification_id: notification.id,
            priority: notification.priority,
        });
        Ok(())
    }
}

/// Keeps delivered notifications in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivered notifications, in delivery order
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.delivered.lock().push(notification.clone());
        Ok(())
    }
}

/// Queue counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotificationStatistics {
    pub pending: usize,
    pub dead_letters: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub dropped: u64,
    /// Refused because the queue was full
    pub refused: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Ordered by priority rank, FIFO within a rank
    pending: VecDeque<Notification>,
    dead_letters: VecDeque<Notification>,
    timer_armed: bool,
    redrain_armed: bool,
    stats: NotificationStatistics,
}

impl QueueState {
    /// Insert at the tail of the notification's priority class
    fn insert(&mut self, notification: Notification) {
        let rank = notification.priority.rank();
        let position = self
            .pending
            .iter()
            .position(|n| n.priority.rank() > rank)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, notification);
    }
}

struct QueueInner {
    config: NotificationConfig,
    clock: SharedClock,
    events: EventBus,
    sink: Arc<dyn NotificationSink>,
    state: Mutex<QueueState>,
    draining: AtomicBool,
}

/// Priority queue of notifications; cheap to clone
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueue")
            .field("sink", &self.inner.sink.name())
            .field("pending", &self.len())
            .finish()
    }
}

impl NotificationQueue {
    pub fn new(
        config: NotificationConfig,
        sink: Arc<dyn NotificationSink>,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                clock,
                events,
                sink,
                state: Mutex::new(QueueState::default()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Queue delivering to the log on tokio time
    pub fn with_defaults() -> Self {
        Self::new(
            NotificationConfig::default(),
            Arc::new(LogSink),
            TokioClock::shared(),
            EventBus::default(),
        )
    }

    /// Queue a notification. Returns its id, or `None` when the queue is full.
    pub async fn enqueue(
        &self,
        payload: NotificationPayload,
        priority: Priority,
    ) -> Option<Uuid> {
        let inner = &self.inner;
        let notification = Notification {
            id: Uuid::new_v4(),
            payload,
            priority,
            attempts: 0,
            queued_at: inner.clock.now(),
            last_error: None,
        };
        let id = notification.id;

        let (drain_now, arm_timer) = {
            let mut state = inner.state.lock();
            if state.pending.len() >= inner.config.capacity {
                state.stats.refused += 1;
                drop(state);
                warn!(
                    notification_id = %id,
                    capacity = inner.config.capacity,
                    "Notification queue full, refusing notification"
                );
                return None;
            }

            state.insert(notification);
            state.stats.enqueued += 1;

            let drain_now = (priority == Priority::Urgent && inner.config.immediate)
                || state.pending.len() >= inner.config.batch_size;
            let arm_timer = !drain_now && !state.timer_armed;
            if arm_timer {
                state.timer_armed = true;
            }
            (drain_now, arm_timer)
        };

        debug!(notification_id = %id, ?priority, "Notification queued");

        if drain_now {
            self.drain().await;
        } else if arm_timer {
            let queue = self.clone();
            let timeout = inner.config.batch_timeout();
            tokio::spawn(async move {
                queue.inner.clock.sleep(timeout).await;
                queue.inner.state.lock().timer_armed = false;
                queue.drain().await;
            });
        }

        Some(id)
    }

    /// Deliver up to one batch. Returns how many were delivered; 0 when another
    /// drain is already in flight.
    pub fn drain(&self) -> BoxFuture<'_, usize> {
        // Boxed: timers spawned by `drain_batch` call back into `drain`
        Box::pin(async move { self.drain_batch().await.unwrap_or(0) })
    }

    /// Drain until nothing is pending; returns how many were delivered
    pub async fn flush(&self) -> usize {
        let mut delivered = 0;
        while !self.is_empty() {
            match self.drain_batch().await {
                Some(n) => delivered += n,
                None => tokio::task::yield_now().await,
            }
        }
        delivered
    }

    async fn drain_batch(&self) -> Option<usize> {
        let inner = &self.inner;
        if inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let batch: Vec<Notification> = {
            let mut state = inner.state.lock();
            let take = inner.config.batch_size.min(state.pending.len());
            state.pending.drain(..take).collect()
        };

        let mut delivered = 0;
        for mut notification in batch {
            match inner.sink.deliver(&notification).await {
                Ok(()) => {
                    delivered += 1;
                    inner.state.lock().stats.delivered += 1;
                    debug!(notification_id = %notification.id, "Notification delivered");
                }
                Err(e) => {
                    notification.attempts += 1;
                    notification.last_error = Some(e.to_string());
                    warn!(
                        notification_id = %notification.id,
                        attempts = notification.attempts,
                        sink = inner.sink.name(),
                        error = %e,
                        "Notification delivery failed"
                    );
                    self.retry_or_drop(notification);
                }
            }
        }

        inner.draining.store(false, Ordering::Release);

        let arm_redrain = {
            let mut state = inner.state.lock();
            let arm = !state.pending.is_empty() && !state.redrain_armed;
            if arm {
                state.redrain_armed = true;
            }
            arm
        };
        if arm_redrain {
            let queue = self.clone();
            let delay = inner.config.redrain_delay();
            tokio::spawn(async move {
                queue.inner.clock.sleep(delay).await;
                queue.inner.state.lock().redrain_armed = false;
                queue.drain().await;
            });
        }

        Some(delivered)
    }

    fn retry_or_drop(&self, notification: Notification) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        state.stats.failed_attempts += 1;

        if notification.attempts < inner.config.max_retries {
            state.insert(notification);
            return;
        }

        state.stats.dropped += 1;
        let (id, priority, attempts) = (
            notification.id,
            notification.priority,
            notification.attempts,
        );
        if inner.config.drop_policy == DropPolicy::DeadLetter {
            state.dead_letters.push_back(notification);
            while state.dead_letters.len() > inner.config.dead_letter_capacity {
                state.dead_letters.pop_front();
            }
        }
        drop(state);

        warn!(notification_id = %id, attempts, "Notification dropped after max retries");
        inner.events.publish(LifecycleEvent::NotificationDropped {
            notification_id: id,
            priority,
            attempts,
        });
    }

    /// Pending notifications in dispatch order
    pub fn pending(&self) -> Vec<Notification> {
        self.inner.state.lock().pending.iter().cloned().collect()
    }

    /// Notifications that ran out of attempts, when dead-lettering is on
    pub fn dead_letters(&self) -> Vec<Notification> {
        self.inner.state.lock().dead_letters.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> NotificationStatistics {
        let state = self.inner.state.lock();
        NotificationStatistics {
            pending: state.pending.len(),
            dead_letters: state.dead_letters.len(),
            ..state.stats.clone()
        }
    }
}
