//! Alert delivery channels

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error::ChannelError;
use crate::models::{Alert, Severity};

/// Alerts kept by [`MemoryChannel`]
pub const MEMORY_CHANNEL_CAPACITY: usize = 100;

/// Destination for raised alerts
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Name reported in dispatch results
    fn name(&self) -> &str;

    /// Deliver one alert
    async fn dispatch(&self, alert: &Alert) -> Result<(), ChannelError>;
}

/// Writes alerts to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn dispatch(&self, alert: &Alert) -> Result<(), ChannelError> {
        match alert.level {
            Severity::Critical | Severity::High => error!(
                alert_id = %alert.id,
                level = %alert.level,
                category = %alert.details.category,
                component = %alert.details.component,
                "ALERT: {}",
                alert.message
            ),
            Severity::Medium => warn!(
                alert_id = %alert.id,
                level = %alert.level,
                category = %alert.details.category,
                "ALERT: {}",
                alert.message
            ),
            Severity::Low | Severity::Info => {
                info!(alert_id = %alert.id, level = %alert.level, "ALERT: {}", alert.message)
            }
        }
        Ok(())
    }
}

/// Keeps the newest alerts in memory
#[derive(Debug)]
pub struct MemoryChannel {
    alerts: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Stored alerts, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertChannel for MemoryChannel {
    fn name(&self) -> &str {
        "storage"
    }

    async fn dispatch(&self, alert: &Alert) -> Result<(), ChannelError> {
        let mut alerts = self.alerts.lock();
        alerts.push_back(alert.clone());
        while alerts.len() > self.capacity {
            alerts.pop_front();
        }
        Ok(())
    }
}

/// Re-broadcasts full alerts to in-process subscribers
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<Alert>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl AlertChannel for EventChannel {
    fn name(&self) -> &str {
        "event"
    }

    async fn dispatch(&self, alert: &Alert) -> Result<(), ChannelError> {
        // No subscribers is not a failure
        let _ = self.tx.send(alert.clone());
        Ok(())
    }
}

/// Built-in channel for a configured name
pub fn channel_from_name(name: &str) -> Option<Arc<dyn AlertChannel>> {
    match name {
        "log" | "console" => Some(Arc::new(LogChannel)),
        "storage" | "memory" => Some(Arc::new(MemoryChannel::new())),
        "event" | "notification" => Some(Arc::new(EventChannel::default())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertDetails;
    use chrono::Utc;
    use uuid::Uuid;

    fn alert(message: &str) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            level: Severity::High,
            exception_id: None,
            message: message.to_string(),
            details: AlertDetails::default(),
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn test_memory_channel_keeps_newest() {
        let channel = MemoryChannel::with_capacity(2);
        for message in ["a", "b", "c"] {
            channel.dispatch(&alert(message)).await.unwrap();
        }

        let kept: Vec<String> = channel.alerts().into_iter().map(|a| a.message).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_event_channel_broadcasts() {
        let channel = EventChannel::default();
        let mut rx = channel.subscribe();

        channel.dispatch(&alert("disk full")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().message, "disk full");
    }

    #[test]
    fn test_channel_from_name() {
        assert_eq!(channel_from_name("log").unwrap().name(), "log");
        assert_eq!(channel_from_name("storage").unwrap().name(), "storage");
        assert_eq!(channel_from_name("event").unwrap().name(), "event");
        assert!(channel_from_name("pager").is_none());
    }
}
