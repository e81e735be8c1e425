//! Alert and notification data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of an exception or alert
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Low impact
    Low,
    /// Medium impact
    #[default]
    Medium,
    /// High impact
    High,
    /// Critical
    Critical,
}

impl Severity {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Log level label used for log entries
    pub fn log_level(self) -> &'static str {
        match self {
            Self::Critical | Self::High => "ERROR",
            Self::Medium => "WARN",
            Self::Low | Self::Info => "INFO",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context copied from the exception that raised an alert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertDetails {
    /// Exception category
    pub category: String,
    /// Component that failed
    pub component: String,
    /// Workflow, if any
    pub workflow_id: Option<String>,
    /// Number of entries summarized by this alert
    pub count: usize,
}

/// A raised alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier
    pub id: Uuid,

    /// Alert level
    pub level: Severity,

    /// Source exception, `None` for threshold alerts
    pub exception_id: Option<Uuid>,

    /// Human-readable message
    pub message: String,

    /// Context details
    pub details: AlertDetails,

    /// When the alert was raised
    pub created_at: DateTime<Utc>,

    /// Whether someone acknowledged it
    pub acknowledged: bool,

    /// Who acknowledged it
    pub acknowledged_by: Option<String>,

    /// When it was acknowledged
    pub acknowledged_at: Option<DateTime<Utc>>,

    /// Whether the underlying issue is resolved
    pub resolved: bool,

    /// When it was resolved
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Delivery urgency of a notification. Lower rank is delivered first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Delivered immediately
    Urgent = 0,
    /// Delivered with the next batch
    #[default]
    Standard = 1,
    /// Delivered with the next batch, after standard ones
    Batched = 2,
}

impl Priority {
    /// Ordering rank
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// What a notification carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Exception that caused the notification
    pub exception_id: Uuid,
    /// Exception severity
    pub severity: Severity,
    /// Exception category
    pub category: String,
    /// Failing component
    pub component: String,
    /// Workflow, if any
    pub workflow_id: Option<String>,
    /// Error message
    pub message: String,
}

/// A queued notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier
    pub id: Uuid,

    /// Content
    pub payload: NotificationPayload,

    /// Delivery urgency
    pub priority: Priority,

    /// Failed delivery attempts so far
    pub attempts: u32,

    /// When it entered the queue
    pub queued_at: DateTime<Utc>,

    /// Error from the last failed delivery
    pub last_error: Option<String>,
}

/// Outcome of dispatching an alert to one channel
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub channel: String,
    pub success: bool,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn test_priority_rank() {
        assert_eq!(Priority::Urgent.rank(), 0);
        assert_eq!(Priority::Standard.rank(), 1);
        assert_eq!(Priority::Batched.rank(), 2);
        assert!(Priority::Urgent < Priority::Batched);
    }
}
