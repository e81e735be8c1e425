//! Error types for the resilience subsystem

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::classifier::ErrorType;
use crate::models::OperationError;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for store, configuration and persistence operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Snapshot load or save failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Why a submission was refused before its first attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionReason {
    /// The global cooldown is active
    Cooldown { until: DateTime<Utc> },
    /// Every concurrency slot is taken and the queue is full
    Capacity { active: usize, queued: usize },
    /// The current hour's attempt budget is spent
    RateBudget { used: u32, limit: u32 },
    /// The scheduler is shutting down
    ShuttingDown,
}

impl std::fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cooldown { until } => write!(f, "global cooldown active until {}", until.to_rfc3339()),
            Self::Capacity { active, queued } => {
                write!(f, "capacity exhausted ({active} active, {queued} queued)")
            }
            Self::RateBudget { used, limit } => {
                write!(f, "hourly attempt budget exhausted ({used}/{limit})")
            }
            Self::ShuttingDown => write!(f, "scheduler is shutting down"),
        }
    }
}

/// Errors surfaced to callers of the retry scheduler
#[derive(Error, Debug, Clone)]
pub enum RetryError {
    /// Refused synchronously, before any attempt was made
    #[error("Admission rejected: {0}")]
    AdmissionRejected(AdmissionReason),

    /// The operation failed and will not be attempted again
    #[error("Retry failed after {attempts} attempts ({error_type}): {cause}")]
    RetryExhausted {
        task_id: Uuid,
        attempts: u32,
        elapsed: Duration,
        error_type: ErrorType,
        #[source]
        cause: OperationError,
    },

    /// The task was cancelled before it could finish
    #[error("Retry {task_id} cancelled")]
    Cancelled { task_id: Uuid },
}

impl RetryError {
    /// Whether this is an admission rejection
    pub fn is_admission_rejected(&self) -> bool {
        matches!(self, Self::AdmissionRejected(_))
    }

    /// Whether the task exhausted its attempts
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Whether the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Number of attempts made, when known
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Failure reported by an alert channel or notification sink
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
