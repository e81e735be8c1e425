//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classifier::{default_strategies, StrategyTable};
use crate::error::{Error, Result};
use crate::models::RetryPolicy;

/// Prefix for environment overrides, e.g. `RESILIENCE__LIMITS__MAX_CONCURRENT_RETRIES=4`
pub const ENV_PREFIX: &str = "RESILIENCE";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retry policies
    pub retry: RetryConfig,

    /// Admission limits
    pub limits: LimitsConfig,

    /// Failure-rate monitoring
    pub monitoring: MonitoringConfig,

    /// Alerting configuration
    pub alerts: AlertingConfig,

    /// Notification queue configuration
    pub notifications: NotificationConfig,

    /// Exception store persistence
    pub persistence: PersistenceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load defaults, then an optional file, then `RESILIENCE__*` env variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the subsystem cannot run with
    pub fn validate(&self) -> Result<()> {
        self.retry.default_policy.validate()?;
        for (error_type, over) in &self.retry.strategies {
            self.retry
                .default_policy
                .merge(over)
                .validate()
                .map_err(|e| Error::validation(format!("strategy '{error_type}': {e}")))?;
        }
        if self.limits.max_concurrent_retries == 0 {
            return Err(Error::validation("max_concurrent_retries must be at least 1"));
        }
        if self.limits.max_retries_per_hour == 0 {
            return Err(Error::validation("max_retries_per_hour must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.monitoring.failure_rate_threshold) {
            return Err(Error::validation("failure_rate_threshold must be within [0, 1]"));
        }
        if self.alerts.error_threshold == 0 {
            return Err(Error::validation("error_threshold must be at least 1"));
        }
        if self.notifications.batch_size == 0 {
            return Err(Error::validation("notification batch_size must be at least 1"));
        }
        if self.notifications.max_retries == 0 {
            return Err(Error::validation("notification max_retries must be at least 1"));
        }
        if self.persistence.max_entries < 2 {
            return Err(Error::validation("persistence max_entries must be at least 2"));
        }
        Ok(())
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policy every task starts from
    pub default_policy: RetryPolicy,
    /// Per-type overrides, keyed by classifier type name
    pub strategies: StrategyTable,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_policy: RetryPolicy::default(),
            strategies: default_strategies(),
        }
    }
}

/// Admission and housekeeping limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Tasks allowed to run at once
    pub max_concurrent_retries: usize,
    /// Admitted tasks allowed to wait for a slot
    pub retry_queue_size: usize,
    /// Attempts allowed per clock hour
    pub max_retries_per_hour: u32,
    /// Cooldown duration in milliseconds
    pub global_retry_cooldown_ms: u64,
    /// Age after which maintenance reclaims a task (ms)
    pub max_task_age_ms: u64,
    /// Scheduler maintenance period (ms)
    pub maintenance_interval_ms: u64,
}

impl LimitsConfig {
    pub fn global_retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.global_retry_cooldown_ms)
    }

    pub fn max_task_age(&self) -> Duration {
        Duration::from_millis(self.max_task_age_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_retries: 10,
            retry_queue_size: 1_000,
            max_retries_per_hour: 100,
            global_retry_cooldown_ms: 60_000,
            max_task_age_ms: 30 * 60 * 1_000,
            maintenance_interval_ms: 60_000,
        }
    }
}

/// Failure-rate monitoring over recent task outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether to evaluate the failure rate
    pub enabled: bool,
    /// Failure share (0..=1) that raises `HighFailureRate`
    pub failure_rate_threshold: f64,
    /// Whether to keep an outcome history
    pub store_history: bool,
    /// History entries kept before truncating to half
    pub max_history_size: usize,
    /// History older than this is dropped by maintenance
    pub history_retention_hours: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_rate_threshold: 0.8,
            store_history: true,
            max_history_size: 10_000,
            history_retention_hours: 24,
        }
    }
}

/// What a threshold alert does after it fired inside a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RefirePolicy {
    /// Stay silent until `time_window` has elapsed since the last firing
    #[default]
    OncePerWindow,
    /// Fire on every qualifying entry while the count is over threshold
    EveryEntry,
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Whether alerts are raised at all
    pub enabled: bool,
    /// Qualifying entries within the window that raise a threshold alert
    pub error_threshold: usize,
    /// Rolling window in milliseconds
    pub time_window_ms: u64,
    /// Threshold re-fire behavior
    pub refire: RefirePolicy,
    /// Drop low/info exceptions without logging
    pub suppress_low_severity: bool,
    /// Built-in channels, in dispatch order: `log`, `storage`, `event`
    pub channels: Vec<String>,
    /// Alerts kept in history
    pub max_history: usize,
}

impl AlertingConfig {
    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold: 10,
            time_window_ms: 5 * 60 * 1_000,
            refire: RefirePolicy::OncePerWindow,
            suppress_low_severity: false,
            channels: vec!["log".to_string(), "storage".to_string()],
            max_history: 1_000,
        }
    }
}

/// What happens to a notification that ran out of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Discard it
    #[default]
    Discard,
    /// Keep it in a bounded dead-letter list
    DeadLetter,
}

/// Notification queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Deliver urgent notifications without waiting for a batch
    pub immediate: bool,
    /// Notifications delivered per drain
    pub batch_size: usize,
    /// Longest wait before a partial batch is drained (ms)
    pub batch_timeout_ms: u64,
    /// Delivery attempts per notification
    pub max_retries: u32,
    /// Queue capacity
    pub capacity: usize,
    /// Fate of notifications out of attempts
    pub drop_policy: DropPolicy,
    /// Dead letters kept
    pub dead_letter_capacity: usize,
    /// Pause before draining leftovers after a batch (ms)
    pub redrain_delay_ms: u64,
}

impl NotificationConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn redrain_delay(&self) -> Duration {
        Duration::from_millis(self.redrain_delay_ms)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            immediate: true,
            batch_size: 5,
            batch_timeout_ms: 10_000,
            max_retries: 3,
            capacity: 1_000,
            drop_policy: DropPolicy::Discard,
            dead_letter_capacity: 100,
            redrain_delay_ms: 1_000,
        }
    }
}

/// Exception store persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Whether snapshots are saved
    pub enabled: bool,
    /// Records kept before truncating to half
    pub max_entries: usize,
    /// Evict old resolved records during maintenance
    pub auto_cleanup: bool,
    /// Age after which resolved records are evicted
    pub retention_days: u32,
    /// Store maintenance period (ms)
    pub cleanup_interval_ms: u64,
    /// JSON snapshot file, none for memory-only
    pub snapshot_path: Option<PathBuf>,
}

impl PersistenceConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            auto_cleanup: true,
            retention_days: 7,
            cleanup_interval_ms: 5 * 60 * 1_000,
            snapshot_path: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorType;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.max_concurrent_retries, 10);
        assert_eq!(config.notifications.batch_size, 5);
        assert_eq!(config.retry.strategies.len(), 6);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.monitoring.failure_rate_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "limits": {{ "max_concurrent_retries": 4 }},
                "alerts": {{ "refire": "every_entry" }},
                "retry": {{ "strategies": {{ "network": {{ "max_attempts": 7 }} }} }}
            }}"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.limits.max_concurrent_retries, 4);
        assert_eq!(config.limits.retry_queue_size, 1_000);
        assert_eq!(config.alerts.refire, RefirePolicy::EveryEntry);
        assert_eq!(
            config.retry.strategies[&ErrorType::Network].max_attempts,
            Some(7)
        );
    }
}
