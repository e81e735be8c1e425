//! Retry scheduling
//!
//! The [`RetryScheduler`] admits operations, retries them with exponential
//! backoff and enforces the concurrency cap, the hourly attempt budget and the
//! global cooldown.

pub mod backoff;
mod history;
pub mod limits;
mod scheduler;
mod task;

pub use history::{
    BudgetStatus, CategoryStats, FailureRate, HistoryEntry, Outcome, Overview, RetryStatistics,
};
pub use limits::CooldownStatus;
pub use scheduler::{
    MaintenanceReport, RetryScheduler, RetrySchedulerBuilder, DEFAULT_CATEGORY,
};
pub use task::{RetryHandle, ScheduleEntry, SubmitOptions, TaskContext, TaskInfo, TaskState};
