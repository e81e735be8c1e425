//! Task records, submission options and the caller-side handle

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::classifier::ErrorType;
use crate::error::RetryError;
use crate::models::{ErrorContext, PolicyOverride};

/// Lifecycle of a retry task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, waiting for a concurrency slot
    Queued,
    /// Holds a slot, first attempt not started yet
    Admitted,
    /// An attempt is in progress
    Attempting,
    /// Waiting out the backoff delay
    Retrying,
    /// Terminal states; a finished task is gone from the scheduler, so these
    /// are only ever derived from the handle's outcome
    Succeeded,
    Exhausted,
    Cancelled,
}

impl TaskState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted | Self::Cancelled)
    }

    /// Terminal state a task reached, read from what its handle resolved to.
    /// `None` for an admission rejection, which never produced a task.
    pub fn of_outcome<T>(outcome: &Result<T, RetryError>) -> Option<Self> {
        match outcome {
            Ok(_) => Some(Self::Succeeded),
            Err(RetryError::RetryExhausted { .. }) => Some(Self::Exhausted),
            Err(RetryError::Cancelled { .. }) => Some(Self::Cancelled),
            Err(RetryError::AdmissionRejected(_)) => None,
        }
    }
}

/// One scheduled retry
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    /// Attempt number the delay precedes
    pub attempt: u32,
    pub delay: Duration,
    /// Type of the failure that caused the retry
    pub error_type: ErrorType,
    pub timestamp: DateTime<Utc>,
}

/// Passed to the operation on every attempt
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    /// 1-based attempt number
    pub attempt: u32,
    pub category: String,
    pub context: ErrorContext,
}

/// Per-submission options
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Category used to pick a strategy; `"default"` when unset
    pub category: Option<String>,
    /// Context handed to the operation and to the exception store
    pub context: ErrorContext,
    /// Overrides applied last when resolving the policy
    pub policy: PolicyOverride,
    /// Higher runs earlier when queued
    pub priority: i32,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: PolicyOverride) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Read-only view of a live task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub category: String,
    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub context: ErrorContext,
    pub schedule: Vec<ScheduleEntry>,
}

/// Resolves to the operation's result once the task reaches a terminal state
#[derive(Debug)]
pub struct RetryHandle<T> {
    task_id: Uuid,
    rx: oneshot::Receiver<Result<T, RetryError>>,
}

impl<T> RetryHandle<T> {
    pub(crate) fn new(task_id: Uuid, rx: oneshot::Receiver<Result<T, RetryError>>) -> Self {
        Self { task_id, rx }
    }

    /// Id to pass to `cancel`
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl<T> Future for RetryHandle<T> {
    type Output = Result<T, RetryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task_id = self.task_id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RetryError::Cancelled { task_id })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_handle_resolves_when_result_is_sent() {
        let (tx, rx) = oneshot::channel();
        let mut handle = task::spawn(RetryHandle::new(Uuid::new_v4(), rx));

        assert_pending!(handle.poll());
        tx.send(Ok(5)).unwrap();

        assert!(handle.is_woken());
        assert_eq!(assert_ready!(handle.poll()).unwrap(), 5);
    }

    #[test]
    fn test_dropped_sender_reads_as_cancelled() {
        let (tx, rx) = oneshot::channel::<Result<(), RetryError>>();
        let id = Uuid::new_v4();
        let mut handle = task::spawn(RetryHandle::new(id, rx));

        drop(tx);

        let result = assert_ready!(handle.poll());
        assert!(matches!(result, Err(RetryError::Cancelled { task_id }) if task_id == id));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Retrying.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
    }

    #[test]
    fn test_outcome_maps_to_terminal_state() {
        let id = Uuid::new_v4();
        let exhausted: Result<(), _> = Err(RetryError::RetryExhausted {
            task_id: id,
            attempts: 3,
            elapsed: Duration::from_millis(30),
            error_type: ErrorType::Network,
            cause: crate::models::OperationError::new("Network timeout"),
        });
        let cancelled: Result<(), _> = Err(RetryError::Cancelled { task_id: id });
        let rejected: Result<(), _> = Err(RetryError::AdmissionRejected(
            crate::error::AdmissionReason::ShuttingDown,
        ));

        assert_eq!(TaskState::of_outcome(&Ok::<_, RetryError>(1)), Some(TaskState::Succeeded));
        assert_eq!(TaskState::of_outcome(&exhausted), Some(TaskState::Exhausted));
        assert_eq!(TaskState::of_outcome(&cancelled), Some(TaskState::Cancelled));
        assert_eq!(TaskState::of_outcome(&rejected), None);
        assert!(TaskState::of_outcome(&exhausted).is_some_and(TaskState::is_terminal));
    }
}
