//! Classified exception records and their query types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::alert::Severity;
use super::failure::{ErrorCode, ErrorContext, OperationError};
use crate::classifier::ErrorType;

/// Error fields captured on an exception record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub code: Option<ErrorCode>,
    /// Message of the underlying cause
    pub cause: Option<String>,
}

impl From<&OperationError> for ErrorDetails {
    fn from(err: &OperationError) -> Self {
        Self {
            name: err.name.clone(),
            message: err.message.clone(),
            stack: err.stack.clone(),
            code: err.code.clone(),
            cause: err.cause.as_ref().map(|c| c.message.clone()),
        }
    }
}

/// A stored, classified exception
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedException {
    /// Unique identifier
    pub id: Uuid,

    /// When it was handled
    pub timestamp: DateTime<Utc>,

    /// The failure itself
    pub error: ErrorDetails,

    /// Where it happened
    pub context: ErrorContext,

    /// Classifier verdict
    pub category: ErrorType,

    /// Effective severity
    pub severity: Severity,

    /// Whether the classifier considered it retryable
    pub retryable: bool,

    /// Derived tags
    pub tags: Vec<String>,

    /// Whether it has been resolved
    pub resolved: bool,

    /// When it was resolved
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Free-text resolution note
    pub resolution_note: Option<String>,
}

/// Input for resolving an exception
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resolution {
    /// Defaults to `"system"`
    pub resolved_by: Option<String>,
    pub note: Option<String>,
}

impl Resolution {
    pub fn by(who: impl Into<String>) -> Self {
        Self {
            resolved_by: Some(who.into()),
            note: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Filters for searching stored exceptions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchCriteria {
    /// Case-insensitive text matched against message, component and category
    pub text: Option<String>,
    pub category: Option<ErrorType>,
    pub severity: Option<Severity>,
    pub component: Option<String>,
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub to: Option<DateTime<Utc>>,
    pub resolved: Option<bool>,
    /// Page size, 50 when unset
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SearchCriteria {
    pub const DEFAULT_LIMIT: usize = 50;

    /// Whether a record passes every filter
    pub fn matches(&self, exception: &ClassifiedException) -> bool {
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            let hit = exception.error.message.to_lowercase().contains(&needle)
                || exception
                    .context
                    .component_or_unknown()
                    .to_lowercase()
                    .contains(&needle)
                || exception.category.as_str().contains(&needle);
            if !hit {
                return false;
            }
        }
        if self.category.is_some_and(|c| c != exception.category) {
            return false;
        }
        if self.severity.is_some_and(|s| s != exception.severity) {
            return false;
        }
        if let Some(component) = &self.component {
            if exception.context.component_or_unknown() != component {
                return false;
            }
        }
        if self.from.is_some_and(|from| exception.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| exception.timestamp > to) {
            return false;
        }
        if self.resolved.is_some_and(|r| r != exception.resolved) {
            return false;
        }
        true
    }
}

/// One page of search results
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults<T> {
    pub results: Vec<T>,
    /// Matches before pagination
    pub total: usize,
    pub has_more: bool,
}

/// Flat log line derived from an exception record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub category: ErrorType,
    pub severity: Severity,
    pub component: String,
}

impl From<&ClassifiedException> for LogEntry {
    fn from(exception: &ClassifiedException) -> Self {
        Self {
            id: exception.id,
            timestamp: exception.timestamp,
            level: exception.severity.log_level().to_string(),
            message: exception.error.message.clone(),
            category: exception.category,
            severity: exception.severity,
            component: exception.context.component_or_unknown().to_string(),
        }
    }
}
