//! Raw failure and context models

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error code attached to a failure
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    /// Numeric status (HTTP-like)
    Status(u16),
    /// Symbolic code such as `NETWORK_ERROR`
    Named(String),
}

impl ErrorCode {
    /// Numeric status, if this is one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(s) => Some(*s),
            Self::Named(_) => None,
        }
    }

    /// Symbolic name, if this is one
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::Named(n) => Some(n),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(s) => write!(f, "{s}"),
            Self::Named(n) => f.write_str(n),
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(status: u16) -> Self {
        Self::Status(status)
    }
}

impl From<&str> for ErrorCode {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for ErrorCode {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

/// A failure raised by an operation, in whatever shape it arrived.
///
/// Operations are opaque to the scheduler, so their errors are normalized into
/// this record before classification. Any `std::error::Error` converts into it,
/// with the source chain preserved as `cause`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    /// Error kind name, `"Error"` when unknown
    pub name: String,
    /// Human-readable message
    pub message: String,
    /// Optional machine-readable code
    pub code: Option<ErrorCode>,
    /// Optional backtrace or stack text
    pub stack: Option<String>,
    /// Underlying cause
    pub cause: Option<Box<OperationError>>,
}

impl OperationError {
    /// Create a generic error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            code: None,
            stack: None,
            cause: None,
        }
    }

    /// Create an error with an explicit kind name
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::new(message)
        }
    }

    /// Attach a code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<ErrorCode>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach stack text
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a cause
    #[must_use]
    pub fn with_cause(mut self, cause: OperationError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build from any error, walking its source chain
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut this = Self::new(err.to_string());
        if let Some(source) = err.source() {
            this.cause = Some(Box::new(Self::from_error(source)));
        }
        this
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        let mut this = Self::from_error(&err);
        this.name = "IoError".to_string();
        if err.kind() == std::io::ErrorKind::TimedOut {
            this.code = Some(ErrorCode::from("TIMEOUT"));
        }
        this
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_error(err.as_ref())
    }
}

impl From<&str> for OperationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for OperationError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Where a failure happened.
///
/// Shared by classification, task submission and exception records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub component: Option<String>,
    pub operation: Option<String>,
    pub workflow_id: Option<String>,
    pub execution_id: Option<String>,
    pub task_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    /// Caller-supplied category hint
    pub category: Option<String>,
    /// Extra tags appended to the exception record
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form attributes
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ErrorContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    #[must_use]
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    #[must_use]
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Component name, `"unknown"` when unset
    pub fn component_or_unknown(&self) -> &str {
        self.component.as_deref().unwrap_or("unknown")
    }
}
