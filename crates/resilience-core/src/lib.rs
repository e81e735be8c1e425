//! # Resilience
//!
//! Retry scheduling, exception tracking and alerting for background workloads.
//!
//! Operations submitted to the [`RetryScheduler`](retry::RetryScheduler) are
//! retried with backoff under a concurrency cap, an hourly retry budget and a
//! global cooldown. Terminal failures are classified and kept by the
//! [`ExceptionStore`](exceptions::ExceptionStore), which routes them to the
//! [`AlertManager`](alerting::AlertManager) and its notification queue.
//!
//! ## Architecture
//!
//! - **Classifier**: Maps failures to categories, severities and retry strategies
//! - **Retry**: Admission control, backoff and outcome history
//! - **Exceptions**: Classified records, statistics and snapshots
//! - **Alerting**: Severity routing, threshold alerts and batched notifications
//!
//! ## Quick Start
//!
//! ```no_run
//! use resilience::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let hub = Resilience::new(Config::load(None)?);
//! let handle = hub
//!     .scheduler()
//!     .submit(|_ctx| async { Ok::<_, OperationError>(42) }, SubmitOptions::new())
//!     .map_err(|e| Error::validation(e.to_string()))?;
//! # let _ = handle.await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod exceptions;
pub mod hub;
pub mod models;
pub mod retry;

pub use config::Config;
pub use error::{Error, Result, RetryError};
pub use hub::Resilience;

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertManager, NotificationQueue};
    pub use crate::classifier::{ErrorClassifier, ErrorType};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result, RetryError};
    pub use crate::events::{EventBus, LifecycleEvent};
    pub use crate::exceptions::ExceptionStore;
    pub use crate::hub::Resilience;
    pub use crate::models::*;
    pub use crate::retry::{RetryScheduler, SubmitOptions, TaskContext};
}
