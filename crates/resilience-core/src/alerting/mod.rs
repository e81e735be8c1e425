//! Alerting for classified exceptions
//!
//! Routes exceptions by severity, raises threshold alerts and delivers
//! notifications through pluggable channels and sinks.

mod channel;
mod manager;
mod queue;

pub use channel::{
    channel_from_name, AlertChannel, EventChannel, LogChannel, MemoryChannel,
    MEMORY_CHANNEL_CAPACITY,
};
pub use manager::{AlertManager, AlertManagerBuilder, AlertStatistics};
pub use queue::{
    EventSink, LogSink, MemorySink, NotificationQueue, NotificationSink, NotificationStatistics,
};
