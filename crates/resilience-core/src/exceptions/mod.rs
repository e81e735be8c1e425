//! Exception storage
//!
//! Every failure handed to the [`ExceptionStore`] is classified, recorded,
//! counted and routed to the alert manager. Records can be searched, resolved
//! and persisted through a [`SnapshotStore`].

mod snapshot;
mod store;

pub use snapshot::{
    ExceptionCounters, JsonFileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore,
};
pub use store::{ExceptionStatistics, ExceptionStore, ExceptionStoreBuilder, Trends};
