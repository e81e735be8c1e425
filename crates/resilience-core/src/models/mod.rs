//! Data models for the resilience subsystem

mod alert;
mod exception;
mod failure;
mod policy;
mod stats;

pub use alert::*;
pub use exception::*;
pub use failure::*;
pub use policy::*;
pub use stats::*;
