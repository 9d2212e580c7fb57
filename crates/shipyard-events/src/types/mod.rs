//! Event types module.

pub mod base;

pub use base::{AnyEvent, ApprovalEvent, EventEnvelope, EventMetadata, ReleaseEvent, RunEvent};
