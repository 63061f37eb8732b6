//! Durable CDC flow orchestration.
//!
//! This crate owns the lifecycle of a mirror: setup, initial snapshot,
//! continuous sync, dynamic table addition and removal, pause/resume,
//! resync, and termination. Connector-specific work (publications, DDL,
//! staged files, the sync engine itself) sits behind the
//! [`activities::FlowActivities`] and [`workflows::ChildFlows`] seams; the
//! catalog is the authoritative mirror of desired configuration and status.

pub mod activities;
pub mod catalog;
pub mod concurrency;
pub mod error;
mod macros;
pub mod model;
pub mod signals;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod workers;
pub mod workflows;
