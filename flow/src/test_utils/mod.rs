//! Test fixtures: recording fakes for the activity and child-workflow
//! seams, a timed notification helper, and builders for orchestrators.

pub mod activities;
pub mod catalog;
pub mod children;
pub mod notify;
pub mod workflow;
