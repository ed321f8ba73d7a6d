//! Core data model: identifiers, schedules, and retry state.

pub mod retry;
pub mod schedule;
pub mod types;
