//! Repair orchestration for Mender.
//!
//! This crate provides:
//!
//! - [`RepairManager`] — owns the segment worker pool, the retry timer and the
//!   registry of per-run controllers; resumes runs after a restart.
//! - [`RepairRunner`] — drives one run: splits it into parallel slots and
//!   dispatches the next free segment of every idle slot.
//! - [`segment_runner`] — repairs one segment against a coordinator, with
//!   intensity throttling and hang recovery.
//! - [`SchedulingManager`] — turns due schedules into new runs.
//! - [`ClusterRepairScheduler`] — keeps one schedule per user keyspace.
//! - [`RunCleaner`] — removes finished scheduled runs once they expire.
//! - [`RepairService`] — the operations exposed to operators.

pub mod auto_scheduler;
pub mod cleaner;
pub mod context;
pub mod error;
pub mod manager;
pub mod runner;
pub mod scheduling;
pub mod segment_runner;
pub mod service;
pub mod setup;
pub mod throttle;

pub use auto_scheduler::{AUTO_SCHEDULE_OWNER, ClusterRepairScheduler, ScheduleDiff};
pub use cleaner::RunCleaner;
pub use context::{RepairContext, SegmentClaim, SegmentRegistry};
pub use error::RepairError;
pub use manager::RepairManager;
pub use runner::{RepairRunner, parallel_ranges, parallel_slots};
pub use scheduling::SchedulingManager;
pub use service::{NewRunRequest, NewScheduleRequest, RepairService, RunStatus};
pub use setup::RunParams;

#[cfg(test)]
mod tests;
