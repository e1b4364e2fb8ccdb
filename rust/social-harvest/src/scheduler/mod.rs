//! Recurring job scheduling.
//!
//! This module provides the cron-driven [`ScheduleRegistry`] that fires
//! harvesting and maintenance jobs and keeps an introspectable run history.

pub mod cron;
pub mod error;
pub mod job;
pub mod registry;

pub use cron::{CronExpression, CronParser};
pub use error::SchedulerError;
pub use job::{FnJob, Job, job_fn};
pub use registry::{EntryId, RunStatus, ScheduleEntry, ScheduleRegistry, ScheduleRun};
