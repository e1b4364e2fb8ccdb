//! Scheduler error types.

use thiserror::Error;

/// Errors raised by the schedule registry.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A cron expression could not be parsed or never fires.
    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidScheduleExpression {
        /// The expression as supplied.
        expression: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A fired job returned an error or panicked.
    ///
    /// Logged and recorded in the run history; the entry stays scheduled.
    #[error("Job '{job}' failed: {reason}")]
    JobExecutionFailure {
        /// Display name of the job.
        job: String,
        /// Failure description.
        reason: String,
    },
}
