//! Schedule registry and tick loop.
//!
//! The registry owns every [`ScheduleEntry`], fires due jobs on independent
//! tasks and records each firing as a [`ScheduleRun`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{CronExpression, CronParser, Job, SchedulerError};

/// Default number of runs kept in the history.
pub const DEFAULT_RUN_HISTORY: usize = 100;

/// Longest the tick loop sleeps without re-reading the clock.
const MAX_TICK_WAIT: Duration = Duration::from_secs(60);

/// Registry-assigned entry identifier. Increases with insertion order.
pub type EntryId = u64;

/// A snapshot of one scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Entry ID.
    pub id: EntryId,
    /// Human readable label (e.g. "Harvesting all accounts - 0 */30 * * * *").
    pub name: String,
    /// Cron expression as registered.
    pub cron: String,
    /// Display name of the job, captured at registration.
    pub job_name: String,
    /// Next scheduled firing.
    pub next_run: DateTime<Utc>,
    /// Previous firing, if any.
    pub prev_run: Option<DateTime<Utc>>,
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Job is still executing.
    Running,
    /// Job returned `Ok`.
    Succeeded,
    /// Job returned an error.
    Failed,
    /// Job panicked.
    Panicked,
}

/// A record of a schedule execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    /// Unique run ID.
    pub id: Uuid,
    /// Entry this run belongs to.
    pub entry_id: EntryId,
    /// Job display name.
    pub job_name: String,
    /// The `next_run` value that triggered this run.
    pub scheduled_for: DateTime<Utc>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Run status.
    pub status: RunStatus,
    /// Error message if failed.
    pub error: Option<String>,
}

struct EntryState {
    entry: ScheduleEntry,
    schedule: CronExpression,
    job: Arc<dyn Job>,
}

/// Cron-driven job registry.
///
/// Entries are only mutated by [`fire_due`](Self::fire_due); readers get
/// copies via [`entries`](Self::entries).
#[derive(Clone)]
pub struct ScheduleRegistry {
    /// Registered entries in insertion order.
    entries: Arc<RwLock<Vec<EntryState>>>,
    /// Run history, newest last.
    runs: Arc<RwLock<VecDeque<ScheduleRun>>>,
    /// Maximum runs kept in `runs`.
    run_history_limit: usize,
    next_id: Arc<AtomicU64>,
    /// Wakes the tick loop when a job is added.
    wake: Arc<Notify>,
}

impl std::fmt::Debug for ScheduleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleRegistry")
            .field("entries", &self.entries.read().len())
            .field("runs", &self.runs.read().len())
            .field("run_history_limit", &self.run_history_limit)
            .finish_non_exhaustive()
    }
}

impl ScheduleRegistry {
    /// Create an empty registry keeping at most `run_history_limit` runs.
    #[must_use]
    pub fn new(run_history_limit: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            runs: Arc::new(RwLock::new(VecDeque::new())),
            run_history_limit: run_history_limit.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Register a job under a cron expression.
    ///
    /// The new entry has no `prev_run` and its `next_run` is the first match
    /// after now.
    pub fn add_job(
        &self,
        expression: &str,
        name: impl Into<String>,
        job: Arc<dyn Job>,
    ) -> Result<EntryId, SchedulerError> {
        let schedule = CronParser::parse(expression)?;
        let next_run = schedule.next_after(&Utc::now()).ok_or_else(|| {
            SchedulerError::InvalidScheduleExpression {
                expression: expression.to_string(),
                reason: "expression never fires".to_string(),
            }
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ScheduleEntry {
            id,
            name: name.into(),
            cron: schedule.source().to_string(),
            job_name: job.name().to_string(),
            next_run,
            prev_run: None,
        };

        tracing::debug!(
            entry_id = id,
            name = %entry.name,
            cron = %entry.cron,
            next_run = %next_run,
            "Job scheduled"
        );

        self.entries.write().push(EntryState {
            entry,
            schedule,
            job,
        });
        self.wake.notify_one();
        Ok(id)
    }

    /// Snapshot of all entries ordered by `next_run`, ties by insertion.
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let mut entries: Vec<ScheduleEntry> = self
            .entries
            .read()
            .iter()
            .map(|state| state.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.next_run.cmp(&b.next_run).then(a.id.cmp(&b.id)));
        entries
    }

    /// Get one entry by ID.
    pub fn entry(&self, id: EntryId) -> Option<ScheduleEntry> {
        self.entries
            .read()
            .iter()
            .find(|state| state.entry.id == id)
            .map(|state| state.entry.clone())
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Most recent runs, newest first.
    pub fn runs(&self, limit: usize) -> Vec<ScheduleRun> {
        self.runs.read().iter().rev().take(limit).cloned().collect()
    }

    /// Most recent runs of one entry, newest first.
    pub fn runs_for(&self, entry_id: EntryId, limit: usize) -> Vec<ScheduleRun> {
        self.runs
            .read()
            .iter()
            .rev()
            .filter(|run| run.entry_id == entry_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Earliest `next_run` across all entries.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .iter()
            .map(|state| state.entry.next_run)
            .min()
    }

    /// Fire every entry due at `now` and return how many jobs were started.
    ///
    /// Each job runs on its own task. The entry's `prev_run`/`next_run` are
    /// updated under the write lock, so a second call with the same `now`
    /// fires nothing.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let mut started = 0;

        for state in entries.iter_mut().filter(|state| state.entry.next_run <= now) {
            let scheduled_for = state.entry.next_run;
            self.spawn_run(state, scheduled_for);

            state.entry.prev_run = Some(scheduled_for);
            state.entry.next_run = state
                .schedule
                .next_after(&now)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            started += 1;
        }

        started
    }

    /// Spawn the tick loop. It runs until `cancel` fires; jobs already
    /// running are left to finish on their own.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move { registry.run_loop(cancel).await })
    }

    async fn run_loop(self, cancel: CancellationToken) {
        tracing::info!(entries = self.len(), "Schedule tick loop started");

        loop {
            let fired = self.fire_due(Utc::now());
            if fired > 0 {
                tracing::debug!(fired, "Fired due jobs");
            }

            let wait = self.next_wake().map_or(MAX_TICK_WAIT, |next| {
                (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(MAX_TICK_WAIT)
            });

            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.wake.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("Schedule tick loop stopped");
    }

    fn spawn_run(&self, state: &EntryState, scheduled_for: DateTime<Utc>) {
        let run = ScheduleRun {
            id: Uuid::new_v4(),
            entry_id: state.entry.id,
            job_name: state.entry.job_name.clone(),
            scheduled_for,
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            error: None,
        };
        let run_id = run.id;
        self.record_run(run);

        let entry_id = state.entry.id;
        let job_name = state.entry.job_name.clone();
        let job = Arc::clone(&state.job);
        let runs = Arc::clone(&self.runs);

        tokio::spawn(async move {
            // The inner task isolates panics from the bookkeeping below.
            let outcome = tokio::spawn(async move { job.run().await }).await;

            let (status, error) = match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(entry_id, job = %job_name, "Scheduled job completed");
                    (RunStatus::Succeeded, None)
                }
                Ok(Err(e)) => {
                    let failure = SchedulerError::JobExecutionFailure {
                        job: job_name.clone(),
                        reason: format!("{e:#}"),
                    };
                    tracing::warn!(entry_id, error = %failure, "Scheduled job failed");
                    (RunStatus::Failed, Some(failure.to_string()))
                }
                Err(join_error) => {
                    let failure = SchedulerError::JobExecutionFailure {
                        job: job_name.clone(),
                        reason: join_error.to_string(),
                    };
                    tracing::error!(entry_id, error = %failure, "Scheduled job terminated abnormally");
                    (RunStatus::Panicked, Some(failure.to_string()))
                }
            };

            let mut runs = runs.write();
            if let Some(run) = runs.iter_mut().rev().find(|run| run.id == run_id) {
                run.completed_at = Some(Utc::now());
                run.status = status;
                run.error = error;
            }
        });
    }

    fn record_run(&self, run: ScheduleRun) {
        let mut runs = self.runs.write();
        runs.push_back(run);
        while runs.len() > self.run_history_limit {
            runs.pop_front();
        }
    }
}

impl Default for ScheduleRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RUN_HISTORY)
    }
}
