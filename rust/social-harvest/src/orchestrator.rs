//! Composition root.
//!
//! [`HarvestContext`] is the one object holding configuration, the event
//! bus, the document store and the schedule. It is built once and handed to
//! every component. [`Orchestrator`] wires territory schedules into the
//! registry, starts the storage workers and the tick loop, and stops them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::events::{EventBus, HarvestBus};
use crate::harvest::{HarvestAdapter, HarvestJob, HarvestScope};
use crate::scheduler::{EntryId, ScheduleRegistry, SchedulerError};
use crate::storage::dispatcher::CLEANUP_JOB_NAME;
use crate::storage::{
    DispatcherOptions, EmptyDocumentCleanup, Persistence, StorageDispatcher, WorkerGauge,
    WorkerStats,
};

/// Shared handles used by the scheduler, the workers and the API.
#[derive(Clone)]
pub struct HarvestContext {
    pub config: Arc<AppConfig>,
    pub bus: HarvestBus,
    pub store: Arc<dyn Persistence>,
    pub schedule: ScheduleRegistry,
    /// Storage workers running against `bus`.
    pub storage_workers: WorkerGauge,
}

impl std::fmt::Debug for HarvestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestContext")
            .field("territories", &self.config.harvest.territories.len())
            .field("bus", &self.bus)
            .field("store", &self.store.backend())
            .field("schedule", &self.schedule)
            .field("storage_workers", &self.storage_workers.running())
            .finish()
    }
}

impl HarvestContext {
    /// Build a context from configuration and an opened store.
    pub fn new(config: AppConfig, store: Arc<dyn Persistence>) -> Self {
        let bus = EventBus::with_capacity(config.stream.subscriber_buffer);
        let schedule = ScheduleRegistry::new(config.scheduler.run_history_limit);
        Self {
            config: Arc::new(config),
            bus,
            store,
            schedule,
            storage_workers: WorkerGauge::new(),
        }
    }
}

/// One row of the schedule listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleView {
    pub id: EntryId,
    pub name: String,
    pub next: DateTime<Utc>,
    pub prev: Option<DateTime<Utc>>,
    /// Display name of the job.
    pub job: String,
}

/// Register the maintenance entry and one entry per configured territory
/// schedule expression. Returns the number of entries added.
pub fn wire_schedule(
    context: &HarvestContext,
    adapter: &Arc<dyn HarvestAdapter>,
) -> Result<usize, SchedulerError> {
    let schedule = &context.schedule;

    schedule.add_job(
        &context.config.scheduler.cleanup_expression,
        CLEANUP_JOB_NAME,
        Arc::new(EmptyDocumentCleanup::new(Arc::clone(&context.store))),
    )?;
    let mut added = 1;

    for territory in &context.config.harvest.territories {
        let everything = &territory.schedule.everything;
        for (scope, expression) in [
            (HarvestScope::Accounts, everything.accounts.trim()),
            (HarvestScope::Content, everything.content.trim()),
        ] {
            if expression.is_empty() {
                continue;
            }
            let job = HarvestJob::new(
                scope,
                territory.clone(),
                Arc::clone(adapter),
                context.bus.clone(),
            );
            schedule.add_job(expression, scope.entry_name(expression), Arc::new(job))?;
            added += 1;
        }
    }

    Ok(added)
}

/// Running harvest core.
pub struct Orchestrator {
    context: HarvestContext,
    dispatcher: StorageDispatcher,
    ticker: JoinHandle<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("context", &self.context)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wire the schedule, start the storage workers, then the tick loop.
    ///
    /// Everything stops when `cancel` fires or on [`shutdown`](Self::shutdown).
    pub fn start(
        context: HarvestContext,
        adapter: Arc<dyn HarvestAdapter>,
        cancel: &CancellationToken,
    ) -> Result<Self, SchedulerError> {
        let cancel = cancel.child_token();

        let entries = wire_schedule(&context, &adapter)?;
        tracing::info!(entries, "Harvest schedule wired");

        // Workers subscribe before the first job can publish.
        let dispatcher = StorageDispatcher::start_with(
            &context.bus,
            Arc::clone(&context.store),
            DispatcherOptions {
                worker_buffer: context.config.database.worker_buffer,
                gauge: context.storage_workers.clone(),
            },
            &cancel,
        );
        let ticker = context.schedule.start(cancel.child_token());

        Ok(Self {
            context,
            dispatcher,
            ticker,
            cancel,
        })
    }

    pub fn context(&self) -> &HarvestContext {
        &self.context
    }

    /// Current schedule, ordered by next run.
    pub fn schedule_view(&self) -> Vec<ScheduleView> {
        schedule_view(&self.context.schedule)
    }

    pub fn dispatcher_stats(&self) -> Vec<WorkerStats> {
        self.dispatcher.stats()
    }

    /// Stop the tick loop and the storage workers and wait for both.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.ticker.await {
            tracing::error!(error = %e, "Schedule tick loop ended abnormally");
        }
        self.dispatcher.shutdown().await;
    }
}

/// Schedule listing for the API.
pub fn schedule_view(schedule: &ScheduleRegistry) -> Vec<ScheduleView> {
    schedule
        .entries()
        .into_iter()
        .map(|entry| ScheduleView {
            id: entry.id,
            name: entry.name,
            next: entry.next_run,
            prev: entry.prev_run,
            job: entry.job_name,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EverythingSchedule, Territory, TerritorySchedule};
    use crate::harvest::LoggingAdapter;
    use crate::storage::MemoryStore;

    fn config_with(territories: Vec<Territory>) -> AppConfig {
        let mut config = AppConfig::default();
        config.harvest.territories = territories;
        config
    }

    fn territory(name: &str, accounts: &str, content: &str) -> Territory {
        Territory {
            name: name.to_string(),
            schedule: TerritorySchedule {
                everything: EverythingSchedule {
                    accounts: accounts.to_string(),
                    content: content.to_string(),
                },
            },
            ..Default::default()
        }
    }

    fn context(territories: Vec<Territory>) -> HarvestContext {
        HarvestContext::new(config_with(territories), Arc::new(MemoryStore::new()))
    }

    fn adapter() -> Arc<dyn HarvestAdapter> {
        Arc::new(LoggingAdapter)
    }

    #[tokio::test]
    async fn test_no_territories_only_maintenance() {
        let ctx = context(Vec::new());
        assert_eq!(wire_schedule(&ctx, &adapter()).unwrap(), 1);

        let view = schedule_view(&ctx.schedule);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].name, CLEANUP_JOB_NAME);
        assert_eq!(view[0].job, CLEANUP_JOB_NAME);
        assert_eq!(view[0].prev, None);
    }

    #[tokio::test]
    async fn test_entry_per_configured_expression() {
        let ctx = context(vec![
            territory("north", "*/5 * * * * *", "0 */30 * * * *"),
            territory("south", "", "@hourly"),
            territory("idle", "", ""),
        ]);

        assert_eq!(wire_schedule(&ctx, &adapter()).unwrap(), 4);

        let names: Vec<String> = schedule_view(&ctx.schedule)
            .into_iter()
            .map(|view| view.name)
            .collect();
        assert!(names.contains(&"Harvesting all accounts - */5 * * * * *".to_string()));
        assert!(names.contains(&"Harvesting all content - 0 */30 * * * *".to_string()));
        assert!(names.contains(&"Harvesting all content - @hourly".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_territory_expression_fails_wiring() {
        let ctx = context(vec![territory("north", "61 * * * * *", "")]);
        assert!(matches!(
            wire_schedule(&ctx, &adapter()),
            Err(SchedulerError::InvalidScheduleExpression { .. })
        ));
    }

    #[tokio::test]
    async fn test_schedule_view_is_sorted_by_next_run() {
        let ctx = context(vec![territory("north", "@daily", "*/5 * * * * *")]);
        wire_schedule(&ctx, &adapter()).unwrap();

        let view = schedule_view(&ctx.schedule);
        assert!(view.windows(2).all(|pair| pair[0].next <= pair[1].next));
        assert_eq!(view.last().unwrap().name, "Harvesting all accounts - @daily");
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let ctx = context(vec![territory("north", "*/5 * * * * *", "")]);
        let bus = ctx.bus.clone();
        let workers = ctx.storage_workers.clone();
        let cancel = CancellationToken::new();

        let orchestrator = Orchestrator::start(ctx, adapter(), &cancel).unwrap();
        assert_eq!(orchestrator.schedule_view().len(), 2);
        assert_eq!(orchestrator.dispatcher_stats().len(), 5);
        assert_eq!(bus.subscriber_count(crate::domain::HARVEST_TOPIC), 5);
        assert_eq!(workers.running(), 5);

        orchestrator.shutdown().await;
        assert_eq!(bus.subscriber_count(crate::domain::HARVEST_TOPIC), 0);
        assert_eq!(workers.running(), 0);
    }
}
