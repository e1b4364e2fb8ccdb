//! Network adapter seam and the scheduled harvest jobs that call it.
//!
//! The adapters that talk to Twitter, Facebook and friends live outside this
//! crate. They implement [`HarvestAdapter`] and publish what they find through
//! the [`HarvestRun`] handed to them.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Territory;
use crate::domain::{HARVEST_TOPIC, HarvestEvent};
use crate::events::{HarvestBus, PublishReport};
use crate::scheduler::Job;

/// One invocation of an adapter for one territory.
#[derive(Debug, Clone)]
pub struct HarvestRun {
    harvest_id: String,
    territory: Territory,
    bus: HarvestBus,
}

impl HarvestRun {
    /// Start a run with a fresh harvest id.
    pub fn new(territory: Territory, bus: HarvestBus) -> Self {
        Self {
            harvest_id: Uuid::new_v4().to_string(),
            territory,
            bus,
        }
    }

    /// Identifier to stamp on every record of this run.
    pub fn harvest_id(&self) -> &str {
        &self.harvest_id
    }

    pub fn territory(&self) -> &Territory {
        &self.territory
    }

    /// Hand a harvested record to storage and live streams.
    pub fn publish(&self, event: HarvestEvent) -> PublishReport {
        self.bus.publish(HARVEST_TOPIC, event)
    }
}

/// Network adapter collaborator.
#[async_trait]
pub trait HarvestAdapter: Send + Sync + 'static {
    /// Harvest every configured account of the run's territory.
    async fn harvest_accounts(&self, run: &HarvestRun) -> anyhow::Result<()>;

    /// Harvest content matching the run's territory keywords.
    async fn harvest_content(&self, run: &HarvestRun) -> anyhow::Result<()>;
}

/// Adapter that only logs invocations.
///
/// Used by the binary until real network adapters are plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAdapter;

#[async_trait]
impl HarvestAdapter for LoggingAdapter {
    async fn harvest_accounts(&self, run: &HarvestRun) -> anyhow::Result<()> {
        let territory = run.territory();
        tracing::info!(
            territory = %territory.name,
            harvest_id = run.harvest_id(),
            networks = territory.content.accounts.len(),
            "Harvesting all accounts"
        );
        Ok(())
    }

    async fn harvest_content(&self, run: &HarvestRun) -> anyhow::Result<()> {
        let territory = run.territory();
        tracing::info!(
            territory = %territory.name,
            harvest_id = run.harvest_id(),
            keywords = territory.content.keywords.len(),
            "Harvesting all content"
        );
        Ok(())
    }
}

/// What a scheduled harvest collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestScope {
    Accounts,
    Content,
}

impl HarvestScope {
    /// Label used in schedule entry names.
    pub fn label(self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Content => "content",
        }
    }

    /// Schedule entry name for an expression, e.g.
    /// `Harvesting all accounts - */5 * * * * *`.
    pub fn entry_name(self, expression: &str) -> String {
        format!("Harvesting all {} - {expression}", self.label())
    }
}

/// Scheduled job running one adapter call for one territory.
pub struct HarvestJob {
    name: String,
    scope: HarvestScope,
    territory: Territory,
    adapter: Arc<dyn HarvestAdapter>,
    bus: HarvestBus,
}

impl std::fmt::Debug for HarvestJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestJob")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("territory", &self.territory.name)
            .finish_non_exhaustive()
    }
}

impl HarvestJob {
    pub fn new(
        scope: HarvestScope,
        territory: Territory,
        adapter: Arc<dyn HarvestAdapter>,
        bus: HarvestBus,
    ) -> Self {
        Self {
            name: format!("harvest_all_{}({})", scope.label(), territory.name),
            scope,
            territory,
            adapter,
            bus,
        }
    }
}

#[async_trait]
impl Job for HarvestJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> anyhow::Result<()> {
        let run = HarvestRun::new(self.territory.clone(), self.bus.clone());
        match self.scope {
            HarvestScope::Accounts => self.adapter.harvest_accounts(&run).await,
            HarvestScope::Content => self.adapter.harvest_content(&run).await,
        }
    }
}
