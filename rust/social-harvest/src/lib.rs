//! Social Harvest - harvest coordination core
//!
//! Periodically harvests social-media data per geographic territory, fans
//! every harvested record out to storage and to live stream clients, and
//! exposes schedule and territory data over HTTP:
//!
//! - **Scheduling**: cron expressions with seconds, one entry per territory
//!   schedule plus an empty-document cleanup
//! - **Event bus**: topic pub/sub with bounded, non-blocking delivery
//! - **Storage**: one worker per record kind persisting to a document store
//! - **Streaming**: paced NDJSON feeds of live records
//!
//! # Architecture
//!
//! - [`config`]: Layered configuration and validation
//! - [`scheduler`]: Cron parsing and the schedule registry
//! - [`events`]: Generic topic event bus
//! - [`domain`]: Harvested record types
//! - [`storage`]: Document stores and the storage dispatcher
//! - [`stream`]: Subscription to NDJSON bridge
//! - [`harvest`]: Network adapter seam and harvest jobs
//! - [`orchestrator`]: Composition root
//! - [`api`]: HTTP API endpoints
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use social_harvest::{config::AppConfig, harvest::LoggingAdapter, server::create_app};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let shutdown = CancellationToken::new();
//!     let (app, orchestrator) = create_app(config, Arc::new(LoggingAdapter), &shutdown).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     orchestrator.shutdown().await;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod config;
pub mod domain;
pub mod events;
pub mod harvest;
pub mod logging;
pub mod orchestrator;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod stream;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use orchestrator::HarvestContext;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Configuration, bus, store and schedule.
    pub context: HarvestContext,
    /// Cancelled on shutdown; live streams hold child tokens.
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("context", &self.context)
            .field("shutting_down", &self.shutdown.is_cancelled())
            .field("started_at", &self.started_at)
            .finish()
    }
}
