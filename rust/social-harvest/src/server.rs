//! Harvest core assembly, HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::config::{AppConfig, CorsConfig, DatabaseConfig, DatabaseDriver};
use crate::harvest::HarvestAdapter;
use crate::logging::OpTimer;
use crate::orchestrator::{HarvestContext, Orchestrator};
use crate::storage::{MemoryStore, Persistence, SqliteStore};
use crate::{AppState, log_banner, log_init_step, log_init_warning, log_success};

/// Social Harvest version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

const INIT_STEPS: u32 = 4;

/// Open the document store selected by configuration.
pub async fn open_store(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn Persistence>> {
    match config.driver {
        DatabaseDriver::Memory => Ok(Arc::new(MemoryStore::new())),
        DatabaseDriver::Sqlite => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("database.path is required for sqlite"))?;
            Ok(Arc::new(SqliteStore::new(path).await?))
        }
    }
}

/// Start the harvest core and build the HTTP application around it.
///
/// The schedule, storage workers and live streams all stop when `shutdown`
/// is cancelled; call [`Orchestrator::shutdown`] afterwards to wait for them.
pub async fn create_app(
    config: AppConfig,
    adapter: Arc<dyn HarvestAdapter>,
    shutdown: &CancellationToken,
) -> anyhow::Result<(Router, Orchestrator)> {
    let overall_timer = OpTimer::new("server", "create_app");

    log_banner!(
        format!("🌾 Social Harvest v{VERSION}"),
        format!(
            "Territories: {} | Store: {:?}",
            config.harvest.territories.len(),
            config.database.driver
        )
    );

    // [1/4] Document store
    let step_timer = OpTimer::new("server", "document_store");
    let store = open_store(&config.database).await;
    step_timer.finish_with_result(&store);
    let store = store?;
    let store_detail = match &config.database.path {
        Some(path) if config.database.driver == DatabaseDriver::Sqlite => {
            format!("🗄️  {} ({})", store.backend(), path.display())
        }
        _ => format!("🗄️  {}", store.backend()),
    };
    log_init_step!(1, INIT_STEPS, "Document Store", store_detail);

    // [2/4] Event bus
    let step_timer = OpTimer::new("server", "event_bus");
    if config.harvest.territories.is_empty() {
        log_init_warning!("No territories configured; only maintenance jobs will run");
    }
    let context = HarvestContext::new(config, store);
    log_init_step!(
        2,
        INIT_STEPS,
        "Event Bus",
        format!(
            "📬 {} slots per subscriber",
            context.config.stream.subscriber_buffer
        )
    );
    step_timer.finish();

    // [3/4] Schedule, storage workers and tick loop
    let step_timer = OpTimer::new("server", "orchestrator");
    let orchestrator = Orchestrator::start(context.clone(), adapter, shutdown)?;
    log_init_step!(
        3,
        INIT_STEPS,
        "Orchestrator",
        format!(
            "⏰ {} schedule entries, {} storage workers",
            context.schedule.len(),
            orchestrator.dispatcher_stats().len()
        )
    );
    step_timer.finish();

    // [4/4] Router
    let step_timer = OpTimer::new("server", "router");
    let app = create_router(AppState {
        context,
        shutdown: shutdown.clone(),
        started_at: Utc::now(),
    });
    log_init_step!(4, INIT_STEPS, "Router", "🌐 Routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    log_success!("Social Harvest started");
    tracing::info!("");

    Ok((app, orchestrator))
}

/// Build the router with all routes and middleware.
///
/// The request timeout covers every route except the live streams.
pub fn create_router(state: AppState) -> Router {
    let server = &state.context.config.server;

    let timed = api::create_router().layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(server.timeout_secs),
    ));

    let mut app = timed
        .merge(api::stream::router())
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(&server.cors) {
        app = app.layer(cors);
    }

    app.with_state(state)
}

/// CORS is only enabled when origins are configured.
fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(e) => {
                log_init_warning!("Ignoring invalid CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([
                header::ACCEPT,
                header::CONTENT_TYPE,
                header::ORIGIN,
                HeaderName::from_static("x-custom-header"),
            ])
            .allow_credentials(true)
            .max_age(Duration::from_secs(3600)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_disabled_without_origins() {
        assert!(cors_layer(&CorsConfig::default()).is_none());
    }

    #[test]
    fn test_cors_skips_invalid_origins() {
        let config = CorsConfig {
            allowed_origins: vec!["bad\norigin".to_string()],
        };
        assert!(cors_layer(&config).is_none());

        let config = CorsConfig {
            allowed_origins: vec!["http://localhost:8080".to_string()],
        };
        assert!(cors_layer(&config).is_some());
    }

    #[tokio::test]
    async fn test_open_store_requires_sqlite_path() {
        let config = DatabaseConfig {
            driver: DatabaseDriver::Sqlite,
            path: None,
            ..Default::default()
        };
        assert!(open_store(&config).await.is_err());

        let memory = open_store(&DatabaseConfig::default()).await.unwrap();
        assert_eq!(memory.backend(), "memory");
    }
}
