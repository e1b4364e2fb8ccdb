//! Configuration management for Social Harvest.
//!
//! Configuration is layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. The configuration file (`--conf`, default `social-harvest-conf.{json,yaml,toml}`)
//! 3. Environment variables prefixed `SOCIAL_HARVEST`, nested with `__`
//!    (e.g. `SOCIAL_HARVEST__SERVER__PORT=8080`)
//!
//! # Validation
//!
//! Use [`ConfigValidator`] to validate the result before startup:
//!
//! ```rust,ignore
//! use social_harvest::config::{AppConfig, ConfigValidator};
//!
//! let config = AppConfig::load_unchecked(None)?;
//! ConfigValidator::validate(&config)?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration file looked up when `--conf` is not given.
pub const DEFAULT_CONF_NAME: &str = "social-harvest-conf";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "SOCIAL_HARVEST";

/// Port used when the configured port is 0.
pub const FALLBACK_PORT: u16 = 3000;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP API server.
    #[serde(default)]
    pub server: ServerConfig,
    /// Document store.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Territories and their harvest schedules.
    #[serde(default)]
    pub harvest: HarvestConfig,
    /// Live stream pacing and buffering.
    #[serde(default)]
    pub stream: StreamConfig,
    /// Schedule registry tuning.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate configuration.
    ///
    /// `conf` names the configuration file; when `None` the default file is
    /// used if present.
    pub fn load(conf: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(conf)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(conf: Option<&Path>) -> ConfigResult<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let file = match conf {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONF_NAME).required(false),
        };
        let source = conf.map_or_else(
            || DEFAULT_CONF_NAME.to_string(),
            |path| path.display().to_string(),
        );

        let config = config::Config::builder()
            .set_default("server.host", default_host())
            .and_then(|b| b.set_default("scheduler.cleanup_expression", default_cleanup_expression()))
            .map_err(|e| ConfigurationError::load("built-in defaults", e))?
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors.allowed_origins"),
            )
            .build()
            .map_err(|e| ConfigurationError::load(&source, e))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::load(source, e))
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// API port. 0 means the fallback port 3000.
    #[serde(default)]
    pub port: u16,
    /// Run without the HTTP API (scheduler and storage only).
    #[serde(default)]
    pub disabled: bool,
    /// Request timeout in seconds for non-streaming routes.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Cross-origin settings.
    #[serde(default)]
    pub cors: CorsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            disabled: false,
            timeout_secs: default_timeout(),
            cors: CorsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Port to listen on.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 { FALLBACK_PORT } else { self.port }
    }

    /// `host:port` to bind.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.effective_port())
    }
}

/// Cross-origin settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed to call the API. Empty disables CORS handling.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Document store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// In-process collections, lost on exit.
    #[default]
    Memory,
    /// `SQLite` file.
    Sqlite,
}

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database file, required by the sqlite driver.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Records buffered per storage worker before new ones are dropped.
    #[serde(default = "default_worker_buffer")]
    pub worker_buffer: usize,
}

fn default_worker_buffer() -> usize {
    crate::storage::DEFAULT_WORKER_BUFFER
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            path: None,
            worker_buffer: default_worker_buffer(),
        }
    }
}

/// Harvest configuration (served by `/config/read`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default)]
    pub territories: Vec<Territory>,
}

/// A named grouping of accounts and keywords harvested on its own schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Territory {
    pub name: String,
    #[serde(default)]
    pub schedule: TerritorySchedule,
    #[serde(default)]
    pub content: TerritoryContent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerritorySchedule {
    #[serde(default)]
    pub everything: EverythingSchedule,
}

/// Cron expressions for full harvests. Empty means not scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EverythingSchedule {
    #[serde(default)]
    pub accounts: String,
    #[serde(default)]
    pub content: String,
}

/// What a territory harvests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerritoryContent {
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Account ids per network (`twitter`, `facebook`, ...).
    #[serde(default)]
    pub accounts: std::collections::BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub languages: Vec<String>,
}

/// Live stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Pause between two lines to the same client, in milliseconds.
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
    /// Events buffered per bus subscriber before new ones are dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_pace_ms() -> u64 {
    1000
}

fn default_subscriber_buffer() -> usize {
    crate::events::DEFAULT_SUBSCRIBER_CAPACITY
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pace_ms: default_pace_ms(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }
}

/// Schedule registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Runs kept in the history.
    #[serde(default = "default_run_history_limit")]
    pub run_history_limit: usize,
    /// Schedule of the empty document cleanup.
    #[serde(default = "default_cleanup_expression")]
    pub cleanup_expression: String,
}

fn default_run_history_limit() -> usize {
    crate::scheduler::registry::DEFAULT_RUN_HISTORY
}

fn default_cleanup_expression() -> String {
    "*/5 * * * * *".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_history_limit: default_run_history_limit(),
            cleanup_expression: default_cleanup_expression(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to use JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_conf(extension: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{extension}"))
            .tempfile()
            .unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.effective_port(), 3000);
        assert!(!config.server.disabled);
        assert_eq!(config.database.driver, DatabaseDriver::Memory);
        assert_eq!(config.stream.pace(), Duration::from_secs(1));
        assert_eq!(config.stream.subscriber_buffer, 256);
        assert_eq!(config.scheduler.cleanup_expression, "*/5 * * * * *");
        assert!(config.harvest.territories.is_empty());
    }

    #[test]
    #[serial]
    fn test_load_json_file() {
        let file = write_conf(
            "json",
            r#"{
                "server": { "port": 8080, "cors": { "allowed_origins": ["http://localhost"] } },
                "harvest": {
                    "territories": [{
                        "name": "midwest",
                        "schedule": { "everything": { "accounts": "*/5 * * * * *" } },
                        "content": {
                            "keywords": ["rust"],
                            "accounts": { "twitter": ["rustlang"] },
                            "languages": ["en"]
                        }
                    }]
                }
            }"#,
        );

        let config = AppConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.server.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.server.cors.allowed_origins, vec!["http://localhost"]);
        let territory = &config.harvest.territories[0];
        assert_eq!(territory.name, "midwest");
        assert_eq!(territory.schedule.everything.accounts, "*/5 * * * * *");
        assert!(territory.schedule.everything.content.is_empty());
        assert_eq!(territory.content.accounts["twitter"], vec!["rustlang"]);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_conf("yaml", "server:\n  port: 8080\nstream:\n  pace_ms: 500\n");

        // SAFETY: serialized with the other environment tests.
        unsafe { std::env::set_var("SOCIAL_HARVEST__SERVER__PORT", "9090") };
        let config = AppConfig::load_unchecked(Some(file.path()));
        // SAFETY: serialized with the other environment tests.
        unsafe { std::env::remove_var("SOCIAL_HARVEST__SERVER__PORT") };

        let config = config.unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.stream.pace_ms, 500);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let err = AppConfig::load_unchecked(Some(Path::new("/nonexistent/harvest.json")))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::Load { .. }));
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_schedule() {
        let file = write_conf(
            "json",
            r#"{ "harvest": { "territories": [
                { "name": "x", "schedule": { "everything": { "content": "not a cron" } } }
            ] } }"#,
        );
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("not a cron"));
    }
}
