//! Configuration validation for Social Harvest.
//!
//! Validation runs once at startup and reports every problem at once, so an
//! operator can fix a configuration file in one pass.

use std::collections::HashSet;

use super::error::{ConfigResult, ConfigurationError};
use super::{
    AppConfig, DatabaseConfig, DatabaseDriver, HarvestConfig, SchedulerConfig, ServerConfig,
    StreamConfig,
};
use crate::scheduler::CronParser;

/// Configuration validator.
///
/// The validator enforces the following rules:
///
/// | Setting                              | Rule                               |
/// |--------------------------------------|------------------------------------|
/// | `server.timeout_secs`                | greater than zero                  |
/// | `harvest.territories[].name`         | non-empty, unique                  |
/// | `harvest.territories[].schedule.*`   | empty, or a valid cron expression  |
/// | `scheduler.cleanup_expression`       | valid cron expression              |
/// | `stream.pace_ms`                     | greater than zero                  |
/// | `stream.subscriber_buffer`           | greater than zero                  |
/// | `database.path`                      | required by the `sqlite` driver    |
/// | `database.worker_buffer`             | greater than zero                  |
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration.
    ///
    /// Returns `Ok(())` if valid, or a `ConfigurationError` with all issues.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        errors.extend(Self::validate_server(&config.server));
        errors.extend(Self::validate_harvest(&config.harvest));
        errors.extend(Self::validate_scheduler(&config.scheduler));
        errors.extend(Self::validate_stream(&config.stream));
        errors.extend(Self::validate_database(&config.database));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::multiple(errors))
        }
    }

    /// Check the API server settings.
    pub fn validate_server(server: &ServerConfig) -> Vec<ConfigurationError> {
        if server.timeout_secs == 0 {
            vec![ConfigurationError::invalid(
                "server.timeout_secs must be greater than zero",
                "Set SOCIAL_HARVEST__SERVER__TIMEOUT_SECS to a positive number of seconds (default 30)",
            )]
        } else {
            Vec::new()
        }
    }

    /// Check territory names and schedule expressions.
    pub fn validate_harvest(harvest: &HarvestConfig) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (i, territory) in harvest.territories.iter().enumerate() {
            let name = territory.name.trim();
            if name.is_empty() {
                errors.push(ConfigurationError::invalid(
                    format!("harvest.territories[{i}] has no name"),
                    "Give every territory a unique, non-empty name",
                ));
            } else if !seen.insert(name) {
                errors.push(ConfigurationError::invalid(
                    format!("territory '{name}' is configured more than once"),
                    "Merge the duplicate territories or rename one of them",
                ));
            }

            let everything = &territory.schedule.everything;
            for (field, expression) in [
                ("accounts", &everything.accounts),
                ("content", &everything.content),
            ] {
                if expression.trim().is_empty() {
                    continue;
                }
                if let Err(e) = CronParser::parse(expression) {
                    errors.push(schedule_error(
                        format!("harvest.territories[{i}].schedule.everything.{field}"),
                        expression,
                        &e,
                    ));
                }
            }
        }

        errors
    }

    /// Check the maintenance schedule.
    pub fn validate_scheduler(scheduler: &SchedulerConfig) -> Vec<ConfigurationError> {
        match CronParser::parse(&scheduler.cleanup_expression) {
            Ok(_) => Vec::new(),
            Err(e) => vec![schedule_error(
                "scheduler.cleanup_expression",
                &scheduler.cleanup_expression,
                &e,
            )],
        }
    }

    /// Check stream pacing and buffering.
    pub fn validate_stream(stream: &StreamConfig) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();
        if stream.pace_ms == 0 {
            errors.push(ConfigurationError::invalid(
                "stream.pace_ms must be greater than zero",
                "Set SOCIAL_HARVEST__STREAM__PACE_MS to a positive number of milliseconds (default 1000)",
            ));
        }
        if stream.subscriber_buffer == 0 {
            errors.push(ConfigurationError::invalid(
                "stream.subscriber_buffer must be greater than zero",
                "Set SOCIAL_HARVEST__STREAM__SUBSCRIBER_BUFFER to a positive number (default 256)",
            ));
        }
        errors
    }

    /// Check the document store settings.
    pub fn validate_database(database: &DatabaseConfig) -> Vec<ConfigurationError> {
        let missing_path = database
            .path
            .as_ref()
            .is_none_or(|path| path.as_os_str().is_empty());

        let mut errors = Vec::new();
        if database.driver == DatabaseDriver::Sqlite && missing_path {
            errors.push(ConfigurationError::missing_required(
                "database.path",
                "the sqlite document store",
                "SOCIAL_HARVEST__DATABASE__PATH",
            ));
        }
        if database.worker_buffer == 0 {
            errors.push(ConfigurationError::invalid(
                "database.worker_buffer must be greater than zero",
                "Set SOCIAL_HARVEST__DATABASE__WORKER_BUFFER to a positive number (default 4096)",
            ));
        }
        errors
    }
}

fn schedule_error(
    setting: impl Into<String>,
    expression: &str,
    error: &crate::scheduler::SchedulerError,
) -> ConfigurationError {
    let reason = match error {
        crate::scheduler::SchedulerError::InvalidScheduleExpression { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    ConfigurationError::invalid_schedule(setting, expression, reason)
}
