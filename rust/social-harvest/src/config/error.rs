//! Configuration error types with actionable user messages.

use std::fmt;

/// Configuration errors with detailed, actionable messages.
///
/// Each variant carries enough context for an operator to find the offending
/// setting and fix it.
#[derive(Debug, Clone)]
pub enum ConfigurationError {
    /// Invalid configuration value.
    Invalid {
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },
    /// A territory schedule expression does not parse.
    InvalidSchedule {
        /// Dotted path of the setting.
        setting: String,
        /// The expression as configured.
        expression: String,
        /// Parser diagnosis.
        reason: String,
    },
    /// A required configuration is missing.
    MissingRequired {
        /// The missing setting name.
        setting: String,
        /// What feature requires this setting.
        context: String,
        /// Environment variable to set.
        env_var: String,
    },
    /// The configuration sources could not be read or deserialized.
    Load {
        /// Where the configuration came from.
        source: String,
        /// The underlying error.
        error: String,
    },
    /// Multiple errors occurred.
    Multiple(Vec<ConfigurationError>),
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { message, fix_hint } => {
                write!(
                    f,
                    "Invalid configuration: {message}\n\nHow to fix: {fix_hint}"
                )
            }
            Self::InvalidSchedule {
                setting,
                expression,
                reason,
            } => {
                write!(
                    f,
                    "Invalid schedule at {setting}: '{expression}'\n\n\
                    Reason: {reason}\n\
                    How to fix: use six cron fields (sec min hour dom month dow), \
                    e.g. '0 */30 * * * *', or a descriptor such as '@hourly'"
                )
            }
            Self::MissingRequired {
                setting,
                context,
                env_var,
            } => {
                write!(
                    f,
                    "Missing required configuration: {setting}\n\n\
                    Required for: {context}\n\
                    Set via: {env_var}"
                )
            }
            Self::Load { source, error } => {
                write!(f, "Failed to load configuration from {source}: {error}")
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple configuration errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "\n{}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    /// Create an invalid schedule error.
    #[must_use]
    pub fn invalid_schedule(
        setting: impl Into<String>,
        expression: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSchedule {
            setting: setting.into(),
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing required configuration error.
    #[must_use]
    pub fn missing_required(
        setting: impl Into<String>,
        context: impl Into<String>,
        env_var: impl Into<String>,
    ) -> Self {
        Self::MissingRequired {
            setting: setting.into(),
            context: context.into(),
            env_var: env_var.into(),
        }
    }

    /// Create a load error.
    #[must_use]
    pub fn load(source: impl Into<String>, error: impl fmt::Display) -> Self {
        Self::Load {
            source: source.into(),
            error: error.to_string(),
        }
    }

    /// Wrap a list of errors; a single error is returned unwrapped.
    #[must_use]
    pub fn multiple(mut errors: Vec<ConfigurationError>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Self::Multiple(errors)
        }
    }

    /// Check if this is a multiple errors wrapper.
    #[must_use]
    pub fn is_multiple(&self) -> bool {
        matches!(self, Self::Multiple(_))
    }

    /// Get the number of errors (1 for single errors, N for multiple).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;
