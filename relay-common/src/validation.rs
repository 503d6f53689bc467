//! Configuration validation for the relay bot.
//!
//! Checks that the mandatory keys are present and that the optional ones
//! hold values the bot can use.

use thiserror::Error;

use crate::config::{
    EnvConfig, KEY_LOG_FORMAT, KEY_LOG_QUIET_TARGETS, KEY_OPENAI_SESSION, KEY_TELEGRAM_TOKEN,
    LOG_FORMATS,
};
use crate::logging::parse_quiet_target;

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} is not set")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for EnvConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.telegram_token.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: KEY_TELEGRAM_TOKEN.into(),
            });
        }

        if self.openai_session.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: KEY_OPENAI_SESSION.into(),
            });
        }

        if !LOG_FORMATS.contains(&self.log_format.as_str()) {
            errors.push(ValidationError::InvalidValue {
                field: KEY_LOG_FORMAT.into(),
                reason: format!(
                    "expected one of {}, got '{}'",
                    LOG_FORMATS.join(", "),
                    self.log_format
                ),
            });
        }

        for target in &self.log_quiet_targets {
            if let Err(reason) = parse_quiet_target(target) {
                errors.push(ValidationError::InvalidValue {
                    field: KEY_LOG_QUIET_TARGETS.into(),
                    reason,
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}
