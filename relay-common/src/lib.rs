//! Relay Common - configuration, errors and logging for the Telegram relay bot.
//!
//! This crate provides:
//! - The dotenv-backed configuration surface and its locked write-back
//! - Configuration validation
//! - Error types and context helpers
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{ConfigFile, EnvConfig};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{ConfigFile, EnvConfig};
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::{bootstrap_subscriber, init_logging};
    pub use crate::validation::{Validate, ValidationError};
}
