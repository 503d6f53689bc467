//! Logging setup for the relay bot.
//!
//! [`init_logging`] installs the process-wide subscriber once the
//! configuration is known. Before that, [`bootstrap_subscriber`] gives a
//! scoped stderr logger so that messages from loading the configuration
//! itself are not lost.
//!
//! HTTP and TLS internals are clamped to `warn`. `LOG_QUIET_TARGETS` adds
//! more targets, either bare (`wiremock`, clamped to `warn`) or with an
//! explicit level (`relay_bot::telegram=error`). `RUST_LOG` overrides all of it.

use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Library targets that are always clamped to `warn`.
pub const NOISY_MODULES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

/// Filter directive for one quiet target.
pub fn quiet_directive(target: &str) -> String {
    let target = target.trim();
    if target.contains('=') {
        target.to_string()
    } else {
        format!("{target}=warn")
    }
}

/// Check a quiet target before it reaches the filter, which would skip it.
pub fn parse_quiet_target(target: &str) -> Result<Directive, String> {
    quiet_directive(target)
        .parse::<Directive>()
        .map_err(|e| format!("'{target}': {e}"))
}

fn filter_directives(log_level: &str, quiet_targets: &[String]) -> String {
    let quiet = NOISY_MODULES
        .iter()
        .copied()
        .chain(quiet_targets.iter().map(String::as_str))
        .filter(|t| !t.trim().is_empty())
        .map(quiet_directive);

    std::iter::once(log_level.to_string())
        .chain(quiet)
        .collect::<Vec<_>>()
        .join(",")
}

fn build_filter(log_level: &str, quiet_targets: &[String]) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level, quiet_targets)))
}

/// Plain stderr logger for use with [`tracing::subscriber::with_default`]
/// while the configuration is being loaded.
pub fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter("info", &[]))
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish()
}

/// Install the global subscriber.
///
/// `log_format` is `json` for structured output with span close events, or
/// `pretty` for humans.
pub fn init_logging(log_level: &str, log_format: &str, quiet_targets: &[String]) {
    let registry = tracing_subscriber::registry().with(build_filter(log_level, quiet_targets));

    let installed = if log_format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_ansi(true).with_target(true))
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!(
            log_level = %log_level,
            log_format = %log_format,
            quiet_targets = NOISY_MODULES.len() + quiet_targets.len(),
            "Logging initialized"
        );
    }
}

/// Generate a new trace ID for an inbound message.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
