//! Relay Bot - Main entry point.

use relay_bot::run;
use relay_common::logging::{bootstrap_subscriber, init_logging};
use relay_common::{ConfigFile, Validate};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let config_file = ConfigFile::from_env();

    // Load configuration; the real subscriber depends on it
    let loaded = tracing::subscriber::with_default(bootstrap_subscriber(), || config_file.load());
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            init_logging("info", "pretty", &[]);
            tracing::error!(path = %config_file.path().display(), error = %e, "Couldn't load config");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    init_logging(&config.log_level, &config.log_format, &config.log_quiet_targets);

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }
    config.log_defaults();

    tracing::info!("Relay Bot v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(()) => tracing::info!("Shutdown signal received, finishing running turns"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
            }
            cancel.cancel();
        });
    }

    match run(config, config_file, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Relay bot failed");
            ExitCode::FAILURE
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
