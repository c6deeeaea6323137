//! Structured logging setup
//!
//! Provides JSON-formatted and human-readable logging on stderr, so that
//! command output on stdout stays machine readable.

use crate::config::LoggingConfig;
use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging based on configuration.
///
/// `RUST_LOG` takes precedence over `config.level` when set.
///
/// # Errors
///
/// Fails if the level is not a valid filter directive or a global
/// subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use toolgate::config::LoggingConfig;
/// use toolgate::logging::init_tracing;
///
/// let config = LoggingConfig {
///     level: "toolgate=debug".to_string(),
///     json: false,
/// };
///
/// let result = init_tracing(&config);
/// assert!(result.is_ok());
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_writer(std::io::stderr);
        registry.with(layer).try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "toolgate=loudest".to_string(),
            json: false,
        };
        assert!(init_tracing(&config).is_err());
    }
}
