//! Tracing subscriber initialization.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use super::config::LoggingConfig;

/// Initialize the global tracing subscriber from configuration.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let default_level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_current_span(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
        other => return Err(anyhow!("unknown log format: {other}")),
    }
    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(anyhow!("unknown log level: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }
}
