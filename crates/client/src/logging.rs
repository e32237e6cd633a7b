//! Tracing subscriber setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "linewire.log";

/// Builds the filter: `RUST_LOG` when set, else the configured level.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// Logs go to stderr, or to a daily rolling file when a directory is
/// configured. The returned guard flushes the file writer on drop and must be
/// held for the life of the process. If a subscriber is already installed
/// this logs nothing and returns `None`.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = build_filter(config);

    match &config.directory {
        Some(directory) => {
            let appender = rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init();
            match installed {
                Ok(()) => {
                    tracing::info!("Logging to {:?}", directory);
                    Some(guard)
                }
                Err(_) => None,
            }
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_filter_uses_configured_level() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "debug".to_string(),
            directory: None,
        };
        assert_eq!(build_filter(&config).to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_filter_prefers_rust_log() {
        std::env::set_var("RUST_LOG", "warn");
        let config = LoggingConfig::default();
        let filter = build_filter(&config);
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    #[serial]
    fn test_init_twice_does_not_panic() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_none());
    }
}
