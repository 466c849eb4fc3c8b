//! Tracing subscriber setup. Logs go to stderr so report output on stdout
//! stays clean for piping.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Calling this twice is harmless; the second install is ignored.
pub fn init(config: &LoggingConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(&config.level))
        .with_writer(std::io::stderr);

    let _ = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Run `f` under a default stderr subscriber. Used while the configuration
/// that decides the real subscriber is still being loaded.
pub fn bootstrap<T>(f: impl FnOnce() -> T) -> T {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter(&LoggingConfig::default().level))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_returns_closure_value() {
        let config = bootstrap(|| {
            tracing::warn!("configuration warning");
            LoggingConfig::default()
        });
        assert_eq!(config.level, "info");
    }
}
