//! Subscriber initialisation.
//!
//! Library crates log through the `log` facade; orchestration crates emit
//! `tracing` events. Both end up in one `tracing-subscriber` fmt layer.
//! `XFER_LOG` wins over `RUST_LOG`, which wins over the configured level.

use crate::config::LogConfig;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "XFER_LOG";

/// Filter directive in effect for `config` given the current environment.
pub fn filter_directive(config: &LogConfig) -> String {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| config.level.clone())
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_new(filter_directive(config)).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns false when one is already set,
/// which is expected when an embedding application initialised its own.
pub fn init(config: &LogConfig) -> bool {
    let filter = build_filter(config);
    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_used_without_env() {
        if std::env::var(LOG_ENV).is_ok() || std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let cfg = LogConfig {
            level: "xfer_transfer=debug".into(),
            json: false,
        };
        assert_eq!(filter_directive(&cfg), "xfer_transfer=debug");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let cfg = LogConfig::default();
        let _ = init(&cfg);
        assert!(!init(&cfg));
    }
}
