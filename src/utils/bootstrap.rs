//! Bootstrap utilities for surebet binaries.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Environment name that switches log output to JSON.
pub const PRODUCTION: &str = "production";

/// Build the log filter: `SUREBET_LOG` if set, otherwise `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing.
///
/// Output is JSON in production and human-readable elsewhere.
pub fn init_tracing(level: &str, environment: &str) {
    let json = environment.eq_ignore_ascii_case(PRODUCTION);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_env_filter_falls_back_to_level() {
        std::env::remove_var(LOG_ENV_VAR);
        assert_eq!(env_filter("debug").to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_env_filter_prefers_env() {
        std::env::set_var(LOG_ENV_VAR, "surebet_bus=trace");
        let filter = env_filter("info");
        std::env::remove_var(LOG_ENV_VAR);
        assert_eq!(filter.to_string(), "surebet_bus=trace");
    }
}
