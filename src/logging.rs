//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directive.
pub const LOG_ENV_VAR: &str = "CONVOY_LOG";

const DEFAULT_FILTER: &str = "info";

/// Filter from `CONVOY_LOG`, then `default`, then `info`.
pub fn env_filter(default: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(default.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a fmt subscriber. Returns `false` if one was already installed.
pub fn init_tracing(default: Option<&str>) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default))
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(Some("debug"));
        assert!(!init_tracing(None));
    }

    #[test]
    fn test_invalid_default_falls_back() {
        let filter = env_filter(Some("not a [valid filter"));
        assert!(!filter.to_string().is_empty());
    }
}
