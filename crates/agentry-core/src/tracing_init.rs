//! Shared tracing/logging initialization.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose spans and events the default filter covers.
const AGENTRY_TARGETS: [&str; 2] = ["agentry_daemon", "agentry_core"];

/// Build the default filter directive for a log level, e.g.
/// `"agentry_daemon=debug,agentry_core=debug"`.
pub fn default_filter(level: &str) -> String {
    AGENTRY_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. With `log_json` the
/// subscriber emits one JSON object per line.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_both_crates() {
        assert_eq!(
            default_filter("debug"),
            "agentry_daemon=debug,agentry_core=debug"
        );
    }
}
