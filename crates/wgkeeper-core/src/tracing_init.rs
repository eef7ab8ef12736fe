//! Shared tracing/logging initialization.
//!
//! The `wgkeeper` binary sets up `tracing_subscriber` with an env-filter and
//! optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"wgkeeper_daemon=info,wgkeeper_provision=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Build the default filter string for the given log level, covering every
/// wgkeeper crate.
pub fn default_filter(level: &str) -> String {
    format!("wgkeeper_daemon={level},wgkeeper_provision={level},wgkeeper_core={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_all_crates() {
        let filter = default_filter("debug");
        assert!(filter.contains("wgkeeper_daemon=debug"));
        assert!(filter.contains("wgkeeper_provision=debug"));
        assert!(filter.contains("wgkeeper_core=debug"));
    }
}
