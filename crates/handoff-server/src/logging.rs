//! Logging setup
//!
//! All crates log through `tracing`; this installs the stderr subscriber.
//!
//! # Environment Variables
//!
//! - `HANDOFF_LOG=<level>` - `off|error|warn|info|debug|trace`, the numeric
//!   aliases `0..=5`, or any `EnvFilter` directive (`handoff_server=debug`)
//! - `HANDOFF_LOG_ANSI=0` - disable colour codes

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "HANDOFF_LOG";
pub const ANSI_ENV: &str = "HANDOFF_LOG_ANSI";

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let directive = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(level_directive(&directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let ansi = match std::env::var(ANSI_ENV) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => true,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(false)
        .with_ansi(ansi)
        .try_init();
}

/// Map numeric level aliases onto level names; pass everything else through.
fn level_directive(raw: &str) -> &str {
    match raw.trim() {
        "0" => "off",
        "1" => "error",
        "2" => "warn",
        "3" => "info",
        "4" => "debug",
        "5" => "trace",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("0"), "off");
        assert_eq!(level_directive("4"), "debug");
        assert_eq!(level_directive(" 5 "), "trace");
        assert_eq!(level_directive("warn"), "warn");
        assert_eq!(level_directive("handoff_server=debug"), "handoff_server=debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!("logging initialised twice without panicking");
    }
}
