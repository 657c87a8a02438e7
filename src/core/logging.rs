//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Level priority:
//! 1. explicit level passed by the caller
//! 2. `JOBGRAPH_LOG` environment variable (e.g. "info", "debug")
//! 3. `info`
//!
//! Logs go to stderr so that stdout stays free for reports.

use tracing::Level;

use crate::core::errors::{JobGraphError, Result};

pub const LOG_ENV_VAR: &str = "JOBGRAPH_LOG";

/// Install the global fmt subscriber. Fails if one is already installed.
pub fn init_logging(level: Option<Level>) -> Result<()> {
    let level = level
        .or_else(|| {
            std::env::var(LOG_ENV_VAR)
                .ok()
                .and_then(|s| parse_level_str(&s))
        })
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| JobGraphError::configuration(format!("logging already initialised: {e}")))
}

pub fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_str() {
        assert_eq!(parse_level_str(" Debug "), Some(Level::DEBUG));
        assert_eq!(parse_level_str("warning"), Some(Level::WARN));
        assert_eq!(parse_level_str("loud"), None);
    }
}
