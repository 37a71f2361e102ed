//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for the filter:
//! 1. `--verbosity` CLI flag (if provided)
//! 2. `FLOWSTACK_LOG` environment variable (full `EnvFilter` syntax)
//! 3. default to `warn`
//!
//! Logs go to stderr so stdout carries only command output (status table,
//! build and push progress, container logs, exec output).

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "FLOWSTACK_LOG";

/// Initialise the global subscriber. Call once at startup.
pub fn init_logging(verbosity: Option<&str>) -> Result<()> {
    let filter = build_filter(verbosity, std::env::var(LOG_ENV).ok().as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialise logging: {}", e))
}

fn build_filter(verbosity: Option<&str>, env: Option<&str>) -> Result<EnvFilter> {
    match (verbosity, env) {
        (Some(level), _) => {
            let level = parse_level(level)
                .ok_or_else(|| anyhow!("Invalid verbosity '{}'. Valid values: error, warn, info, debug, trace", level))?;
            Ok(EnvFilter::new(level))
        }
        (None, Some(directives)) => EnvFilter::try_new(directives)
            .map_err(|e| anyhow!("Invalid {} value '{}': {}", LOG_ENV, directives, e)),
        (None, None) => Ok(EnvFilter::new("warn")),
    }
}

fn parse_level(s: &str) -> Option<&'static str> {
    match s.trim().to_lowercase().as_str() {
        "error" | "fatal" | "panic" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_aliases() {
        assert_eq!(parse_level("WARNING"), Some("warn"));
        assert_eq!(parse_level(" debug "), Some("debug"));
        assert_eq!(parse_level("fatal"), Some("error"));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_build_filter_flag_wins_over_env() {
        let filter = build_filter(Some("debug"), Some("error")).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_build_filter_env_directives() {
        let filter = build_filter(None, Some("flowstack=trace")).unwrap();
        assert_eq!(filter.to_string(), "flowstack=trace");
    }

    #[test]
    fn test_build_filter_default_and_invalid() {
        assert_eq!(build_filter(None, None).unwrap().to_string(), "warn");
        assert!(build_filter(Some("loud"), None).is_err());
    }
}
