//! Logging initialization
//!
//! Diagnostics go to stderr through `tracing`. Stdout is reserved for the
//! serving URL and `status` output so both stay scriptable.

use std::str::FromStr;
use std::sync::Once;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "RELPACK_LOG";

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Human,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("invalid log format '{}' (expected human or json)", other)),
        }
    }
}

static INIT_ONCE: Once = Once::new();

/// Filter used when `RELPACK_LOG` is unset
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "relpack=debug"
    } else {
        "relpack=info"
    }
}

/// Install the global subscriber; later calls are no-ops
pub fn init(format: LogFormat, verbose: bool) {
    INIT_ONCE.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);

        // try_init: a subscriber installed by an embedding program wins
        let _ = match format {
            LogFormat::Human => builder.compact().with_target(false).finish().try_init(),
            LogFormat::Json => builder.json().finish().try_init(),
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent() {
        init(LogFormat::Human, false);
        init(LogFormat::Json, true);
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Human".parse::<LogFormat>().unwrap(), LogFormat::Human);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "relpack=info");
        assert_eq!(default_directive(true), "relpack=debug");
    }
}
