//! Logging setup for processes embedding the engine.
//!
//! # Configuration
//!
//! ```bash
//! # Output format: json (default) or pretty
//! export CADENCE_LOG_FORMAT=pretty
//!
//! # Standard filter directives
//! export RUST_LOG=cadence_runtime=debug,cadence_storage=info
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "cadence_runtime=info,cadence_storage=info,cadence_core=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log aggregation
    #[default]
    Json,
    Pretty,
}

/// Configuration for the global tracing subscriber.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub format: LogFormat,

    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CADENCE_LOG_FORMAT`: `json` or `pretty` (default: json)
    /// - `CADENCE_LOG_FILTER`: fallback filter when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let format = match lookup("CADENCE_LOG_FORMAT").as_deref() {
            Some("pretty") | Some("text") => LogFormat::Pretty,
            Some("json") | None => LogFormat::Json,
            Some(other) => {
                eprintln!("Warning: CADENCE_LOG_FORMAT={other} is not recognised, using json");
                LogFormat::Json
            }
        };

        Self {
            format,
            default_filter: lookup("CADENCE_LOG_FILTER").unwrap_or_else(|| DEFAULT_FILTER.to_string()),
        }
    }

    /// Install the global subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if a global subscriber is already installed.
    pub fn init(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter));

        match self.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?,
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?,
        }

        tracing::info!(format = ?self.format, "Logging initialized");
        Ok(())
    }
}

/// Install a subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_for_tests() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cadence_runtime=debug"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_lookup() {
        let pretty = TelemetryConfig::from_lookup(|key| {
            (key == "CADENCE_LOG_FORMAT").then(|| "pretty".to_string())
        });
        assert_eq!(pretty.format, LogFormat::Pretty);
        assert_eq!(pretty.default_filter, DEFAULT_FILTER);

        let fallback = TelemetryConfig::from_lookup(|key| {
            (key == "CADENCE_LOG_FORMAT").then(|| "xml".to_string())
        });
        assert_eq!(fallback.format, LogFormat::Json);
    }

    #[test]
    fn test_init_for_tests_is_repeatable() {
        init_for_tests();
        init_for_tests();
    }
}
