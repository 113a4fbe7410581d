//! Engine configuration
//!
//! Built once at process start and passed down to the evaluator and
//! coordinator. Values come from `CADENCE_*` environment variables with
//! defaults suitable for local development.

use crate::retry::{RetryPolicy, RetryStrategy};
use anyhow::{anyhow, Context, Result};
use cadence_core::ComputeTier;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use uuid::Uuid;

/// What the evaluator does with a partition that maps to no upstream
/// partition of one of its dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingUpstreamPolicy {
    /// Treat the dependency as satisfied and schedule the partition
    #[default]
    Liberal,

    /// Refuse to schedule the partition and report an error
    Strict,
}

impl std::str::FromStr for MissingUpstreamPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "liberal" => Ok(MissingUpstreamPolicy::Liberal),
            "strict" => Ok(MissingUpstreamPolicy::Strict),
            other => Err(anyhow!("unknown missing-upstream policy '{other}'")),
        }
    }
}

/// Configuration for one engine process
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity recorded as the owner of claimed attempts
    pub owner_id: String,

    /// Interval between executor polls while a run is pending
    pub poll_interval: Duration,

    /// Maximum number of units a coordinator drives at once
    pub max_concurrent_runs: usize,

    pub missing_upstream: MissingUpstreamPolicy,

    pub retry: RetryPolicy,

    /// Per-tier max duration overrides; tiers not listed use their default
    pub tier_timeouts: HashMap<ComputeTier, Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("cadence-{}", Uuid::new_v4().simple()),
            poll_interval: Duration::from_secs(5),
            max_concurrent_runs: 16,
            missing_upstream: MissingUpstreamPolicy::default(),
            retry: RetryPolicy::default(),
            tier_timeouts: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CADENCE_OWNER_ID`: claim owner identity (default: random)
    /// - `CADENCE_POLL_INTERVAL_MS`: executor poll interval (default: 5000)
    /// - `CADENCE_MAX_CONCURRENT_RUNS`: concurrent units (default: 16)
    /// - `CADENCE_MISSING_UPSTREAM`: `liberal` or `strict` (default: liberal)
    /// - `CADENCE_MAX_RETRIES`: retries after a transient failure (default: 3)
    /// - `CADENCE_RETRY_STRATEGY`: `none`, `fixed`, `exponential`, `exponential_jitter`
    /// - `CADENCE_RETRY_INITIAL_DELAY_MS`: first backoff (default: 1000)
    /// - `CADENCE_RETRY_MAX_DELAY_MS`: backoff cap (default: 60000)
    /// - `CADENCE_TIMEOUT_<TIER>_SECS`: max duration override per tier, e.g.
    ///   `CADENCE_TIMEOUT_FUNCTION_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str, default: String| lookup(key).unwrap_or(default);

        let owner_id = var("CADENCE_OWNER_ID", defaults.owner_id);

        let poll_interval_ms: u64 = var("CADENCE_POLL_INTERVAL_MS", "5000".to_string())
            .parse()
            .context("CADENCE_POLL_INTERVAL_MS must be a number of milliseconds")?;

        let max_concurrent_runs: usize = var(
            "CADENCE_MAX_CONCURRENT_RUNS",
            defaults.max_concurrent_runs.to_string(),
        )
        .parse()
        .context("CADENCE_MAX_CONCURRENT_RUNS must be a positive integer")?;

        let missing_upstream: MissingUpstreamPolicy =
            var("CADENCE_MISSING_UPSTREAM", "liberal".to_string())
                .parse()
                .context("CADENCE_MISSING_UPSTREAM must be 'liberal' or 'strict'")?;

        let max_attempts: u32 = var("CADENCE_MAX_RETRIES", "3".to_string())
            .parse()
            .context("CADENCE_MAX_RETRIES must be a non-negative integer")?;

        let strategy: RetryStrategy =
            var("CADENCE_RETRY_STRATEGY", "exponential_jitter".to_string())
                .parse()
                .map_err(|e: String| anyhow!(e))
                .context("CADENCE_RETRY_STRATEGY is invalid")?;

        let initial_delay_ms: u64 = var("CADENCE_RETRY_INITIAL_DELAY_MS", "1000".to_string())
            .parse()
            .context("CADENCE_RETRY_INITIAL_DELAY_MS must be a number of milliseconds")?;

        let max_delay_ms: u64 = var("CADENCE_RETRY_MAX_DELAY_MS", "60000".to_string())
            .parse()
            .context("CADENCE_RETRY_MAX_DELAY_MS must be a number of milliseconds")?;

        let mut tier_timeouts = HashMap::new();
        for tier in ComputeTier::ALL {
            let key = format!("CADENCE_TIMEOUT_{}_SECS", tier.as_str().to_ascii_uppercase());
            if let Some(value) = lookup(&key) {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("{key} must be a number of seconds"))?;
                tier_timeouts.insert(tier, Duration::from_secs(secs));
            }
        }

        let config = Self {
            owner_id,
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_concurrent_runs,
            missing_upstream,
            retry: RetryPolicy {
                max_attempts,
                initial_delay: Duration::from_millis(initial_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                strategy,
                ..RetryPolicy::default()
            },
            tier_timeouts,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(anyhow!("owner_id cannot be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval must be greater than zero"));
        }
        if self.max_concurrent_runs == 0 {
            return Err(anyhow!("max_concurrent_runs must be greater than zero"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(anyhow!("retry initial delay cannot exceed max delay"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(anyhow!("retry backoff multiplier must be at least 1.0"));
        }
        Ok(())
    }

    /// Max duration of a unit: explicit asset override, else the configured
    /// tier timeout, else the tier default
    pub fn max_duration_for(&self, tier: ComputeTier, asset_override: Option<Duration>) -> Option<Duration> {
        asset_override
            .or_else(|| self.tier_timeouts.get(&tier).copied())
            .or_else(|| tier.default_max_duration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.missing_upstream, MissingUpstreamPolicy::Liberal);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.owner_id.starts_with("cadence-"));
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("CADENCE_OWNER_ID", "replica-a"),
            ("CADENCE_MISSING_UPSTREAM", "Strict"),
            ("CADENCE_MAX_RETRIES", "5"),
            ("CADENCE_RETRY_STRATEGY", "fixed"),
            ("CADENCE_TIMEOUT_FUNCTION_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.owner_id, "replica-a");
        assert_eq!(config.missing_upstream, MissingUpstreamPolicy::Strict);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.strategy, RetryStrategy::Fixed);
        assert_eq!(
            config.max_duration_for(ComputeTier::Function, None),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            config.max_duration_for(ComputeTier::Cluster, None),
            Some(Duration::from_secs(12 * 60 * 60))
        );
        assert_eq!(config.max_duration_for(ComputeTier::InProcess, None), None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("CADENCE_POLL_INTERVAL_MS", "soon")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("CADENCE_MAX_CONCURRENT_RUNS", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("CADENCE_MISSING_UPSTREAM", "maybe")])).is_err());
    }

    #[test]
    fn test_asset_override_wins() {
        let config = EngineConfig::default();
        assert_eq!(
            config.max_duration_for(ComputeTier::Batch, Some(Duration::from_secs(30))),
            Some(Duration::from_secs(30))
        );
    }
}
