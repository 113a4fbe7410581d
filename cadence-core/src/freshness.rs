//! Freshness policies
//!
//! A freshness policy states how stale the last successful materialization
//! of a partition may become before the partition is due for a re-run.

use crate::ConfigurationError;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// How far back to search for the previous cron tick, widest last
const TICK_LOOKBACK_DAYS: [i64; 5] = [1, 7, 35, 370, 1830];

/// Maximum allowed staleness for an asset's partitions
#[derive(Debug, Clone)]
pub enum FreshnessPolicy {
    /// Stale once the last success is older than the given duration
    MaxStaleness(Duration),

    /// Stale once a cron tick has passed by more than `max_lag` without a
    /// success at or after that tick
    Cron(CronFreshness),
}

/// Cron based freshness expectation
#[derive(Debug, Clone)]
pub struct CronFreshness {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
    max_lag: Duration,
}

impl CronFreshness {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn max_lag(&self) -> Duration {
        self.max_lag
    }

    /// Most recent tick at or before `instant`
    pub fn previous_tick(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = instant.with_timezone(&self.timezone);
        TICK_LOOKBACK_DAYS.iter().find_map(|days| {
            let from = local - Duration::days(*days);
            self.schedule
                .after(&from)
                .take_while(|tick| *tick <= local)
                .last()
                .map(|tick| tick.with_timezone(&Utc))
        })
    }
}

impl FreshnessPolicy {
    /// Policy allowing at most `max` between successes
    pub fn max_staleness(max: Duration) -> Self {
        FreshnessPolicy::MaxStaleness(max)
    }

    /// Policy expecting a success within `max_lag` of each cron tick
    ///
    /// The expression uses the six or seven field format of the `cron`
    /// crate (seconds first), e.g. `0 0 6 * * *` for 06:00 daily.
    pub fn cron(expression: &str, timezone: Tz, max_lag: Duration) -> Result<Self, ConfigurationError> {
        let schedule =
            Schedule::from_str(expression).map_err(|e| ConfigurationError::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(FreshnessPolicy::Cron(CronFreshness {
            expression: expression.to_string(),
            schedule,
            timezone,
            max_lag,
        }))
    }

    /// Returns true if a partition last materialized at `last_success` is
    /// due for a re-run at `now`
    ///
    /// A partition that has never succeeded is stale.
    pub fn is_stale(&self, last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            FreshnessPolicy::MaxStaleness(max) => {
                last_success.map_or(true, |last| now - last > *max)
            }
            FreshnessPolicy::Cron(cron) => {
                let Some(tick) = cron.previous_tick(now - cron.max_lag) else {
                    return last_success.is_none();
                };
                last_success.map_or(true, |last| last < tick)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_max_staleness() {
        let policy = FreshnessPolicy::max_staleness(Duration::hours(6));
        let now = utc("2024-01-02T12:00:00Z");

        assert!(policy.is_stale(None, now));
        assert!(!policy.is_stale(Some(utc("2024-01-02T07:00:00Z")), now));
        assert!(policy.is_stale(Some(utc("2024-01-02T05:00:00Z")), now));
    }

    #[test]
    fn test_cron_policy_waits_for_lag() {
        let policy =
            FreshnessPolicy::cron("0 0 6 * * *", Tz::UTC, Duration::hours(2)).unwrap();
        let yesterday = Some(utc("2024-01-01T07:00:00Z"));

        // Today's 06:00 tick is only due at 08:00.
        assert!(!policy.is_stale(yesterday, utc("2024-01-02T07:30:00Z")));
        assert!(policy.is_stale(yesterday, utc("2024-01-02T08:30:00Z")));
        assert!(!policy.is_stale(Some(utc("2024-01-02T06:10:00Z")), utc("2024-01-02T08:30:00Z")));
    }

    #[test]
    fn test_cron_policy_respects_timezone() {
        let policy = FreshnessPolicy::cron(
            "0 0 6 * * *",
            chrono_tz::America::New_York,
            Duration::zero(),
        )
        .unwrap();

        let FreshnessPolicy::Cron(cron) = &policy else {
            panic!("expected cron policy");
        };
        // 06:00 in New York during winter is 11:00 UTC.
        assert_eq!(
            cron.previous_tick(utc("2024-01-02T12:00:00Z")),
            Some(utc("2024-01-02T11:00:00Z"))
        );
    }

    #[test]
    fn test_invalid_cron_expression() {
        let result = FreshnessPolicy::cron("not a cron", Tz::UTC, Duration::hours(1));
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidSchedule { .. })
        ));
    }
}
