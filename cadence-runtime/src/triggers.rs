//! Triggers
//!
//! A trigger starts one evaluator pass. Triggers arrive asynchronously from
//! operators, cron schedules, external sensors and completed upstream
//! materializations; each is evaluated independently.
//!
//! Sensor deliveries are at-least-once. A replayed [`SensorEvent`] carries
//! the same data version as the original, which the evaluator and the
//! claim both use to turn the replay into a no-op.

use cadence_core::{AssetKey, ConfigurationError, PartitionError, PartitionKey, PartitionSelector};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Partitions of one asset requested by an operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSelection {
    pub asset: AssetKey,
    pub partitions: PartitionSelector,
}

impl AssetSelection {
    /// Every partition of the asset
    pub fn all(asset: impl Into<AssetKey>) -> Self {
        Self {
            asset: asset.into(),
            partitions: PartitionSelector::All,
        }
    }

    pub fn keys<I, K>(asset: impl Into<AssetKey>, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<PartitionKey>,
    {
        Self {
            asset: asset.into(),
            partitions: PartitionSelector::Keys(keys.into_iter().map(Into::into).collect()),
        }
    }

    /// Selection from a textual selector (`*`, `a..b` or `a,b,c`)
    pub fn parse(asset: impl Into<AssetKey>, selector: &str) -> Result<Self, PartitionError> {
        Ok(Self {
            asset: asset.into(),
            partitions: PartitionSelector::parse(selector)?,
        })
    }
}

/// "New data is available" notification from an external sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorEvent {
    pub sensor: String,
    pub asset: AssetKey,

    /// Affected partitions; empty means every partition of the asset
    pub partitions: Vec<PartitionKey>,

    /// Version of the external data; replays carry the same version
    pub data_version: Option<String>,

    pub observed_at: DateTime<Utc>,
}

/// Input to an evaluator pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Explicit materialization request
    Manual { selections: Vec<AssetSelection> },

    /// A cron schedule came due
    ScheduleTick {
        schedule: String,
        scheduled_for: DateTime<Utc>,
        assets: Vec<AssetKey>,
    },

    Sensor(SensorEvent),

    /// A pair was materialized outside the current batch; its dependents
    /// are re-evaluated
    UpstreamMaterialized {
        asset: AssetKey,
        partition: PartitionKey,
    },

    /// Periodic sweep over every asset with a freshness policy
    FreshnessTick,
}

impl Trigger {
    /// Manual request for specific partitions of one asset
    pub fn manual<I, K>(asset: impl Into<AssetKey>, partitions: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<PartitionKey>,
    {
        Trigger::Manual {
            selections: vec![AssetSelection::keys(asset, partitions)],
        }
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Trigger::Manual { .. } => "manual",
            Trigger::ScheduleTick { .. } => "schedule",
            Trigger::Sensor(_) => "sensor",
            Trigger::UpstreamMaterialized { .. } => "upstream",
            Trigger::FreshnessTick => "freshness",
        }
    }
}

/// A cron schedule materializing a fixed set of assets
#[derive(Debug, Clone)]
pub struct ScheduleDefinition {
    pub name: String,
    expression: String,
    schedule: Schedule,
    pub timezone: Tz,
    pub targets: Vec<AssetKey>,

    /// Maximum number of missed ticks emitted at once
    pub max_catchup: usize,

    /// How far back the first evaluation looks for missed ticks
    pub catchup_window: Duration,
}

impl ScheduleDefinition {
    /// Define a schedule; the expression uses the `cron` crate format with
    /// seconds first, e.g. `0 0 1 * * *` for 01:00 daily
    pub fn new(
        name: impl Into<String>,
        expression: &str,
        timezone: Tz,
        targets: Vec<AssetKey>,
    ) -> Result<Self, ConfigurationError> {
        let schedule =
            Schedule::from_str(expression).map_err(|e| ConfigurationError::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            name: name.into(),
            expression: expression.to_string(),
            schedule,
            timezone,
            targets,
            max_catchup: 1,
            catchup_window: Duration::hours(24),
        })
    }

    pub fn with_max_catchup(mut self, max_catchup: usize) -> Self {
        self.max_catchup = max_catchup.max(1);
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Ticks after `last` up to and including `now`, oldest first
    ///
    /// Without a previous tick, looks back over the catch-up window. At most
    /// `max_catchup` ticks are returned.
    pub fn due_ticks(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let start = last.map_or(now - self.catchup_window, |t| t + Duration::seconds(1));
        let start_tz = start.with_timezone(&self.timezone);
        let now_tz = now.with_timezone(&self.timezone);

        self.schedule
            .after(&start_tz)
            .take_while(|t| *t <= now_tz)
            .take(self.max_catchup)
            .map(|t| t.with_timezone(&Utc))
            .collect()
    }

    pub fn tick_trigger(&self, scheduled_for: DateTime<Utc>) -> Trigger {
        Trigger::ScheduleTick {
            schedule: self.name.clone(),
            scheduled_for,
            assets: self.targets.clone(),
        }
    }
}

/// Turns schedule definitions into tick triggers
#[derive(Debug, Default)]
pub struct ScheduleTicker {
    schedules: Vec<ScheduleDefinition>,
    last_ticks: HashMap<String, DateTime<Utc>>,
}

impl ScheduleTicker {
    pub fn new(schedules: Vec<ScheduleDefinition>) -> Self {
        Self {
            schedules,
            last_ticks: HashMap::new(),
        }
    }

    /// Resume from previously emitted ticks
    pub fn with_last_tick(mut self, schedule: impl Into<String>, tick: DateTime<Utc>) -> Self {
        self.last_ticks.insert(schedule.into(), tick);
        self
    }

    pub fn last_tick(&self, schedule: &str) -> Option<DateTime<Utc>> {
        self.last_ticks.get(schedule).copied()
    }

    /// Triggers for every tick that came due since the previous poll
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        for schedule in &self.schedules {
            let ticks = schedule.due_ticks(self.last_ticks.get(&schedule.name).copied(), now);
            if let Some(latest) = ticks.last() {
                self.last_ticks.insert(schedule.name.clone(), *latest);
            }
            for tick in ticks {
                debug!(schedule = %schedule.name, scheduled_for = %tick, "Schedule tick due");
                triggers.push(schedule.tick_trigger(tick));
            }
        }
        triggers
    }

    /// Poll every `interval` and send due ticks until the receiver is gone
    pub async fn run(mut self, tx: mpsc::Sender<Trigger>, interval: std::time::Duration) {
        info!(schedules = self.schedules.len(), "Schedule ticker started");
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            for trigger in self.poll(Utc::now()) {
                if tx.send(trigger).await.is_err() {
                    info!("Trigger channel closed, stopping schedule ticker");
                    return;
                }
            }
            if tx.is_closed() {
                info!("Trigger channel closed, stopping schedule ticker");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn daily() -> ScheduleDefinition {
        ScheduleDefinition::new("nightly", "0 0 1 * * *", chrono_tz::UTC, vec![AssetKey::new("raw")])
            .unwrap()
    }

    #[test]
    fn test_invalid_expression() {
        let err = ScheduleDefinition::new("bad", "every day", chrono_tz::UTC, vec![]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_due_ticks_after_last() {
        let schedule = daily().with_max_catchup(10);
        let ticks = schedule.due_ticks(Some(utc(2024, 1, 1, 1)), utc(2024, 1, 3, 12));
        assert_eq!(ticks, vec![utc(2024, 1, 2, 1), utc(2024, 1, 3, 1)]);
    }

    #[test]
    fn test_catchup_is_bounded() {
        let schedule = daily();
        let ticks = schedule.due_ticks(Some(utc(2024, 1, 1, 1)), utc(2024, 1, 5, 12));
        assert_eq!(ticks, vec![utc(2024, 1, 2, 1)]);
    }

    #[test]
    fn test_timezone_boundaries() {
        let schedule = ScheduleDefinition::new(
            "ny",
            "0 0 1 * * *",
            chrono_tz::America::New_York,
            vec![AssetKey::new("raw")],
        )
        .unwrap();
        // 01:00 in New York during winter is 06:00 UTC.
        let ticks = schedule.due_ticks(Some(utc(2024, 1, 1, 6)), utc(2024, 1, 2, 12));
        assert_eq!(ticks, vec![utc(2024, 1, 2, 6)]);
    }

    #[test]
    fn test_ticker_does_not_repeat_ticks() {
        let mut ticker = ScheduleTicker::new(vec![daily()]).with_last_tick("nightly", utc(2024, 1, 1, 1));

        let first = ticker.poll(utc(2024, 1, 2, 2));
        assert_eq!(
            first,
            vec![Trigger::ScheduleTick {
                schedule: "nightly".into(),
                scheduled_for: utc(2024, 1, 2, 1),
                assets: vec![AssetKey::new("raw")],
            }]
        );
        assert!(ticker.poll(utc(2024, 1, 2, 3)).is_empty());
        assert_eq!(ticker.last_tick("nightly"), Some(utc(2024, 1, 2, 1)));
    }

    #[test]
    fn test_selection_parsing() {
        let selection = AssetSelection::parse("raw", "2024-01-01..2024-01-03").unwrap();
        assert!(matches!(selection.partitions, PartitionSelector::Range { .. }));
        assert_eq!(AssetSelection::all("raw").partitions, PartitionSelector::All);
        assert_eq!(Trigger::manual("raw", ["2024-01-02"]).label(), "manual");
    }
}
