//! Lifecycle subscribers
//!
//! The run coordinator calls every registered [`LifecycleSubscriber`]
//! synchronously at fixed points of an attempt's life: after a successful
//! claim, before a transient retry, once the attempt is finalized (including
//! cancellation), and when a unit is skipped because an upstream unit of
//! the same batch did not succeed.
//!
//! Subscribers must be quick; anything slow belongs on a channel the
//! subscriber feeds.

use cadence_core::{ComputeTier, RunUnit};
use cadence_storage::{FailureInfo, MaterializationRecord, MaterializationStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info, warn};

/// Receives attempt lifecycle notifications
pub trait LifecycleSubscriber: Send + Sync {
    /// A new attempt was claimed and is about to be submitted
    fn on_claimed(&self, _record: &MaterializationRecord) {}

    /// An attempt failed transiently and `next` will run after `delay`
    fn on_retry(&self, _failure: &FailureInfo, _next: &MaterializationRecord, _delay: Duration) {}

    /// An attempt reached a terminal status
    fn on_finalized(&self, _record: &MaterializationRecord) {}

    /// A unit was not dispatched because an upstream unit did not succeed
    fn on_skipped(&self, _unit: &RunUnit, _reason: &str) {}
}

/// Logs every lifecycle event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHook;

impl LifecycleSubscriber for LoggingHook {
    fn on_claimed(&self, record: &MaterializationRecord) {
        info!(
            asset = %record.asset_key,
            partition = %record.partition_key,
            attempt_id = %record.attempt_id,
            reason = %record.reason,
            tier = %record.compute_tier,
            "Materialization claimed"
        );
    }

    fn on_retry(&self, failure: &FailureInfo, next: &MaterializationRecord, delay: Duration) {
        warn!(
            asset = %next.asset_key,
            partition = %next.partition_key,
            attempt_number = next.attempt_number,
            delay_ms = delay.as_millis() as u64,
            failure = %failure,
            "Retrying after transient failure"
        );
    }

    fn on_finalized(&self, record: &MaterializationRecord) {
        match record.status {
            MaterializationStatus::Failed => error!(
                asset = %record.asset_key,
                partition = %record.partition_key,
                attempt_id = %record.attempt_id,
                kind = record.failure_kind().map(|k| k.as_str()).unwrap_or("unknown"),
                reason = record.failure.as_ref().map(|f| f.reason.as_str()).unwrap_or(""),
                "Materialization failed"
            ),
            status => info!(
                asset = %record.asset_key,
                partition = %record.partition_key,
                attempt_id = %record.attempt_id,
                status = %status,
                content_signature = record.content_signature.as_deref().unwrap_or(""),
                "Materialization finalized"
            ),
        }
    }

    fn on_skipped(&self, unit: &RunUnit, reason: &str) {
        warn!(unit = %unit.label(), reason, "Run unit skipped");
    }
}

/// Aggregates execution time per compute tier
///
/// Durations are measured from claim to finalization of each finalized
/// attempt, whatever its status. With hourly rates configured, the hook also
/// estimates what the executions cost.
#[derive(Debug, Default)]
pub struct CostTrackingHook {
    seconds: Mutex<HashMap<ComputeTier, f64>>,
    hourly_rates: HashMap<ComputeTier, f64>,
}

impl CostTrackingHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Price one hour of execution on a tier
    pub fn with_hourly_rate(mut self, tier: ComputeTier, rate: f64) -> Self {
        self.hourly_rates.insert(tier, rate);
        self
    }

    pub fn seconds_by_tier(&self) -> HashMap<ComputeTier, f64> {
        self.seconds.lock().clone()
    }

    pub fn total_seconds(&self) -> f64 {
        self.seconds.lock().values().sum()
    }

    /// Estimated cost over every tier with a configured rate
    pub fn estimated_cost(&self) -> f64 {
        self.seconds
            .lock()
            .iter()
            .filter_map(|(tier, secs)| self.hourly_rates.get(tier).map(|rate| rate * secs / 3600.0))
            .sum()
    }

    fn record(&self, record: &MaterializationRecord) {
        let Some(completed_at) = record.completed_at else {
            return;
        };
        let elapsed = (completed_at - record.started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        *self.seconds.lock().entry(record.compute_tier).or_insert(0.0) += elapsed;
    }
}

impl LifecycleSubscriber for CostTrackingHook {
    fn on_finalized(&self, record: &MaterializationRecord) {
        self.record(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{AssetKey, PartitionKey, RunReason};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn finished(tier: ComputeTier, seconds: i64) -> MaterializationRecord {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        MaterializationRecord {
            attempt_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            asset_key: AssetKey::new("raw"),
            partition_key: PartitionKey::single("2024-01-02"),
            attempt_number: 1,
            owner: "test".to_string(),
            reason: RunReason::Manual,
            source_version: None,
            status: MaterializationStatus::Success,
            compute_tier: tier,
            started_at,
            completed_at: Some(started_at + chrono::Duration::seconds(seconds)),
            content_signature: Some("sig".to_string()),
            upstream_signatures: Vec::new(),
            check_results: Vec::new(),
            output_metadata: Default::default(),
            failure: None,
            executor_handle: None,
        }
    }

    #[test]
    fn test_cost_tracking_aggregates_by_tier() {
        let hook = CostTrackingHook::new().with_hourly_rate(ComputeTier::Cluster, 2.0);
        hook.on_finalized(&finished(ComputeTier::Cluster, 1800));
        hook.on_finalized(&finished(ComputeTier::Cluster, 1800));
        hook.on_finalized(&finished(ComputeTier::Function, 30));

        let by_tier = hook.seconds_by_tier();
        assert_eq!(by_tier[&ComputeTier::Cluster], 3600.0);
        assert_eq!(by_tier[&ComputeTier::Function], 30.0);
        assert_eq!(hook.total_seconds(), 3630.0);
        assert!((hook.estimated_cost() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unfinished_records_are_ignored() {
        let hook = CostTrackingHook::new();
        let mut record = finished(ComputeTier::Batch, 60);
        record.completed_at = None;
        hook.on_finalized(&record);
        assert_eq!(hook.total_seconds(), 0.0);
    }

    #[test]
    fn test_logging_hook_accepts_every_event() {
        let hook = LoggingHook;
        let record = finished(ComputeTier::InProcess, 1);
        hook.on_claimed(&record);
        hook.on_retry(&FailureInfo::transient("timeout"), &record, Duration::from_secs(1));
        hook.on_finalized(&record);
    }
}
