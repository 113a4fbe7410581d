//! Run units and batches
//!
//! The evaluator turns a trigger into a [`RunBatch`]: the (asset, partition)
//! pairs that must run, each with the reason it was scheduled, in
//! topological order, with the intra-batch dependencies spelled out so the
//! coordinator can release a unit as soon as everything it reads succeeded.

use crate::asset::{AssetKey, ComputeTier};
use crate::partition::PartitionKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Why a unit was scheduled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunReason {
    /// Explicit operator or API request
    Manual,

    /// The partition's freshness policy deadline passed
    Freshness,

    /// A cron schedule ticked
    ScheduleTick {
        schedule: String,
        scheduled_for: DateTime<Utc>,
    },

    /// A sensor reported new data
    Sensor {
        sensor: String,
        data_version: Option<String>,
    },

    /// An upstream partition was rematerialized
    UpstreamChanged { upstream: AssetKey },

    /// The partition has never been materialized
    Missing,
}

impl RunReason {
    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            RunReason::Manual => "manual",
            RunReason::Freshness => "freshness",
            RunReason::ScheduleTick { .. } => "schedule",
            RunReason::Sensor { .. } => "sensor",
            RunReason::UpstreamChanged { .. } => "upstream_changed",
            RunReason::Missing => "missing",
        }
    }

    /// Data version carried by a sensor reason
    pub fn data_version(&self) -> Option<&str> {
        match self {
            RunReason::Sensor { data_version, .. } => data_version.as_deref(),
            _ => None,
        }
    }

    /// Identity of the external input that caused the run, if any
    ///
    /// Replays of the same sensor event or schedule tick carry the same
    /// source version, which is how duplicate deliveries are recognized.
    pub fn source_version(&self) -> Option<String> {
        match self {
            RunReason::Sensor {
                sensor,
                data_version: Some(version),
            } => Some(format!("sensor:{sensor}:{version}")),
            RunReason::ScheduleTick {
                schedule,
                scheduled_for,
            } => Some(format!("schedule:{schedule}:{}", scheduled_for.timestamp())),
            _ => None,
        }
    }
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReason::ScheduleTick {
                schedule,
                scheduled_for,
            } => write!(f, "schedule {schedule} at {scheduled_for}"),
            RunReason::Sensor { sensor, .. } => write!(f, "sensor {sensor}"),
            RunReason::UpstreamChanged { upstream } => write!(f, "upstream {upstream} changed"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// One (asset, partition) pair scheduled to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunUnit {
    pub asset_key: AssetKey,
    pub partition_key: PartitionKey,
    pub reason: RunReason,

    /// Current attempt the evaluator saw for this pair; the claim only
    /// succeeds if it is still current
    pub observed_attempt: Option<Uuid>,

    /// Upstream pairs whose content signatures are passed to the executor
    pub upstream: Vec<(AssetKey, PartitionKey)>,

    pub compute_tier: ComputeTier,
    pub max_duration: Option<Duration>,
}

impl RunUnit {
    /// `asset[partition]`, for logs
    pub fn label(&self) -> String {
        format!("{}[{}]", self.asset_key, self.partition_key)
    }
}

/// Topologically ordered set of units produced by one evaluation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBatch {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub units: Vec<RunUnit>,

    /// For each unit, indices of the units in this batch it depends on
    pub dependencies: Vec<Vec<usize>>,
}

impl RunBatch {
    /// Create a batch; `dependencies[i]` must only name indices below `i`
    pub fn new(units: Vec<RunUnit>, dependencies: Vec<Vec<usize>>) -> Self {
        debug_assert_eq!(units.len(), dependencies.len());
        debug_assert!(dependencies
            .iter()
            .enumerate()
            .all(|(i, deps)| deps.iter().all(|d| *d < i)));
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            units,
            dependencies,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units with no intra-batch dependency
    pub fn initially_ready(&self) -> Vec<usize> {
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Units that directly depend on unit `index`
    pub fn dependents_of(&self, index: usize) -> Vec<usize> {
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&index))
            .map(|(i, _)| i)
            .collect()
    }

    /// Position of a pair in the batch
    pub fn position(&self, asset: &AssetKey, partition: &PartitionKey) -> Option<usize> {
        self.units
            .iter()
            .position(|u| &u.asset_key == asset && &u.partition_key == partition)
    }
}

/// Reference to a run submitted to a compute executor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunHandle {
    /// Name of the executor that accepted the run
    pub executor: String,

    /// Executor-specific run identifier
    pub external_id: String,

    pub submitted_at: DateTime<Utc>,
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.executor, self.external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(asset: &str) -> RunUnit {
        RunUnit {
            asset_key: AssetKey::new(asset),
            partition_key: PartitionKey::single("2024-01-01"),
            reason: RunReason::Manual,
            observed_attempt: None,
            upstream: Vec::new(),
            compute_tier: ComputeTier::InProcess,
            max_duration: None,
        }
    }

    #[test]
    fn test_batch_readiness() {
        let batch = RunBatch::new(
            vec![unit("raw"), unit("other"), unit("clean")],
            vec![vec![], vec![], vec![0]],
        );
        assert_eq!(batch.initially_ready(), vec![0, 1]);
        assert_eq!(batch.dependents_of(0), vec![2]);
        assert!(batch.dependents_of(1).is_empty());
        assert_eq!(
            batch.position(&AssetKey::new("clean"), &PartitionKey::single("2024-01-01")),
            Some(2)
        );
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(RunReason::Manual.label(), "manual");
        let sensor = RunReason::Sensor {
            sensor: "s3_files".into(),
            data_version: Some("v2".into()),
        };
        assert_eq!(sensor.data_version(), Some("v2"));
        assert_eq!(unit("raw").label(), "raw[2024-01-01]");
    }
}
