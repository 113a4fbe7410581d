//! # Cadence Runtime
//!
//! Scheduling and execution for Cadence asset graphs: the evaluator that
//! turns triggers into run batches, the run coordinator that claims,
//! dispatches and finalizes each unit, the quality gate, and the engine
//! loop tying them together.

pub mod concurrency;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod hooks;
pub mod local_executor;
pub mod metrics;
pub mod quality_gate;
pub mod retry;
pub mod telemetry;
pub mod triggers;

// Re-export commonly used types
pub use config::{EngineConfig, MissingUpstreamPolicy};
pub use coordinator::{
    BatchReport, DispatchOutcome, RunCoordinator, Submission, UnitOutcome, UnitReport,
};
pub use engine::{Engine, PassReport};
pub use evaluator::{Evaluation, Evaluator, SkipReason, SkippedPair};
pub use executor::{
    ComputeExecutor, ExecutorError, ExecutorRouter, HintTierPolicy, MaterializationOutput,
    PollStatus, SubmitRequest, TierPolicy,
};
pub use hooks::{CostTrackingHook, LifecycleSubscriber, LoggingHook};
pub use local_executor::{ComputeContext, ComputeError, InProcessExecutor};
pub use quality_gate::{GateVerdict, QualityGate};
pub use retry::{RetryPolicy, RetryStrategy};
pub use telemetry::{LogFormat, TelemetryConfig};
pub use triggers::{AssetSelection, ScheduleDefinition, ScheduleTicker, SensorEvent, Trigger};

use cadence_core::{AssetKey, ComputeTier, PartitionKey};

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime operations
///
/// Failed executions are not errors: they are recorded as failed attempts
/// and reported per unit, so one failing pair never aborts a batch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown asset: {0}")]
    UnknownAsset(AssetKey),

    #[error("No executor registered for compute tier {0}")]
    NoExecutor(ComputeTier),

    #[error("Upstream {upstream}[{upstream_partition}] of {asset}[{partition}] has no successful materialization")]
    UpstreamNotReady {
        asset: AssetKey,
        partition: PartitionKey,
        upstream: AssetKey,
        upstream_partition: PartitionKey,
    },

    #[error("No partition of upstream {upstream} is mapped to {asset}[{partition}]")]
    MissingUpstreamPartition {
        asset: AssetKey,
        partition: PartitionKey,
        upstream: AssetKey,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] cadence_storage::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] cadence_core::ConfigurationError),

    #[error("Partition error: {0}")]
    Partition(#[from] cadence_core::PartitionError),

    #[error("Internal error: {0}")]
    Internal(String),
}
