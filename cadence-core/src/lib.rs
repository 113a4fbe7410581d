//! # Cadence Core
//!
//! Definitions for the Cadence asset engine: assets and their partitions,
//! partition mappings between dependent assets, freshness policies, quality
//! checks, the validated asset graph, and the run units the evaluator
//! produces from it.

pub mod asset;
pub mod freshness;
pub mod graph;
pub mod partition;
pub mod partition_mapping;
pub mod quality;
pub mod run;

// Re-export commonly used types
pub use asset::{AssetBuilder, AssetDefinition, AssetDependency, AssetKey, ComputeTier};
pub use freshness::{CronFreshness, FreshnessPolicy};
pub use graph::{AssetGraph, AssetGraphBuilder, SharedAssetGraph};
pub use partition::{
    DynamicPartitionsSnapshot, PartitionContext, PartitionError, PartitionKey, PartitionSelector,
    PartitionsDefinition, TimeGranularity, TimeWindow, TimeWindowPartitions,
};
pub use partition_mapping::{infer_mapping, PartitionMapping};
pub use quality::{
    AssetCheck, CheckContext, CheckDefinition, CheckError, CheckEvaluation, CheckOutcome,
    CheckResult, CheckSeverity, CheckType, OutputMetadata,
};
pub use run::{RunBatch, RunHandle, RunReason, RunUnit};

/// Result type for Cadence core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid asset graph configuration, raised while building the graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Dependency cycle: {}", format_path(path))]
    Cycle { path: Vec<AssetKey> },

    #[error("Asset '{0}' is already registered")]
    DuplicateKey(AssetKey),

    #[error("Asset '{asset}' depends on unknown asset '{upstream}'")]
    UnknownDependency { asset: AssetKey, upstream: AssetKey },

    #[error(
        "Asset '{downstream}' depends on differently partitioned '{upstream}' without a partition mapping"
    )]
    MissingPartitionMapping {
        upstream: AssetKey,
        downstream: AssetKey,
    },

    #[error("Partition mapping from '{upstream}' to '{downstream}' is invalid: {reason}")]
    IncompatiblePartitionMapping {
        upstream: AssetKey,
        downstream: AssetKey,
        reason: String,
    },

    #[error("Asset '{key}' has invalid partitions: {reason}")]
    InvalidPartitionsDefinition { key: AssetKey, reason: String },

    #[error("Asset '{key}' is invalid: {reason}")]
    InvalidAsset { key: AssetKey, reason: String },

    #[error("Asset '{key}' declares check '{check}' more than once")]
    DuplicateCheck { key: AssetKey, check: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },
}

fn format_path(path: &[AssetKey]) -> String {
    path.iter()
        .map(AssetKey::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Error types for Cadence core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Internal error: {0}")]
    Internal(String),
}
