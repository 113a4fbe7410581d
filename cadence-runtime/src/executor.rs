//! Compute executor contract
//!
//! Concrete compute backends (serverless functions, container tasks,
//! cluster jobs, batch jobs) sit behind [`ComputeExecutor`]. The engine only
//! passes them the asset key, partition key and resolved upstream content
//! signatures; backends fetch their own inputs.
//!
//! Execution is asynchronous: `submit` returns a [`RunHandle`] immediately
//! and the coordinator polls it until the run reaches a terminal status.

use crate::{Error, Result};
use async_trait::async_trait;
use cadence_core::{AssetKey, ComputeTier, OutputMetadata, PartitionKey, RunHandle, RunUnit};
use cadence_storage::UpstreamSignature;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Work submitted to an executor
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub attempt_id: Uuid,
    pub attempt_number: u32,
    pub asset_key: AssetKey,
    pub partition_key: PartitionKey,
    pub upstream_signatures: Vec<UpstreamSignature>,
    pub compute_tier: ComputeTier,
}

/// What a successful computation reports back
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaterializationOutput {
    /// Identifies the produced content; downstream runs record it
    pub content_signature: String,

    /// Metadata quality checks inspect (row counts, columns, ...)
    pub metadata: OutputMetadata,
}

impl MaterializationOutput {
    pub fn new(content_signature: impl Into<String>) -> Self {
        Self {
            content_signature: content_signature.into(),
            metadata: OutputMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Status of a submitted run
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    Success(MaterializationOutput),

    /// Infrastructure error or timeout; eligible for retry
    TransientFailure(String),

    /// The asset's computation itself failed
    LogicalFailure(String),
}

/// Errors raised by executors when talking to their backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Backend unreachable or overloaded
    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the work (unknown asset, bad request)
    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Unknown run handle: {0}")]
    UnknownHandle(String),
}

impl ExecutorError {
    /// Returns true if the failure should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Unavailable(_))
    }
}

/// A compute backend
#[async_trait]
pub trait ComputeExecutor: Send + Sync {
    /// Name recorded in run handles
    fn name(&self) -> &str;

    /// Start a run; must not wait for it to finish
    async fn submit(&self, request: SubmitRequest) -> std::result::Result<RunHandle, ExecutorError>;

    async fn poll(&self, handle: &RunHandle) -> std::result::Result<PollStatus, ExecutorError>;

    /// Best-effort request to stop a run
    async fn cancel(&self, handle: &RunHandle) -> std::result::Result<(), ExecutorError>;
}

/// Chooses the compute tier a unit runs on
pub trait TierPolicy: Send + Sync {
    fn select_tier(&self, unit: &RunUnit) -> ComputeTier;
}

/// Runs every unit on its asset's declared tier
#[derive(Debug, Clone, Copy, Default)]
pub struct HintTierPolicy;

impl TierPolicy for HintTierPolicy {
    fn select_tier(&self, unit: &RunUnit) -> ComputeTier {
        unit.compute_tier
    }
}

/// Maps compute tiers to executors
#[derive(Clone)]
pub struct ExecutorRouter {
    executors: HashMap<ComputeTier, Arc<dyn ComputeExecutor>>,
    fallback: Option<Arc<dyn ComputeExecutor>>,
    policy: Arc<dyn TierPolicy>,
}

impl Default for ExecutorRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRouter {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            fallback: None,
            policy: Arc::new(HintTierPolicy),
        }
    }

    /// Register the executor for a tier
    pub fn with_executor(mut self, tier: ComputeTier, executor: Arc<dyn ComputeExecutor>) -> Self {
        self.executors.insert(tier, executor);
        self
    }

    /// Executor used for tiers with no dedicated executor
    pub fn with_fallback(mut self, executor: Arc<dyn ComputeExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn TierPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Tier and executor for a unit
    pub fn route(&self, unit: &RunUnit) -> Result<(ComputeTier, Arc<dyn ComputeExecutor>)> {
        let tier = self.policy.select_tier(unit);
        self.executors
            .get(&tier)
            .or(self.fallback.as_ref())
            .map(|executor| (tier, Arc::clone(executor)))
            .ok_or(Error::NoExecutor(tier))
    }

    /// Executor that issued a handle, looked up by name
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn ComputeExecutor>> {
        self.executors
            .values()
            .chain(self.fallback.iter())
            .find(|executor| executor.name() == name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::RunReason;

    struct NamedExecutor(&'static str);

    #[async_trait]
    impl ComputeExecutor for NamedExecutor {
        fn name(&self) -> &str {
            self.0
        }

        async fn submit(
            &self,
            request: SubmitRequest,
        ) -> std::result::Result<RunHandle, ExecutorError> {
            Ok(RunHandle {
                executor: self.0.to_string(),
                external_id: request.attempt_id.to_string(),
                submitted_at: chrono::Utc::now(),
            })
        }

        async fn poll(&self, _handle: &RunHandle) -> std::result::Result<PollStatus, ExecutorError> {
            Ok(PollStatus::Pending)
        }

        async fn cancel(&self, _handle: &RunHandle) -> std::result::Result<(), ExecutorError> {
            Ok(())
        }
    }

    struct AlwaysBatch;

    impl TierPolicy for AlwaysBatch {
        fn select_tier(&self, _unit: &RunUnit) -> ComputeTier {
            ComputeTier::Batch
        }
    }

    fn unit(tier: ComputeTier) -> RunUnit {
        RunUnit {
            asset_key: AssetKey::new("raw"),
            partition_key: PartitionKey::Unpartitioned,
            reason: RunReason::Manual,
            observed_attempt: None,
            upstream: Vec::new(),
            compute_tier: tier,
            max_duration: None,
        }
    }

    #[test]
    fn test_route_by_hint() {
        let router = ExecutorRouter::new()
            .with_executor(ComputeTier::Function, Arc::new(NamedExecutor("functions")))
            .with_executor(ComputeTier::Container, Arc::new(NamedExecutor("containers")));

        let (tier, executor) = router.route(&unit(ComputeTier::Function)).unwrap();
        assert_eq!(tier, ComputeTier::Function);
        assert_eq!(executor.name(), "functions");

        assert!(matches!(
            router.route(&unit(ComputeTier::Cluster)),
            Err(Error::NoExecutor(ComputeTier::Cluster))
        ));
    }

    #[test]
    fn test_fallback_and_policy() {
        let router = ExecutorRouter::new()
            .with_fallback(Arc::new(NamedExecutor("local")))
            .with_policy(Arc::new(AlwaysBatch));

        let (tier, executor) = router.route(&unit(ComputeTier::Function)).unwrap();
        assert_eq!(tier, ComputeTier::Batch);
        assert_eq!(executor.name(), "local");
        assert!(router.by_name("local").is_some());
        assert!(router.by_name("remote").is_none());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExecutorError::Unavailable("503".into()).is_transient());
        assert!(!ExecutorError::Rejected("bad".into()).is_transient());
    }
}
