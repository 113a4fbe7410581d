//! Mock implementations of engine extension points
//!
//! - [`ScriptedExecutor`]: a compute executor whose results are scripted
//!   per asset, with the ability to hold runs pending
//! - [`RecordingSubscriber`]: a lifecycle subscriber that keeps every event
//! - [`FaultyStore`]: an in-memory store whose handle writes can be made to
//!   fail

use async_trait::async_trait;
use cadence_core::{AssetKey, DynamicPartitionsSnapshot, PartitionKey, RunHandle, RunUnit};
use cadence_runtime::{
    ComputeExecutor, ExecutorError, LifecycleSubscriber, MaterializationOutput, PollStatus,
    SubmitRequest,
};
use cadence_storage::{
    ClaimOutcome, ClaimRequest, Completion, FailureInfo, FinalizeOutcome,
    InMemoryMaterializationStore, MaterializationRecord, MaterializationStatus,
    MaterializationStore,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Signature the scripted executor reports when no result is scripted
pub fn default_signature(asset: &AssetKey, partition: &PartitionKey) -> String {
    format!("{asset}@{partition}")
}

struct ScriptedRun {
    asset: AssetKey,
    result: PollStatus,
}

/// Executor returning scripted results
///
/// Each submission for an asset consumes the next scripted status; when the
/// script is exhausted the run succeeds with [`default_signature`]. Runs of
/// a held asset report `Pending` until the asset is released.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<AssetKey, VecDeque<PollStatus>>>,
    held: Mutex<HashSet<AssetKey>>,
    runs: Mutex<HashMap<String, ScriptedRun>>,
    submissions: Mutex<Vec<SubmitRequest>>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append results for the next submissions of an asset
    pub fn script<I>(&self, asset: &str, statuses: I)
    where
        I: IntoIterator<Item = PollStatus>,
    {
        self.scripts
            .lock()
            .entry(AssetKey::new(asset))
            .or_default()
            .extend(statuses);
    }

    /// Keep runs of an asset pending
    pub fn hold(&self, asset: &str) {
        self.held.lock().insert(AssetKey::new(asset));
    }

    pub fn release(&self, asset: &str) {
        self.held.lock().remove(&AssetKey::new(asset));
    }

    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self, asset: &str) -> usize {
        let asset = AssetKey::new(asset);
        self.submissions
            .lock()
            .iter()
            .filter(|s| s.asset_key == asset)
            .count()
    }

    /// External ids of runs the engine asked to cancel
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Successful output carrying null counts per column
    pub fn output_with_nulls(signature: &str, column: &str, nulls: u64) -> PollStatus {
        let mut counts = serde_json::Map::new();
        counts.insert(column.to_string(), nulls.into());
        PollStatus::Success(
            MaterializationOutput::new(signature).with_metadata("null_counts", counts.into()),
        )
    }
}

#[async_trait]
impl ComputeExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: SubmitRequest) -> Result<RunHandle, ExecutorError> {
        let result = self
            .scripts
            .lock()
            .get_mut(&request.asset_key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                PollStatus::Success(MaterializationOutput::new(default_signature(
                    &request.asset_key,
                    &request.partition_key,
                )))
            });

        let external_id = format!("run-{}", Uuid::new_v4().simple());
        self.runs.lock().insert(
            external_id.clone(),
            ScriptedRun {
                asset: request.asset_key.clone(),
                result,
            },
        );
        self.submissions.lock().push(request);

        Ok(RunHandle {
            executor: "scripted".to_string(),
            external_id,
            submitted_at: Utc::now(),
        })
    }

    async fn poll(&self, handle: &RunHandle) -> Result<PollStatus, ExecutorError> {
        let runs = self.runs.lock();
        let run = runs
            .get(&handle.external_id)
            .ok_or_else(|| ExecutorError::UnknownHandle(handle.external_id.clone()))?;
        if self.held.lock().contains(&run.asset) {
            return Ok(PollStatus::Pending);
        }
        Ok(run.result.clone())
    }

    async fn cancel(&self, handle: &RunHandle) -> Result<(), ExecutorError> {
        self.cancelled.lock().push(handle.external_id.clone());
        Ok(())
    }
}

/// One lifecycle notification
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Claimed {
        unit: String,
        attempt_number: u32,
    },
    Retry {
        unit: String,
        next_attempt: u32,
        delay: Duration,
        reason: String,
    },
    Finalized {
        unit: String,
        status: MaterializationStatus,
    },
    Skipped {
        unit: String,
        reason: String,
    },
}

/// Subscriber keeping every event in order
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    events: Mutex<Vec<LifecycleEvent>>,
}

fn label(record: &MaterializationRecord) -> String {
    format!("{}[{}]", record.asset_key, record.partition_key)
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn retries(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::Retry { .. }))
            .count()
    }

    /// Units finalized with the given status, in finalization order
    pub fn finalized(&self, status: MaterializationStatus) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::Finalized { unit, status: s } if *s == status => Some(unit.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LifecycleEvent::Skipped { unit, .. } => Some(unit.clone()),
                _ => None,
            })
            .collect()
    }
}

impl LifecycleSubscriber for RecordingSubscriber {
    fn on_claimed(&self, record: &MaterializationRecord) {
        self.events.lock().push(LifecycleEvent::Claimed {
            unit: label(record),
            attempt_number: record.attempt_number,
        });
    }

    fn on_retry(&self, failure: &FailureInfo, next: &MaterializationRecord, delay: Duration) {
        self.events.lock().push(LifecycleEvent::Retry {
            unit: label(next),
            next_attempt: next.attempt_number,
            delay,
            reason: failure.reason.clone(),
        });
    }

    fn on_finalized(&self, record: &MaterializationRecord) {
        self.events.lock().push(LifecycleEvent::Finalized {
            unit: label(record),
            status: record.status,
        });
    }

    fn on_skipped(&self, unit: &RunUnit, reason: &str) {
        self.events.lock().push(LifecycleEvent::Skipped {
            unit: unit.label(),
            reason: reason.to_string(),
        });
    }
}

/// In-memory store that can refuse to record executor handles
#[derive(Default)]
pub struct FaultyStore {
    inner: InMemoryMaterializationStore,
    fail_record_handle: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make later `record_handle` calls fail, or succeed again
    pub fn fail_record_handle(&self, fail: bool) {
        self.fail_record_handle.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MaterializationStore for FaultyStore {
    async fn claim(&self, request: ClaimRequest) -> cadence_storage::Result<ClaimOutcome> {
        self.inner.claim(request).await
    }

    async fn retry_attempt(
        &self,
        attempt_id: Uuid,
        failure: FailureInfo,
    ) -> cadence_storage::Result<ClaimOutcome> {
        self.inner.retry_attempt(attempt_id, failure).await
    }

    async fn finalize(
        &self,
        attempt_id: Uuid,
        completion: Completion,
    ) -> cadence_storage::Result<FinalizeOutcome> {
        self.inner.finalize(attempt_id, completion).await
    }

    async fn cancel(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> cadence_storage::Result<Option<MaterializationRecord>> {
        self.inner.cancel(asset, partition).await
    }

    async fn record_handle(&self, attempt_id: Uuid, handle: RunHandle) -> cadence_storage::Result<()> {
        if self.fail_record_handle.load(Ordering::SeqCst) {
            return Err(cadence_storage::Error::Internal(
                "handle write rejected".to_string(),
            ));
        }
        self.inner.record_handle(attempt_id, handle).await
    }

    async fn current(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> cadence_storage::Result<Option<MaterializationRecord>> {
        self.inner.current(asset, partition).await
    }

    async fn attempt(&self, attempt_id: Uuid) -> cadence_storage::Result<Option<MaterializationRecord>> {
        self.inner.attempt(attempt_id).await
    }

    async fn history(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> cadence_storage::Result<Vec<MaterializationRecord>> {
        self.inner.history(asset, partition).await
    }

    async fn scan_asset(&self, asset: &AssetKey) -> cadence_storage::Result<Vec<MaterializationRecord>> {
        self.inner.scan_asset(asset).await
    }

    async fn wipe(
        &self,
        asset: &AssetKey,
        partitions: Option<&[PartitionKey]>,
    ) -> cadence_storage::Result<u64> {
        self.inner.wipe(asset, partitions).await
    }

    async fn add_dynamic_partitions(
        &self,
        name: &str,
        keys: &[String],
    ) -> cadence_storage::Result<Vec<String>> {
        self.inner.add_dynamic_partitions(name, keys).await
    }

    async fn delete_dynamic_partition(&self, name: &str, key: &str) -> cadence_storage::Result<bool> {
        self.inner.delete_dynamic_partition(name, key).await
    }

    async fn dynamic_partitions(&self) -> cadence_storage::Result<DynamicPartitionsSnapshot> {
        self.inner.dynamic_partitions().await
    }
}
