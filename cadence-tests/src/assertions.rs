//! Assertions over store state and batches
//!
//! Each helper panics with the pair and the observed record, so a failing
//! scenario shows what the store actually held.

use cadence_core::{AssetGraph, AssetKey, PartitionKey, RunBatch};
use cadence_storage::{FailureKind, MaterializationRecord, MaterializationStatus, MaterializationStore};
use std::time::Duration;

/// Current record of a pair, which must exist and have `status`
pub async fn assert_status(
    store: &dyn MaterializationStore,
    asset: &str,
    partition: impl Into<PartitionKey>,
    status: MaterializationStatus,
) -> MaterializationRecord {
    let partition = partition.into();
    let current = store
        .current(&AssetKey::new(asset), &partition)
        .await
        .unwrap_or_else(|e| panic!("reading {asset}[{partition}] failed: {e}"));
    match current {
        Some(record) if record.status == status => record,
        Some(record) => panic!(
            "expected {asset}[{partition}] to be {status}, found {}: {record:?}",
            record.status
        ),
        None => panic!("expected {asset}[{partition}] to be {status}, found no record"),
    }
}

pub async fn assert_success(
    store: &dyn MaterializationStore,
    asset: &str,
    partition: impl Into<PartitionKey>,
) -> MaterializationRecord {
    assert_status(store, asset, partition, MaterializationStatus::Success).await
}

/// Current record must be `Failed` with the given kind and carry a reason
pub async fn assert_failed(
    store: &dyn MaterializationStore,
    asset: &str,
    partition: impl Into<PartitionKey>,
    kind: FailureKind,
) -> MaterializationRecord {
    let record = assert_status(store, asset, partition, MaterializationStatus::Failed).await;
    assert_eq!(record.failure_kind(), Some(kind), "wrong failure kind: {record:?}");
    let reason = record.failure.as_ref().map(|f| f.reason.as_str()).unwrap_or("");
    assert!(!reason.is_empty(), "failed record carries no reason: {record:?}");
    record
}

pub async fn assert_never_materialized(
    store: &dyn MaterializationStore,
    asset: &str,
    partition: impl Into<PartitionKey>,
) {
    let partition = partition.into();
    let history = store
        .history(&AssetKey::new(asset), &partition)
        .await
        .unwrap_or_else(|e| panic!("reading {asset}[{partition}] failed: {e}"));
    assert!(
        history.is_empty(),
        "expected no attempts for {asset}[{partition}], found {history:?}"
    );
}

/// `asset[partition]` labels of a batch, in batch order
pub fn batch_labels(batch: &RunBatch) -> Vec<String> {
    batch.units.iter().map(|u| u.label()).collect()
}

/// Every unit comes after the units of its upstream assets in the batch,
/// and its dependency indices point backwards
pub fn assert_topological(batch: &RunBatch, graph: &AssetGraph) {
    for (index, unit) in batch.units.iter().enumerate() {
        for dep in &batch.dependencies[index] {
            assert!(*dep < index, "{} depends on a later unit", unit.label());
        }
        let upstreams = graph.dependencies_of(&unit.asset_key);
        for (earlier, other) in batch.units.iter().enumerate() {
            if upstreams.contains(&&other.asset_key) {
                assert!(
                    earlier < index,
                    "{} is scheduled before its upstream {}",
                    unit.label(),
                    other.label()
                );
            }
        }
    }
}

/// Wait until a pair has an in-progress attempt with a recorded executor
/// handle, polling under tokio's clock
///
/// Panics after a minute of (possibly paused) time.
pub async fn wait_until_running(
    store: &dyn MaterializationStore,
    asset: &str,
    partition: impl Into<PartitionKey>,
) -> MaterializationRecord {
    let partition = partition.into();
    let asset = AssetKey::new(asset);
    let give_up = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        match store.current(&asset, &partition).await {
            Ok(Some(record)) if record.is_in_progress() && record.executor_handle.is_some() => {
                return record
            }
            Ok(_) => {}
            Err(e) => panic!("reading {asset}[{partition}] failed: {e}"),
        }
        if tokio::time::Instant::now() >= give_up {
            panic!("{asset}[{partition}] never started running");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
