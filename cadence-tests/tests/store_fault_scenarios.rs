//! Store failures after a claim
//!
//! A claimed attempt must still reach a terminal status when the store
//! errors midway, otherwise the pair stays locked for every later pass.

use cadence_core::{AssetKey, PartitionKey};
use cadence_runtime::{Engine, ExecutorRouter, Trigger, UnitOutcome};
use cadence_storage::{FailureKind, MaterializationStatus, MaterializationStore};
use cadence_tests::assertions::{assert_failed, assert_success};
use cadence_tests::fixtures::{graph, test_config};
use cadence_tests::mocks::{FaultyStore, RecordingSubscriber, ScriptedExecutor};
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn test_failed_handle_write_releases_the_pair() {
    let store = Arc::new(FaultyStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let events = Arc::new(RecordingSubscriber::new());
    let engine = Engine::new(
        graph::single("raw"),
        store.clone(),
        ExecutorRouter::new().with_fallback(executor.clone()),
        test_config(),
    )
    .with_subscriber(events.clone());

    store.fail_record_handle(true);
    executor.hold("raw");

    let pass = engine
        .handle_trigger(Trigger::manual("raw", ["2024-01-02"]))
        .await
        .unwrap();
    let outcome = pass
        .report
        .outcome_of(&AssetKey::new("raw"), &PartitionKey::single("2024-01-02"));
    assert!(matches!(outcome, Some(UnitOutcome::Errored(_))), "{outcome:?}");

    let record = assert_failed(store.as_ref(), "raw", "2024-01-02", FailureKind::Transient).await;
    let reason = record.failure.as_ref().map(|f| f.reason.clone()).unwrap_or_default();
    assert!(reason.contains("handle write rejected"), "{reason}");

    // The submitted run is stopped rather than left running unowned.
    assert_eq!(executor.submission_count("raw"), 1);
    assert_eq!(executor.cancelled().len(), 1);
    assert_eq!(
        events.finalized(MaterializationStatus::Failed),
        vec!["raw[2024-01-02]".to_string()]
    );

    // With the store healthy again the pair can be claimed and rerun.
    store.fail_record_handle(false);
    executor.release("raw");
    let pass = engine
        .handle_trigger(Trigger::manual("raw", ["2024-01-02"]))
        .await
        .unwrap();
    assert!(pass.report.all_succeeded(), "{:?}", pass.report);
    assert_success(store.as_ref(), "raw", "2024-01-02").await;

    let history = store
        .history(&AssetKey::new("raw"), &PartitionKey::single("2024-01-02"))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}
