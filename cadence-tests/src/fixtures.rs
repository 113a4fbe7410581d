//! Test data factories for Cadence
//!
//! Asset graphs used across scenario tests, and a [`Harness`] wiring an
//! [`Engine`] to an in-memory store, a [`ScriptedExecutor`] and a
//! [`RecordingSubscriber`].

use crate::mocks::{RecordingSubscriber, ScriptedExecutor};
use cadence_core::AssetGraph;
use cadence_runtime::{Engine, EngineConfig, ExecutorRouter, RetryPolicy, RetryStrategy};
use cadence_storage::InMemoryMaterializationStore;
use std::sync::Arc;
use std::time::Duration;

/// Asset graph fixtures
pub mod graph {
    use cadence_core::{
        AssetDefinition, AssetGraph, CheckDefinition, CheckType, PartitionMapping,
        PartitionsDefinition, TimeWindowPartitions,
    };

    /// Daily partitions 2024-01-01 through 2024-01-03
    pub fn daily() -> PartitionsDefinition {
        match TimeWindowPartitions::daily("2024-01-01", Some("2024-01-04")) {
            Ok(partitions) => PartitionsDefinition::Time(partitions),
            Err(e) => panic!("invalid daily fixture: {e}"),
        }
    }

    /// Blocking check failing when the `email` column has nulls
    pub fn non_null_check() -> CheckDefinition {
        CheckDefinition::new(
            "non-null",
            CheckType::NotNull {
                columns: vec!["email".to_string()],
            },
        )
        .description("email must never be null")
    }

    /// Daily pipeline guarded by a quality check
    ///
    /// ```text
    /// raw ──> clean (non-null) ──> clean_daily
    ///   │                     └──> summary (unpartitioned)
    ///   └──> audit
    /// ```
    pub fn pipeline() -> AssetGraph {
        build([
            AssetDefinition::builder("raw").partitions(daily()).build(),
            AssetDefinition::builder("clean")
                .partitions(daily())
                .depends_on("raw")
                .check(non_null_check())
                .build(),
            AssetDefinition::builder("clean_daily")
                .partitions(daily())
                .depends_on("clean")
                .build(),
            AssetDefinition::builder("summary").depends_on("clean").build(),
            AssetDefinition::builder("audit")
                .partitions(daily())
                .depends_on("raw")
                .build(),
        ])
    }

    /// Sales partitioned by date and a dynamic region set, rolled up per day
    pub fn regional() -> AssetGraph {
        build([
            AssetDefinition::builder("sales")
                .partitions(PartitionsDefinition::multi([
                    ("date", daily()),
                    ("region", PartitionsDefinition::dynamic("regions")),
                ]))
                .build(),
            AssetDefinition::builder("daily_totals")
                .partitions(daily())
                .depends_on_with("sales", PartitionMapping::multi_to_single("date"))
                .build(),
        ])
    }

    /// Single daily asset with no dependencies
    pub fn single(asset: &str) -> AssetGraph {
        build([AssetDefinition::builder(asset).partitions(daily()).build()])
    }

    fn build<const N: usize>(
        definitions: [Result<AssetDefinition, cadence_core::ConfigurationError>; N],
    ) -> AssetGraph {
        let definitions: Result<Vec<_>, _> = definitions.into_iter().collect();
        match definitions.and_then(AssetGraph::from_definitions) {
            Ok(graph) => graph,
            Err(e) => panic!("invalid graph fixture: {e}"),
        }
    }
}

/// Engine wired to in-memory collaborators
pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<InMemoryMaterializationStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub events: Arc<RecordingSubscriber>,
}

/// Configuration for fast, deterministic tests: short poll interval and a
/// fixed backoff of 100ms for up to three retries
pub fn test_config() -> EngineConfig {
    EngineConfig {
        owner_id: "test-engine".to_string(),
        poll_interval: Duration::from_millis(10),
        max_concurrent_runs: 8,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            strategy: RetryStrategy::Fixed,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    }
}

pub fn harness(graph: AssetGraph) -> Harness {
    harness_with(graph, test_config())
}

pub fn harness_with(graph: AssetGraph, config: EngineConfig) -> Harness {
    let store = Arc::new(InMemoryMaterializationStore::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let events = Arc::new(RecordingSubscriber::new());

    let engine = Engine::new(
        graph,
        store.clone(),
        ExecutorRouter::new().with_fallback(executor.clone()),
        config,
    )
    .with_subscriber(events.clone());

    Harness {
        engine: Arc::new(engine),
        store,
        executor,
        events,
    }
}
