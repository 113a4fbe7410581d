//! Engine loop
//!
//! [`Engine`] pairs an [`Evaluator`] with a [`RunCoordinator`] over one
//! shared asset graph and materialization store. Each trigger gets its own
//! pass: evaluate, then execute the resulting batch. `serve` handles a
//! channel of triggers, running passes concurrently; the store's claim keeps
//! overlapping passes from running the same pair twice.
//!
//! The engine also carries the administrative operations: wiping records,
//! maintaining dynamic partition sets, cancelling attempts and reading
//! history.

use crate::config::EngineConfig;
use crate::coordinator::{BatchReport, RunCoordinator};
use crate::evaluator::{Evaluation, Evaluator};
use crate::executor::ExecutorRouter;
use crate::hooks::LifecycleSubscriber;
use crate::triggers::Trigger;
use crate::{Error, Result};
use cadence_core::partition::validate_key;
use cadence_core::{AssetGraph, AssetKey, PartitionKey, SharedAssetGraph};
use cadence_storage::{MaterializationRecord, MaterializationStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// What one trigger produced
#[derive(Debug)]
pub struct PassReport {
    pub trigger: Trigger,
    pub evaluation: Evaluation,
    pub report: BatchReport,
}

/// Asset engine: evaluator, coordinator and administrative operations
pub struct Engine {
    graph: SharedAssetGraph,
    store: Arc<dyn MaterializationStore>,
    evaluator: Evaluator,
    coordinator: RunCoordinator,
}

impl Engine {
    pub fn new(
        graph: AssetGraph,
        store: Arc<dyn MaterializationStore>,
        router: ExecutorRouter,
        config: EngineConfig,
    ) -> Self {
        let graph = SharedAssetGraph::new(graph);
        let evaluator = Evaluator::new(graph.clone(), Arc::clone(&store))
            .with_missing_upstream(config.missing_upstream);
        let coordinator = RunCoordinator::new(Arc::clone(&store), graph.clone(), router, config);
        Self {
            graph,
            store,
            evaluator,
            coordinator,
        }
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn LifecycleSubscriber>) -> Self {
        self.coordinator = self.coordinator.with_subscriber(subscriber);
        self
    }

    pub fn graph(&self) -> Arc<AssetGraph> {
        self.graph.snapshot()
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    /// Swap in a rebuilt graph; passes already running keep their snapshot
    pub fn replace_graph(&self, graph: AssetGraph) -> Arc<AssetGraph> {
        info!(assets = graph.len(), "Replacing asset graph");
        self.graph.replace(graph)
    }

    /// Evaluate a trigger now and execute the resulting batch
    pub async fn handle_trigger(&self, trigger: Trigger) -> Result<PassReport> {
        self.handle_trigger_at(trigger, Utc::now()).await
    }

    /// Evaluate a trigger as of `now` and execute the resulting batch
    #[instrument(name = "engine.pass", skip(self, trigger), fields(trigger = trigger.label()))]
    pub async fn handle_trigger_at(&self, trigger: Trigger, now: DateTime<Utc>) -> Result<PassReport> {
        let evaluation = self.evaluator.evaluate(&trigger, now).await?;
        for e in &evaluation.errors {
            warn!(error = %e, "Part of the trigger was not evaluated");
        }

        let report = if evaluation.batch.is_empty() {
            BatchReport {
                batch_id: evaluation.batch.id,
                units: Vec::new(),
            }
        } else {
            self.coordinator.execute_batch(&evaluation.batch).await
        };

        Ok(PassReport {
            trigger,
            evaluation,
            report,
        })
    }

    /// Handle triggers until the channel closes, one task per trigger
    pub async fn serve(self: Arc<Self>, mut triggers: mpsc::Receiver<Trigger>) {
        info!("Engine started");
        let mut passes = JoinSet::new();

        loop {
            tokio::select! {
                received = triggers.recv() => {
                    let Some(trigger) = received else {
                        break;
                    };
                    let engine = Arc::clone(&self);
                    passes.spawn(async move {
                        let label = trigger.label();
                        match engine.handle_trigger(trigger).await {
                            Ok(pass) => info!(
                                trigger = label,
                                units = pass.report.units.len(),
                                succeeded = pass.report.succeeded(),
                                "Pass finished"
                            ),
                            Err(e) => error!(trigger = label, error = %e, "Pass failed"),
                        }
                    });
                }
                Some(joined) = passes.join_next(), if !passes.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Pass task panicked");
                    }
                }
            }
        }

        while let Some(joined) = passes.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pass task panicked");
            }
        }
        info!("Trigger channel closed, engine stopped");
    }

    /// Cancel the in-progress attempt of a pair
    pub async fn cancel(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        self.coordinator.cancel(asset, partition).await
    }

    /// Delete the records of an asset, optionally limited to some
    /// partitions; in-progress pairs are kept
    ///
    /// Wiping twice is harmless: the second call removes nothing.
    #[instrument(name = "engine.wipe", skip(self, partitions), fields(asset = %asset))]
    pub async fn wipe(&self, asset: &AssetKey, partitions: Option<&[PartitionKey]>) -> Result<u64> {
        let removed = self.store.wipe(asset, partitions).await?;
        info!(removed, "Wiped materialization records");
        Ok(removed)
    }

    /// Register keys in a dynamic partition set; returns the keys that were
    /// new
    pub async fn add_dynamic_partitions(&self, name: &str, keys: &[String]) -> Result<Vec<String>> {
        for key in keys {
            validate_key(key)?;
        }
        let added = self.store.add_dynamic_partitions(name, keys).await?;
        if !added.is_empty() {
            info!(set = name, added = ?added, "Dynamic partitions added");
        }
        Ok(added)
    }

    /// Remove one key from a dynamic partition set
    ///
    /// Records of the removed partition stay in the store.
    pub async fn delete_dynamic_partition(&self, name: &str, key: &str) -> Result<bool> {
        let deleted = self.store.delete_dynamic_partition(name, key).await?;
        if deleted {
            info!(set = name, key, "Dynamic partition deleted");
        }
        Ok(deleted)
    }

    pub async fn current(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        Ok(self.store.current(asset, partition).await?)
    }

    /// Every attempt of a pair, oldest first
    pub async fn history(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Vec<MaterializationRecord>> {
        if self.graph.snapshot().get(asset).is_none() {
            return Err(Error::UnknownAsset(asset.clone()));
        }
        Ok(self.store.history(asset, partition).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MaterializationOutput;
    use crate::local_executor::{ComputeContext, InProcessExecutor};
    use crate::retry::RetryPolicy;
    use cadence_core::{AssetDefinition, ComputeTier, PartitionsDefinition};
    use cadence_storage::InMemoryMaterializationStore;
    use std::time::Duration;

    fn engine() -> Engine {
        let graph = AssetGraph::from_definitions([
            AssetDefinition::builder("regions")
                .partitions(PartitionsDefinition::dynamic("regions"))
                .compute_tier(ComputeTier::InProcess)
                .build()
                .unwrap(),
            AssetDefinition::builder("summary")
                .depends_on("regions")
                .compute_tier(ComputeTier::InProcess)
                .build()
                .unwrap(),
        ])
        .unwrap();

        let executor = Arc::new(InProcessExecutor::new());
        executor.register("regions", |ctx: ComputeContext| async move {
            Ok(MaterializationOutput::new(format!("regions-{}", ctx.partition_key)))
        });
        executor.register("summary", |ctx: ComputeContext| async move {
            Ok(MaterializationOutput::new(format!("summary-of-{}", ctx.upstream_signatures.len())))
        });

        let config = EngineConfig {
            owner_id: "engine-test".to_string(),
            poll_interval: Duration::from_millis(10),
            retry: RetryPolicy::none(),
            ..EngineConfig::default()
        };
        Engine::new(
            graph,
            Arc::new(InMemoryMaterializationStore::new()),
            ExecutorRouter::new().with_executor(ComputeTier::InProcess, executor),
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_partitions_are_picked_up() {
        let engine = engine();
        let added = engine
            .add_dynamic_partitions("regions", &["emea".to_string(), "apac".to_string()])
            .await
            .unwrap();
        assert_eq!(added.len(), 2);

        let pass = engine
            .handle_trigger(Trigger::Manual {
                selections: vec![crate::triggers::AssetSelection::all("regions")],
            })
            .await
            .unwrap();
        assert_eq!(pass.report.units.len(), 3, "{:?}", pass.report);
        assert!(pass.report.all_succeeded());

        let summary = engine
            .current(&AssetKey::new("summary"), &PartitionKey::Unpartitioned)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.content_signature.as_deref(), Some("summary-of-2"));

        // A key registered later is visible to the next pass without a rebuild.
        engine
            .add_dynamic_partitions("regions", &["amer".to_string()])
            .await
            .unwrap();
        let pass = engine
            .handle_trigger(Trigger::manual("regions", ["amer"]))
            .await
            .unwrap();
        assert!(pass.evaluation.errors.is_empty());
        assert!(pass.report.all_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_dynamic_keys_are_rejected() {
        let engine = engine();
        let err = engine
            .add_dynamic_partitions("regions", &["a|b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Partition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wipe_is_idempotent() {
        let engine = engine();
        engine
            .add_dynamic_partitions("regions", &["emea".to_string()])
            .await
            .unwrap();
        engine
            .handle_trigger(Trigger::manual("regions", ["emea"]))
            .await
            .unwrap();

        let regions = AssetKey::new("regions");
        let emea = PartitionKey::single("emea");
        assert_eq!(engine.history(&regions, &emea).await.unwrap().len(), 1);
        assert_eq!(engine.wipe(&regions, None).await.unwrap(), 1);
        assert_eq!(engine.wipe(&regions, None).await.unwrap(), 0);
        assert!(engine.current(&regions, &emea).await.unwrap().is_none());
        assert!(matches!(
            engine.history(&AssetKey::new("nope"), &emea).await,
            Err(Error::UnknownAsset(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_drains_channel() {
        let engine = Arc::new(engine());
        engine
            .add_dynamic_partitions("regions", &["emea".to_string()])
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(4);
        let server = tokio::spawn(Arc::clone(&engine).serve(rx));
        tx.send(Trigger::manual("regions", ["emea"])).await.unwrap();
        drop(tx);
        server.await.unwrap();

        let current = engine
            .current(&AssetKey::new("regions"), &PartitionKey::single("emea"))
            .await
            .unwrap()
            .unwrap();
        assert!(current.is_success());
    }
}
