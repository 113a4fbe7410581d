//! Evaluator
//!
//! Turns a [`Trigger`] into a [`RunBatch`]: the minimal set of
//! (asset, partition) pairs that must run, in dependency order.
//!
//! # Algorithm
//!
//! 1. **Seed**: explicitly requested pairs, pairs named by a schedule tick or
//!    sensor event, or pairs whose freshness policy deadline has passed.
//!    Pairs with an attempt in progress are skipped, as are replays of a
//!    sensor event or schedule tick that already produced the current
//!    success.
//! 2. **Propagate**: map every seeded pair forward through each dependent's
//!    partition mapping and add the affected downstream pairs. When the
//!    upstream pair was materialized outside this batch, downstream pairs
//!    that already read its current content signature are left alone.
//! 3. **Order**: sort the union topologically (ties by asset key, then
//!    partition key).
//! 4. **Check eligibility**: every upstream pair a unit reads must either be
//!    in the batch ahead of it or hold a successful materialization. Units
//!    failing this are skipped, and so is everything in the batch that
//!    reads them.
//!
//! The evaluator reads the store without locking and may over-propose when
//! two passes race; the claim made by the coordinator is what serializes
//! runs of the same pair.

use crate::config::MissingUpstreamPolicy;
use crate::metrics::{EVALUATED_UNITS_TOTAL, EVALUATION_SKIPPED_TOTAL};
use crate::triggers::Trigger;
use crate::{Error, Result};
use cadence_core::partition::{contains_key, keys_of};
use cadence_core::{
    AssetDefinition, AssetGraph, AssetKey, PartitionContext, PartitionError, PartitionKey,
    PartitionSelector, PartitionsDefinition, RunBatch, RunReason, RunUnit, SharedAssetGraph,
};
use cadence_storage::{MaterializationRecord, MaterializationStore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, instrument};

type Pair = (AssetKey, PartitionKey);

/// Why a considered pair was left out of the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An attempt for the pair is already running
    InProgress,

    /// The pair already reflects the trigger's input
    UpToDate,

    /// An upstream pair has no successful materialization and is not part
    /// of the batch
    UpstreamNotReady {
        upstream: AssetKey,
        partition: PartitionKey,
    },

    /// No upstream partition is mapped to the pair under the strict policy
    MissingUpstream { upstream: AssetKey },
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::InProgress => "in_progress",
            SkipReason::UpToDate => "up_to_date",
            SkipReason::UpstreamNotReady { .. } => "upstream_not_ready",
            SkipReason::MissingUpstream { .. } => "missing_upstream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPair {
    pub asset: AssetKey,
    pub partition: PartitionKey,
    pub reason: SkipReason,
}

/// Output of one evaluator pass
///
/// Invalid parts of a trigger (unknown assets, partitions outside the
/// asset's definition) are collected in `errors` without aborting the
/// rest of the pass.
#[derive(Debug)]
pub struct Evaluation {
    pub batch: RunBatch,
    pub skipped: Vec<SkippedPair>,
    pub errors: Vec<Error>,
}

impl Evaluation {
    /// Skip reason recorded for a pair, if it was skipped
    pub fn skip_reason(&self, asset: &AssetKey, partition: &PartitionKey) -> Option<&SkipReason> {
        self.skipped
            .iter()
            .find(|s| &s.asset == asset && &s.partition == partition)
            .map(|s| &s.reason)
    }
}

/// Computes run batches from triggers
#[derive(Clone)]
pub struct Evaluator {
    graph: SharedAssetGraph,
    store: Arc<dyn MaterializationStore>,
    missing_upstream: MissingUpstreamPolicy,
}

impl Evaluator {
    pub fn new(graph: SharedAssetGraph, store: Arc<dyn MaterializationStore>) -> Self {
        Self {
            graph,
            store,
            missing_upstream: MissingUpstreamPolicy::default(),
        }
    }

    pub fn with_missing_upstream(mut self, policy: MissingUpstreamPolicy) -> Self {
        self.missing_upstream = policy;
        self
    }

    /// Run one evaluation pass for a trigger
    ///
    /// Works on a snapshot of the asset graph and of the dynamic partition
    /// sets taken at the start of the pass, so keys registered after graph
    /// build are visible without a rebuild.
    #[instrument(
        name = "evaluator.evaluate",
        skip(self, trigger),
        fields(
            trigger = trigger.label(),
            units = tracing::field::Empty,
            skipped = tracing::field::Empty,
        )
    )]
    pub async fn evaluate(&self, trigger: &Trigger, now: DateTime<Utc>) -> Result<Evaluation> {
        let graph = self.graph.snapshot();
        let dynamic = self.store.dynamic_partitions().await?;

        let mut pass = Pass {
            graph: graph.as_ref(),
            store: self.store.as_ref(),
            ctx: PartitionContext::new(now, dynamic),
            policy: self.missing_upstream,
            current: HashMap::new(),
            decided: HashSet::new(),
            selected: BTreeMap::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
        };

        let external_roots = pass.seed(trigger).await?;
        pass.propagate(external_roots).await?;
        let batch = pass.build_batch().await?;

        for unit in &batch.units {
            EVALUATED_UNITS_TOTAL
                .with_label_values(&[unit.reason.label()])
                .inc();
        }
        for skipped in &pass.skipped {
            EVALUATION_SKIPPED_TOTAL
                .with_label_values(&[skipped.reason.label()])
                .inc();
        }
        if !pass.errors.is_empty() {
            EVALUATION_SKIPPED_TOTAL
                .with_label_values(&["invalid"])
                .inc_by(pass.errors.len() as u64);
        }

        let span = tracing::Span::current();
        span.record("units", batch.len());
        span.record("skipped", pass.skipped.len());
        info!(
            batch_id = %batch.id,
            units = batch.len(),
            skipped = pass.skipped.len(),
            errors = pass.errors.len(),
            "Evaluation complete"
        );

        Ok(Evaluation {
            batch,
            skipped: pass.skipped,
            errors: pass.errors,
        })
    }
}

/// State of one evaluation pass
struct Pass<'a> {
    graph: &'a AssetGraph,
    store: &'a dyn MaterializationStore,
    ctx: PartitionContext,
    policy: MissingUpstreamPolicy,

    /// Current attempts read so far, so every decision in a pass sees the
    /// same store state
    current: HashMap<Pair, Option<MaterializationRecord>>,

    /// Pairs already selected or skipped
    decided: HashSet<Pair>,

    selected: BTreeMap<Pair, RunReason>,
    skipped: Vec<SkippedPair>,
    errors: Vec<Error>,
}

impl<'a> Pass<'a> {
    async fn current(
        &mut self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        let pair = (asset.clone(), partition.clone());
        if let Some(cached) = self.current.get(&pair) {
            return Ok(cached.clone());
        }
        let record = self.store.current(asset, partition).await?;
        self.current.insert(pair, record.clone());
        Ok(record)
    }

    fn definition(&mut self, asset: &AssetKey) -> Option<&'a AssetDefinition> {
        let graph: &'a AssetGraph = self.graph;
        let definition = graph.get(asset);
        if definition.is_none() {
            self.errors.push(Error::UnknownAsset(asset.clone()));
        }
        definition
    }

    fn skip(&mut self, pair: Pair, reason: SkipReason) {
        debug!(
            asset = %pair.0,
            partition = %pair.1,
            reason = reason.label(),
            "Pair skipped"
        );
        self.decided.insert(pair.clone());
        self.skipped.push(SkippedPair {
            asset: pair.0,
            partition: pair.1,
            reason,
        });
    }

    /// Select a pair unless it is running or already reflects `reason`
    ///
    /// Returns true if the pair was selected by this call.
    async fn offer(&mut self, asset: AssetKey, partition: PartitionKey, reason: RunReason) -> Result<bool> {
        let pair = (asset, partition);
        if self.decided.contains(&pair) {
            return Ok(false);
        }

        if let Some(record) = self.current(&pair.0, &pair.1).await? {
            if record.is_in_progress() {
                self.skip(pair, SkipReason::InProgress);
                return Ok(false);
            }
            if record.is_success() {
                if let Some(version) = reason.source_version() {
                    if record.source_version.as_deref() == Some(version.as_str()) {
                        self.skip(pair, SkipReason::UpToDate);
                        return Ok(false);
                    }
                }
            }
        }

        self.decided.insert(pair.clone());
        self.selected.insert(pair, reason);
        Ok(true)
    }

    /// Seed the selection from a trigger
    ///
    /// Returns pairs materialized outside this pass whose dependents must
    /// be propagated to.
    async fn seed(&mut self, trigger: &Trigger) -> Result<Vec<Pair>> {
        let mut external_roots = Vec::new();
        match trigger {
            Trigger::Manual { selections } => {
                for selection in selections {
                    let Some(definition) = self.definition(&selection.asset) else {
                        continue;
                    };
                    match select_keys(definition.partitions.as_ref(), &selection.partitions, &self.ctx) {
                        Ok(keys) => {
                            for key in keys {
                                self.offer(selection.asset.clone(), key, RunReason::Manual)
                                    .await?;
                            }
                        }
                        Err(e) => self.errors.push(e.into()),
                    }
                }
            }

            Trigger::ScheduleTick {
                schedule,
                scheduled_for,
                assets,
            } => {
                let tick_ctx = PartitionContext::new(*scheduled_for, self.ctx.dynamic.clone());
                for asset in assets {
                    let Some(definition) = self.definition(asset) else {
                        continue;
                    };
                    let keys = match &definition.partitions {
                        Some(partitions) => partitions.freshness_keys(&tick_ctx),
                        None => Ok(vec![PartitionKey::Unpartitioned]),
                    };
                    match keys {
                        Ok(keys) => {
                            for key in keys {
                                let reason = RunReason::ScheduleTick {
                                    schedule: schedule.clone(),
                                    scheduled_for: *scheduled_for,
                                };
                                self.offer(asset.clone(), key, reason).await?;
                            }
                        }
                        Err(e) => self.errors.push(e.into()),
                    }
                }
            }

            Trigger::Sensor(event) => {
                if let Some(definition) = self.definition(&event.asset) {
                    let partitions = definition.partitions.as_ref();
                    let keys = if event.partitions.is_empty() {
                        keys_of(partitions, &self.ctx)
                    } else {
                        event
                            .partitions
                            .iter()
                            .map(|key| {
                                if contains_key(partitions, key, &self.ctx) {
                                    Ok(key.clone())
                                } else {
                                    Err(unknown_partition(key, partitions))
                                }
                            })
                            .collect()
                    };
                    match keys {
                        Ok(keys) => {
                            for key in keys {
                                let reason = RunReason::Sensor {
                                    sensor: event.sensor.clone(),
                                    data_version: event.data_version.clone(),
                                };
                                self.offer(event.asset.clone(), key, reason).await?;
                            }
                        }
                        Err(e) => self.errors.push(e.into()),
                    }
                }
            }

            Trigger::UpstreamMaterialized { asset, partition } => {
                if self.definition(asset).is_some() {
                    match self.current(asset, partition).await? {
                        Some(record) if record.is_success() => {
                            external_roots.push((asset.clone(), partition.clone()));
                        }
                        _ => debug!(
                            asset = %asset,
                            partition = %partition,
                            "Upstream has no current success, nothing to propagate"
                        ),
                    }
                }
            }

            Trigger::FreshnessTick => self.seed_stale().await?,
        }
        Ok(external_roots)
    }

    /// Seed every tracked partition whose freshness deadline has passed
    async fn seed_stale(&mut self) -> Result<()> {
        let graph: &'a AssetGraph = self.graph;
        let now = self.ctx.now;

        for asset in graph.keys() {
            let Some(definition) = graph.get(asset) else {
                continue;
            };
            let Some(policy) = &definition.freshness else {
                continue;
            };
            let keys = match &definition.partitions {
                Some(partitions) => match partitions.freshness_keys(&self.ctx) {
                    Ok(keys) => keys,
                    Err(e) => {
                        self.errors.push(e.into());
                        continue;
                    }
                },
                None => vec![PartitionKey::Unpartitioned],
            };

            let scanned: HashMap<PartitionKey, MaterializationRecord> = self
                .store
                .scan_asset(asset)
                .await?
                .into_iter()
                .map(|record| (record.partition_key.clone(), record))
                .collect();

            for key in keys {
                let current = scanned.get(&key).cloned();
                self.current
                    .insert((asset.clone(), key.clone()), current.clone());

                let last_success = match current {
                    Some(record) if record.is_success() => Some(record),
                    Some(_) => self.store.last_success(asset, &key).await?,
                    None => None,
                };
                if !policy.is_stale(last_success.as_ref().and_then(|r| r.completed_at), now) {
                    continue;
                }
                let reason = match last_success {
                    Some(_) => RunReason::Freshness,
                    None => RunReason::Missing,
                };
                self.offer(asset.clone(), key, reason).await?;
            }
        }
        Ok(())
    }

    /// Add every downstream pair affected by a selected pair or an external
    /// root
    async fn propagate(&mut self, external_roots: Vec<Pair>) -> Result<()> {
        let graph: &'a AssetGraph = self.graph;
        let external: HashSet<Pair> = external_roots.iter().cloned().collect();
        let mut queue: VecDeque<Pair> = self.selected.keys().cloned().collect();
        queue.extend(external_roots);

        while let Some((asset, key)) = queue.pop_front() {
            let Some(upstream_def) = graph.get(&asset) else {
                continue;
            };
            let from_store = external.contains(&(asset.clone(), key.clone()));

            for dependent in graph.dependents_of(&asset) {
                let (Some(dependent_def), Some(mapping)) =
                    (graph.get(dependent), graph.mapping(&asset, dependent))
                else {
                    continue;
                };
                let affected = match mapping.downstream_keys(
                    &key,
                    upstream_def.partitions.as_ref(),
                    dependent_def.partitions.as_ref(),
                    &self.ctx,
                ) {
                    Ok(keys) => keys,
                    Err(e) => {
                        self.errors.push(e.into());
                        continue;
                    }
                };

                for downstream_key in affected {
                    let pair = (dependent.clone(), downstream_key);
                    if self.decided.contains(&pair) {
                        continue;
                    }
                    if from_store && self.reads_current(&pair, &asset, &key).await? {
                        self.skip(pair, SkipReason::UpToDate);
                        continue;
                    }
                    let reason = RunReason::UpstreamChanged {
                        upstream: asset.clone(),
                    };
                    if self.offer(pair.0.clone(), pair.1.clone(), reason).await? {
                        queue.push_back(pair);
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns true if `pair` last succeeded on the upstream pair's current
    /// content signature
    async fn reads_current(&mut self, pair: &Pair, upstream: &AssetKey, upstream_key: &PartitionKey) -> Result<bool> {
        let Some(upstream_signature) = self
            .current(upstream, upstream_key)
            .await?
            .and_then(|r| r.content_signature)
        else {
            return Ok(false);
        };
        Ok(self
            .current(&pair.0, &pair.1)
            .await?
            .filter(MaterializationRecord::is_success)
            .map_or(false, |r| {
                r.upstream_signature(upstream, upstream_key) == Some(upstream_signature.as_str())
            }))
    }

    /// Order the selection and resolve every unit's upstream pairs
    async fn build_batch(&mut self) -> Result<RunBatch> {
        let graph: &'a AssetGraph = self.graph;
        let mut ordered: Vec<(Pair, RunReason)> = std::mem::take(&mut self.selected).into_iter().collect();
        ordered.sort_by(|((a_asset, a_key), _), ((b_asset, b_key), _)| {
            let a_pos = graph.topological_index(a_asset).unwrap_or(usize::MAX);
            let b_pos = graph.topological_index(b_asset).unwrap_or(usize::MAX);
            a_pos.cmp(&b_pos).then_with(|| a_key.cmp(b_key))
        });

        let mut index: HashMap<Pair, usize> = HashMap::new();
        let mut dropped: HashSet<Pair> = HashSet::new();
        let mut units = Vec::with_capacity(ordered.len());
        let mut dependencies = Vec::with_capacity(ordered.len());

        'units: for ((asset, key), reason) in ordered {
            let Some(definition) = graph.get(&asset) else {
                continue;
            };
            let mut upstream = Vec::new();
            let mut unit_deps = Vec::new();

            for dependency in graph.dependencies_of(&asset) {
                let (Some(upstream_def), Some(mapping)) =
                    (graph.get(dependency), graph.mapping(dependency, &asset))
                else {
                    continue;
                };
                let upstream_keys = match mapping.upstream_keys(
                    &key,
                    upstream_def.partitions.as_ref(),
                    definition.partitions.as_ref(),
                    &self.ctx,
                ) {
                    Ok(keys) => keys,
                    Err(e) => {
                        self.errors.push(e.into());
                        dropped.insert((asset, key));
                        continue 'units;
                    }
                };

                if upstream_keys.is_empty() {
                    match self.policy {
                        MissingUpstreamPolicy::Liberal => debug!(
                            asset = %asset,
                            partition = %key,
                            upstream = %dependency,
                            "No upstream partition mapped, scheduling anyway"
                        ),
                        MissingUpstreamPolicy::Strict => {
                            self.errors.push(Error::MissingUpstreamPartition {
                                asset: asset.clone(),
                                partition: key.clone(),
                                upstream: dependency.clone(),
                            });
                            dropped.insert((asset.clone(), key.clone()));
                            self.skip(
                                (asset, key),
                                SkipReason::MissingUpstream {
                                    upstream: dependency.clone(),
                                },
                            );
                            continue 'units;
                        }
                    }
                }

                for upstream_key in upstream_keys {
                    let upstream_pair = (dependency.clone(), upstream_key);
                    if let Some(&position) = index.get(&upstream_pair) {
                        unit_deps.push(position);
                    } else {
                        let ready = !dropped.contains(&upstream_pair)
                            && self
                                .current(&upstream_pair.0, &upstream_pair.1)
                                .await?
                                .map_or(false, |r| r.is_success());
                        if !ready {
                            dropped.insert((asset.clone(), key.clone()));
                            self.skip(
                                (asset, key),
                                SkipReason::UpstreamNotReady {
                                    upstream: upstream_pair.0,
                                    partition: upstream_pair.1,
                                },
                            );
                            continue 'units;
                        }
                    }
                    upstream.push(upstream_pair);
                }
            }

            unit_deps.sort_unstable();
            unit_deps.dedup();
            let observed_attempt = self.current(&asset, &key).await?.map(|r| r.attempt_id);

            index.insert((asset.clone(), key.clone()), units.len());
            units.push(RunUnit {
                asset_key: asset,
                partition_key: key,
                reason,
                observed_attempt,
                upstream,
                compute_tier: definition.compute_tier,
                max_duration: definition.max_duration,
            });
            dependencies.push(unit_deps);
        }

        Ok(RunBatch::new(units, dependencies))
    }
}

/// Keys denoted by a selector on an optional definition
fn select_keys(
    definition: Option<&PartitionsDefinition>,
    selector: &PartitionSelector,
    ctx: &PartitionContext,
) -> std::result::Result<Vec<PartitionKey>, PartitionError> {
    match (definition, selector) {
        (Some(definition), _) => definition.select(selector, ctx),
        (None, PartitionSelector::All) => Ok(vec![PartitionKey::Unpartitioned]),
        (None, PartitionSelector::Keys(keys)) if keys.iter().all(PartitionKey::is_unpartitioned) => {
            Ok(vec![PartitionKey::Unpartitioned])
        }
        (None, other) => Err(PartitionError::InvalidSelector {
            selector: other.to_string(),
            reason: "asset is not partitioned".to_string(),
        }),
    }
}

fn unknown_partition(key: &PartitionKey, definition: Option<&PartitionsDefinition>) -> PartitionError {
    PartitionError::UnknownPartition {
        key: key.to_string(),
        definition: definition.map_or_else(|| "unpartitioned".to_string(), |d| d.describe()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::{AssetSelection, SensorEvent};
    use cadence_core::{
        AssetGraph, ComputeTier, FreshnessPolicy, PartitionMapping, TimeWindowPartitions,
    };
    use cadence_storage::{ClaimOutcome, ClaimRequest, Completion, InMemoryMaterializationStore};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()
    }

    fn daily() -> PartitionsDefinition {
        PartitionsDefinition::Time(TimeWindowPartitions::daily("2024-01-01", Some("2024-01-04")).unwrap())
    }

    fn graph() -> SharedAssetGraph {
        SharedAssetGraph::new(
            AssetGraph::from_definitions([
                AssetDefinition::builder("raw").partitions(daily()).build().unwrap(),
                AssetDefinition::builder("clean")
                    .partitions(daily())
                    .depends_on("raw")
                    .build()
                    .unwrap(),
                AssetDefinition::builder("report")
                    .depends_on("clean")
                    .compute_tier(ComputeTier::Batch)
                    .build()
                    .unwrap(),
            ])
            .unwrap(),
        )
    }

    fn day(d: &str) -> PartitionKey {
        PartitionKey::single(d)
    }

    async fn materialize(
        store: &InMemoryMaterializationStore,
        asset: &str,
        partition: PartitionKey,
        reason: RunReason,
        signature: &str,
    ) -> MaterializationRecord {
        let asset = AssetKey::new(asset);
        let expected = store
            .current(&asset, &partition)
            .await
            .unwrap()
            .map(|r| r.attempt_id);
        let ClaimOutcome::Claimed(record) = store
            .claim(ClaimRequest {
                run_id: Uuid::new_v4(),
                asset_key: asset,
                partition_key: partition,
                reason,
                expected_current: expected,
                owner: "test".to_string(),
                compute_tier: ComputeTier::InProcess,
                upstream_signatures: Vec::new(),
            })
            .await
            .unwrap()
        else {
            panic!("claim conflict");
        };
        store
            .finalize(
                record.attempt_id,
                Completion::success(signature, Default::default(), Vec::new()),
            )
            .await
            .unwrap();
        record
    }

    fn labels(evaluation: &Evaluation) -> Vec<String> {
        evaluation.batch.units.iter().map(RunUnit::label).collect()
    }

    #[tokio::test]
    async fn test_manual_request_propagates_downstream() {
        let store = Arc::new(InMemoryMaterializationStore::new());
        for d in ["2024-01-01", "2024-01-03"] {
            materialize(&store, "clean", day(d), RunReason::Manual, d).await;
        }
        let evaluator = Evaluator::new(graph(), store.clone());

        let evaluation = evaluator
            .evaluate(&Trigger::manual("raw", [day("2024-01-02")]), now())
            .await
            .unwrap();

        assert_eq!(
            labels(&evaluation),
            vec!["raw[2024-01-02]", "clean[2024-01-02]", "report[__unpartitioned__]"]
        );
        let batch = &evaluation.batch;
        assert_eq!(batch.dependencies, vec![vec![], vec![0], vec![1]]);
        assert_eq!(
            batch.units[1].reason,
            RunReason::UpstreamChanged {
                upstream: AssetKey::new("raw")
            }
        );
        // `report` reads every `clean` partition
        assert_eq!(batch.units[2].upstream.len(), 3);
        assert_eq!(batch.units[2].compute_tier, ComputeTier::Batch);
    }

    #[tokio::test]
    async fn test_units_wait_for_unmaterialized_upstream() {
        let store = Arc::new(InMemoryMaterializationStore::new());
        let evaluator = Evaluator::new(graph(), store.clone());

        let evaluation = evaluator
            .evaluate(&Trigger::manual("raw", [day("2024-01-02")]), now())
            .await
            .unwrap();
        assert_eq!(labels(&evaluation), vec!["raw[2024-01-02]", "clean[2024-01-02]"]);
        assert_eq!(
            evaluation.skip_reason(&AssetKey::new("report"), &PartitionKey::Unpartitioned),
            Some(&SkipReason::UpstreamNotReady {
                upstream: AssetKey::new("clean"),
                partition: day("2024-01-01"),
            })
        );

        let evaluation = evaluator
            .evaluate(&Trigger::manual("report", [PartitionKey::Unpartitioned]), now())
            .await
            .unwrap();
        assert!(evaluation.batch.is_empty());
    }

    #[tokio::test]
    async fn test_in_progress_pairs_are_not_rescheduled() {
        let store = Arc::new(InMemoryMaterializationStore::new());
        store
            .claim(ClaimRequest {
                run_id: Uuid::new_v4(),
                asset_key: AssetKey::new("raw"),
                partition_key: day("2024-01-01"),
                reason: RunReason::Manual,
                expected_current: None,
                owner: "other".to_string(),
                compute_tier: ComputeTier::InProcess,
                upstream_signatures: Vec::new(),
            })
            .await
            .unwrap();
        let evaluator = Evaluator::new(graph(), store.clone());

        let evaluation = evaluator
            .evaluate(
                &Trigger::Manual {
                    selections: vec![AssetSelection::parse("raw", "2024-01-01..2024-01-02").unwrap()],
                },
                now(),
            )
            .await
            .unwrap();

        assert_eq!(
            evaluation.skip_reason(&AssetKey::new("raw"), &day("2024-01-01")),
            Some(&SkipReason::InProgress)
        );
        assert!(evaluation
            .batch
            .position(&AssetKey::new("raw"), &day("2024-01-02"))
            .is_some());
    }

    #[tokio::test]
    async fn test_sensor_replay_is_a_no_op() {
        let store = Arc::new(InMemoryMaterializationStore::new());
        let evaluator = Evaluator::new(graph(), store.clone());
        let event = SensorEvent {
            sensor: "landing_files".to_string(),
            asset: AssetKey::new("raw"),
            partitions: vec![day("2024-01-03")],
            data_version: Some("v1".to_string()),
            observed_at: now(),
        };
        let reason = RunReason::Sensor {
            sensor: "landing_files".to_string(),
            data_version: Some("v1".to_string()),
        };
        materialize(&store, "raw", day("2024-01-03"), reason, "sig-1").await;

        let evaluation = evaluator
            .evaluate(&Trigger::Sensor(event.clone()), now())
            .await
            .unwrap();
        assert!(evaluation.batch.is_empty());
        assert_eq!(
            evaluation.skip_reason(&AssetKey::new("raw"), &day("2024-01-03")),
            Some(&SkipReason::UpToDate)
        );

        let newer = SensorEvent {
            data_version: Some("v2".to_string()),
            ..event
        };
        let evaluation = evaluator.evaluate(&Trigger::Sensor(newer), now()).await.unwrap();
        assert_eq!(evaluation.batch.units[0].label(), "raw[2024-01-03]");
    }

    #[tokio::test]
    async fn test_upstream_materialized_skips_up_to_date_dependents() {
        let store = Arc::new(InMemoryMaterializationStore::new());
        let evaluator = Evaluator::new(graph(), store.clone());
        let raw = materialize(&store, "raw", day("2024-01-01"), RunReason::Manual, "raw-1").await;

        // clean read the current raw content already
        let clean = store
            .claim(ClaimRequest {
                run_id: Uuid::new_v4(),
                asset_key: AssetKey::new("clean"),
                partition_key: day("2024-01-01"),
                reason: RunReason::Manual,
                expected_current: None,
                owner: "test".to_string(),
                compute_tier: ComputeTier::InProcess,
                upstream_signatures: vec![cadence_storage::UpstreamSignature {
                    asset_key: AssetKey::new("raw"),
                    partition_key: day("2024-01-01"),
                    attempt_id: raw.attempt_id,
                    content_signature: "raw-1".to_string(),
                }],
            })
            .await
            .unwrap();
        let ClaimOutcome::Claimed(clean) = clean else {
            panic!("claim conflict");
        };
        store
            .finalize(clean.attempt_id, Completion::success("clean-1", Default::default(), vec![]))
            .await
            .unwrap();

        let trigger = Trigger::UpstreamMaterialized {
            asset: AssetKey::new("raw"),
            partition: day("2024-01-01"),
        };
        let evaluation = evaluator.evaluate(&trigger, now()).await.unwrap();
        assert!(evaluation.batch.is_empty());
        assert_eq!(
            evaluation.skip_reason(&AssetKey::new("clean"), &day("2024-01-01")),
            Some(&SkipReason::UpToDate)
        );

        // A new raw materialization makes clean stale again.
        materialize(&store, "raw", day("2024-01-01"), RunReason::Manual, "raw-2").await;
        let evaluation = evaluator.evaluate(&trigger, now()).await.unwrap();
        assert_eq!(labels(&evaluation)[0], "clean[2024-01-01]");
    }

    #[tokio::test]
    async fn test_freshness_tick_seeds_stale_and_missing() {
        let definitions = [
            AssetDefinition::builder("hourly_feed")
                .freshness(FreshnessPolicy::max_staleness(chrono::Duration::hours(1)))
                .build()
                .unwrap(),
            AssetDefinition::builder("fresh_feed")
                .freshness(FreshnessPolicy::max_staleness(chrono::Duration::days(365 * 10)))
                .build()
                .unwrap(),
            AssetDefinition::builder("never_run")
                .freshness(FreshnessPolicy::max_staleness(chrono::Duration::hours(1)))
                .build()
                .unwrap(),
        ];
        let graph = SharedAssetGraph::new(AssetGraph::from_definitions(definitions).unwrap());
        let store = Arc::new(InMemoryMaterializationStore::new());
        materialize(&store, "hourly_feed", PartitionKey::Unpartitioned, RunReason::Manual, "a").await;
        materialize(&store, "fresh_feed", PartitionKey::Unpartitioned, RunReason::Manual, "b").await;

        let later = Utc::now() + chrono::Duration::hours(2);
        let evaluation = Evaluator::new(graph, store)
            .evaluate(&Trigger::FreshnessTick, later)
            .await
            .unwrap();

        let reasons: Vec<(String, RunReason)> = evaluation
            .batch
            .units
            .iter()
            .map(|u| (u.asset_key.to_string(), u.reason.clone()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("hourly_feed".to_string(), RunReason::Freshness),
                ("never_run".to_string(), RunReason::Missing),
            ]
        );
    }

    #[tokio::test]
    async fn test_bounded_range_tracks_latest_completed_window() {
        let year = PartitionsDefinition::Time(
            TimeWindowPartitions::daily("2024-01-01", Some("2024-12-31")).unwrap(),
        );
        let graph = SharedAssetGraph::new(
            AssetGraph::from_definitions([AssetDefinition::builder("daily_feed")
                .partitions(year)
                .freshness(FreshnessPolicy::max_staleness(chrono::Duration::hours(1)))
                .build()
                .unwrap()])
            .unwrap(),
        );
        let evaluator = Evaluator::new(graph, Arc::new(InMemoryMaterializationStore::new()));
        let tick_at = Utc.with_ymd_and_hms(2024, 1, 5, 12, 0, 0).unwrap();

        let evaluation = evaluator
            .evaluate(&Trigger::FreshnessTick, tick_at)
            .await
            .unwrap();
        assert_eq!(labels(&evaluation), vec!["daily_feed[2024-01-04]"]);

        let scheduled = Trigger::ScheduleTick {
            schedule: "nightly".to_string(),
            scheduled_for: tick_at,
            assets: vec![AssetKey::new("daily_feed")],
        };
        let evaluation = evaluator.evaluate(&scheduled, tick_at).await.unwrap();
        assert_eq!(labels(&evaluation), vec!["daily_feed[2024-01-04]"]);

        // Nothing has completed before the first window closes.
        let evaluation = evaluator
            .evaluate(
                &Trigger::FreshnessTick,
                Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        assert!(evaluation.batch.is_empty());
    }

    #[tokio::test]
    async fn test_missing_upstream_policy() {
        let mut mapping = BTreeMap::new();
        mapping.insert("eu".to_string(), vec!["europe".to_string()]);
        let definitions = [
            AssetDefinition::builder("regions")
                .partitions(PartitionsDefinition::static_keys(["europe"]))
                .build()
                .unwrap(),
            AssetDefinition::builder("sales")
                .partitions(PartitionsDefinition::static_keys(["eu", "apac"]))
                .depends_on_with("regions", PartitionMapping::Static { mapping })
                .build()
                .unwrap(),
        ];
        let graph = SharedAssetGraph::new(AssetGraph::from_definitions(definitions).unwrap());
        let store = Arc::new(InMemoryMaterializationStore::new());
        let trigger = Trigger::manual("sales", [day("apac")]);

        let liberal = Evaluator::new(graph.clone(), store.clone())
            .evaluate(&trigger, now())
            .await
            .unwrap();
        assert_eq!(labels(&liberal), vec!["sales[apac]"]);
        assert!(liberal.batch.units[0].upstream.is_empty());

        let strict = Evaluator::new(graph, store)
            .with_missing_upstream(MissingUpstreamPolicy::Strict)
            .evaluate(&trigger, now())
            .await
            .unwrap();
        assert!(strict.batch.is_empty());
        assert!(matches!(
            strict.errors.as_slice(),
            [Error::MissingUpstreamPartition { .. }]
        ));
    }

    #[tokio::test]
    async fn test_invalid_requests_do_not_abort_the_pass() {
        let store = Arc::new(InMemoryMaterializationStore::new());
        let evaluator = Evaluator::new(graph(), store);

        let trigger = Trigger::Manual {
            selections: vec![
                AssetSelection::all("missing_asset"),
                AssetSelection::keys("raw", [day("2023-12-31")]),
                AssetSelection::keys("raw", [day("2024-01-01")]),
            ],
        };
        let evaluation = evaluator.evaluate(&trigger, now()).await.unwrap();
        assert_eq!(evaluation.errors.len(), 2);
        assert!(matches!(evaluation.errors[0], Error::UnknownAsset(_)));
        assert_eq!(labels(&evaluation)[0], "raw[2024-01-01]");
    }
}
