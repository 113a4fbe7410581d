//! Run coordinator
//!
//! Drives the units of a [`RunBatch`] from claim to finalization:
//!
//! 1. Resolve the content signatures of the unit's upstream pairs
//! 2. Route the unit to a compute executor
//! 3. Claim the pair in the materialization store; losing the claim means
//!    another attempt owns the pair and the unit is reported as
//!    `AlreadyRunning`
//! 4. Submit, then poll until the run reaches a terminal status, the tier's
//!    max duration passes, or the pair is cancelled
//! 5. Retry transient failures with backoff, each retry a new attempt
//! 6. Run the quality gate on successful output and finalize
//!
//! Within a batch a unit is released only once every unit it depends on has
//! finalized as `Success`. Units downstream of a failed, skipped or already
//! running unit are skipped. Failures never abort the rest of the batch.

use crate::concurrency::ConcurrencyLimiter;
use crate::config::EngineConfig;
use crate::executor::{ComputeExecutor, ExecutorError, ExecutorRouter, MaterializationOutput, PollStatus, SubmitRequest};
use crate::hooks::LifecycleSubscriber;
use crate::metrics::{DISPATCH_TOTAL, RETRY_TOTAL, RUN_DURATION};
use crate::quality_gate::QualityGate;
use crate::{Error, Result};
use cadence_core::{AssetKey, ComputeTier, PartitionKey, RunBatch, RunHandle, RunUnit, SharedAssetGraph};
use cadence_storage::{
    ClaimOutcome, ClaimRequest, Completion, FailureInfo, FinalizeOutcome, MaterializationRecord,
    MaterializationStatus, MaterializationStore, UpstreamSignature,
};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type Pair = (AssetKey, PartitionKey);

/// How a unit ended
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Succeeded(MaterializationRecord),

    /// Final failed attempt (logical, quality gate, or retries exhausted)
    Failed(MaterializationRecord),

    Cancelled(MaterializationRecord),

    /// Another attempt owned the pair, or the evaluator's view was stale
    AlreadyRunning {
        current: Option<Box<MaterializationRecord>>,
    },

    /// Not dispatched because an upstream unit of the batch did not succeed
    Skipped {
        upstream: AssetKey,
        partition: PartitionKey,
    },

    /// The coordinator could not drive the unit (storage or routing error)
    Errored(String),
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded(_))
    }

    /// Final record, if the unit got as far as a claim
    pub fn record(&self) -> Option<&MaterializationRecord> {
        match self {
            UnitOutcome::Succeeded(r) | UnitOutcome::Failed(r) | UnitOutcome::Cancelled(r) => Some(r),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Succeeded(_) => "succeeded",
            UnitOutcome::Failed(_) => "failed",
            UnitOutcome::Cancelled(_) => "cancelled",
            UnitOutcome::AlreadyRunning { .. } => "already_running",
            UnitOutcome::Skipped { .. } => "skipped",
            UnitOutcome::Errored(_) => "errored",
        }
    }

    fn from_record(record: MaterializationRecord) -> Self {
        match record.status {
            MaterializationStatus::Success => UnitOutcome::Succeeded(record),
            MaterializationStatus::Failed => UnitOutcome::Failed(record),
            MaterializationStatus::Cancelled => UnitOutcome::Cancelled(record),
            MaterializationStatus::InProgress => UnitOutcome::Errored(format!(
                "attempt {} is still in progress",
                record.attempt_id
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub unit: RunUnit,
    pub outcome: UnitOutcome,
}

/// Outcome of every unit of one batch, in batch order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    pub fn outcome_of(&self, asset: &AssetKey, partition: &PartitionKey) -> Option<&UnitOutcome> {
        self.units
            .iter()
            .find(|r| &r.unit.asset_key == asset && &r.unit.partition_key == partition)
            .map(|r| &r.outcome)
    }

    pub fn succeeded(&self) -> usize {
        self.count(UnitOutcome::is_success)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped { .. }))
    }

    pub fn all_succeeded(&self) -> bool {
        self.units.iter().all(|r| r.outcome.is_success())
    }

    fn count(&self, predicate: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.units.iter().filter(|r| predicate(&r.outcome)).count()
    }
}

/// A claimed attempt and the executor driving it
struct Attempt {
    record: MaterializationRecord,
    tier: ComputeTier,
    executor: Arc<dyn ComputeExecutor>,
    max_duration: Option<Duration>,
    cancel: Arc<Notify>,
}

impl Attempt {
    fn pair(&self) -> Pair {
        (self.record.asset_key.clone(), self.record.partition_key.clone())
    }
}

/// A claimed unit whose first attempt was handed to an executor
pub struct Submission {
    attempt: Attempt,
    submitted: std::result::Result<RunHandle, ExecutorError>,
}

impl Submission {
    /// The in-progress attempt
    pub fn record(&self) -> &MaterializationRecord {
        &self.attempt.record
    }

    /// Handle of the run; `None` if the executor refused the submission
    pub fn handle(&self) -> Option<&RunHandle> {
        self.submitted.as_ref().ok()
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("record", &self.attempt.record)
            .field("tier", &self.attempt.tier)
            .field("executor", &self.attempt.executor.name())
            .field("submitted", &self.submitted)
            .finish_non_exhaustive()
    }
}

/// Result of [`RunCoordinator::dispatch`]
#[derive(Debug)]
pub enum DispatchOutcome {
    Submitted(Submission),
    AlreadyRunning {
        current: Option<Box<MaterializationRecord>>,
    },
}

enum Waited {
    Finished(PollStatus),
    TimedOut(Duration),
    Cancelled,
}

enum Retried {
    Next(MaterializationRecord),
    Done(UnitOutcome),
}

/// Claims, dispatches and finalizes run units
pub struct RunCoordinator {
    store: Arc<dyn MaterializationStore>,
    graph: SharedAssetGraph,
    router: ExecutorRouter,
    config: EngineConfig,
    limiter: ConcurrencyLimiter,
    gate: QualityGate,
    subscribers: Vec<Arc<dyn LifecycleSubscriber>>,
    cancellations: Mutex<HashMap<Pair, Arc<Notify>>>,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn MaterializationStore>,
        graph: SharedAssetGraph,
        router: ExecutorRouter,
        config: EngineConfig,
    ) -> Self {
        let limiter = ConcurrencyLimiter::new(config.max_concurrent_runs);
        Self {
            store,
            graph,
            router,
            config,
            limiter,
            gate: QualityGate::new(),
            subscribers: Vec::new(),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn LifecycleSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn store(&self) -> &Arc<dyn MaterializationStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run every unit of a batch, releasing each once its intra-batch
    /// dependencies succeeded
    #[instrument(
        name = "coordinator.execute_batch",
        skip(self, batch),
        fields(batch_id = %batch.id, units = batch.len())
    )]
    pub async fn execute_batch(&self, batch: &RunBatch) -> BatchReport {
        let mut outcomes: Vec<Option<UnitOutcome>> = (0..batch.len()).map(|_| None).collect();
        let mut waiting_on: Vec<usize> = batch.dependencies.iter().map(Vec::len).collect();

        let mut running = FuturesUnordered::new();
        for index in batch.initially_ready() {
            running.push(self.run_indexed(batch, index));
        }

        while let Some((index, outcome)) = running.next().await {
            let succeeded = outcome.is_success();
            outcomes[index] = Some(outcome);

            if !succeeded {
                self.skip_dependents(batch, index, &mut outcomes);
                continue;
            }
            for dependent in batch.dependents_of(index) {
                waiting_on[dependent] = waiting_on[dependent].saturating_sub(1);
                if waiting_on[dependent] == 0 && outcomes[dependent].is_none() {
                    running.push(self.run_indexed(batch, dependent));
                }
            }
        }

        let units: Vec<UnitReport> = batch
            .units
            .iter()
            .zip(outcomes)
            .map(|(unit, outcome)| UnitReport {
                unit: unit.clone(),
                outcome: outcome
                    .unwrap_or_else(|| UnitOutcome::Errored("unit was never released".to_string())),
            })
            .collect();
        let report = BatchReport {
            batch_id: batch.id,
            units,
        };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Batch finished"
        );
        report
    }

    async fn run_indexed(&self, batch: &RunBatch, index: usize) -> (usize, UnitOutcome) {
        let unit = &batch.units[index];
        let label = unit.label();
        let outcome = match self.limiter.acquire(&label).await {
            Ok(_slot) => self.run_unit(unit, batch.id).await.unwrap_or_else(|e| {
                error!(unit = %label, error = %e, "Failed to drive run unit");
                UnitOutcome::Errored(e.to_string())
            }),
            Err(e) => UnitOutcome::Errored(e.to_string()),
        };
        (index, outcome)
    }

    fn skip_dependents(&self, batch: &RunBatch, failed: usize, outcomes: &mut [Option<UnitOutcome>]) {
        let upstream = &batch.units[failed];
        let mut pending = batch.dependents_of(failed);
        while let Some(index) = pending.pop() {
            if outcomes[index].is_some() {
                continue;
            }
            let unit = &batch.units[index];
            let reason = format!("upstream {} did not succeed", upstream.label());
            for subscriber in &self.subscribers {
                subscriber.on_skipped(unit, &reason);
            }
            outcomes[index] = Some(UnitOutcome::Skipped {
                upstream: upstream.asset_key.clone(),
                partition: upstream.partition_key.clone(),
            });
            pending.extend(batch.dependents_of(index));
        }
    }

    /// Dispatch one unit and drive it to completion
    #[instrument(
        name = "coordinator.run_unit",
        skip(self, unit),
        fields(asset = %unit.asset_key, partition = %unit.partition_key, reason = unit.reason.label())
    )]
    pub async fn run_unit(&self, unit: &RunUnit, run_id: Uuid) -> Result<UnitOutcome> {
        match self.dispatch(unit, run_id).await? {
            DispatchOutcome::AlreadyRunning { current } => Ok(UnitOutcome::AlreadyRunning { current }),
            DispatchOutcome::Submitted(submission) => self.complete(submission).await,
        }
    }

    /// Claim the unit's pair and submit its first attempt
    ///
    /// Fails with [`Error::UpstreamNotReady`] if an upstream pair has no
    /// successful materialization to read.
    pub async fn dispatch(&self, unit: &RunUnit, run_id: Uuid) -> Result<DispatchOutcome> {
        let upstream_signatures = self.resolve_upstream(unit).await?;
        let (tier, executor) = self.router.route(unit)?;

        let request = ClaimRequest {
            run_id,
            asset_key: unit.asset_key.clone(),
            partition_key: unit.partition_key.clone(),
            reason: unit.reason.clone(),
            expected_current: unit.observed_attempt,
            owner: self.config.owner_id.clone(),
            compute_tier: tier,
            upstream_signatures,
        };
        let record = match self.store.claim(request).await? {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::Conflict { current } => {
                DISPATCH_TOTAL
                    .with_label_values(&[tier.as_str(), "already_running"])
                    .inc();
                debug!(
                    current_attempt = ?current.as_ref().map(|r| r.attempt_id),
                    "Pair is owned by another attempt"
                );
                return Ok(DispatchOutcome::AlreadyRunning { current });
            }
        };

        for subscriber in &self.subscribers {
            subscriber.on_claimed(&record);
        }

        let cancel = Arc::new(Notify::new());
        self.cancellations.lock().insert(
            (record.asset_key.clone(), record.partition_key.clone()),
            Arc::clone(&cancel),
        );

        let mut attempt = Attempt {
            record,
            tier,
            executor,
            max_duration: self.config.max_duration_for(tier, unit.max_duration),
            cancel,
        };
        match self.submit(&mut attempt).await {
            Ok(submitted) => Ok(DispatchOutcome::Submitted(Submission { attempt, submitted })),
            Err(e) => {
                self.abandon(&attempt, &e).await;
                self.release(&attempt);
                Err(e)
            }
        }
    }

    /// Wait for a dispatched unit to finish, retrying transient failures
    pub async fn complete(&self, submission: Submission) -> Result<UnitOutcome> {
        let Submission {
            mut attempt,
            submitted,
        } = submission;
        let result = self.drive(&mut attempt, submitted).await;
        if let Err(e) = &result {
            self.abandon(&attempt, e).await;
        }
        self.release(&attempt);
        result
    }

    /// Cancel the in-progress attempt of a pair
    ///
    /// The attempt is finalized as `Cancelled` first; a result the executor
    /// reports afterwards is discarded. Returns `None` if nothing was in
    /// progress.
    #[instrument(name = "coordinator.cancel", skip(self), fields(asset = %asset, partition = %partition))]
    pub async fn cancel(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        let Some(record) = self.store.cancel(asset, partition).await? else {
            return Ok(None);
        };
        info!(attempt_id = %record.attempt_id, "Attempt cancelled");

        if let Some(waiter) = self
            .cancellations
            .lock()
            .get(&(asset.clone(), partition.clone()))
        {
            waiter.notify_one();
        }

        if let Some(handle) = &record.executor_handle {
            match self.router.by_name(&handle.executor) {
                Some(executor) => {
                    if let Err(e) = executor.cancel(handle).await {
                        warn!(error = %e, run = %handle.external_id, "Executor did not cancel run");
                    }
                }
                None => warn!(executor = %handle.executor, "No executor to cancel run on"),
            }
        }

        self.observe(&record);
        for subscriber in &self.subscribers {
            subscriber.on_finalized(&record);
        }
        Ok(Some(record))
    }

    async fn resolve_upstream(&self, unit: &RunUnit) -> Result<Vec<UpstreamSignature>> {
        let mut signatures = Vec::with_capacity(unit.upstream.len());
        for (upstream, upstream_partition) in &unit.upstream {
            let current = self.store.current(upstream, upstream_partition).await?;
            let resolved = current.and_then(|record| match (record.status, record.content_signature) {
                (MaterializationStatus::Success, Some(content_signature)) => Some(UpstreamSignature {
                    asset_key: record.asset_key,
                    partition_key: record.partition_key,
                    attempt_id: record.attempt_id,
                    content_signature,
                }),
                _ => None,
            });
            match resolved {
                Some(signature) => signatures.push(signature),
                None => {
                    return Err(Error::UpstreamNotReady {
                        asset: unit.asset_key.clone(),
                        partition: unit.partition_key.clone(),
                        upstream: upstream.clone(),
                        upstream_partition: upstream_partition.clone(),
                    })
                }
            }
        }
        Ok(signatures)
    }

    /// Hand the current attempt to its executor and record the handle
    async fn submit(&self, attempt: &mut Attempt) -> Result<std::result::Result<RunHandle, ExecutorError>> {
        let record = &attempt.record;
        let request = SubmitRequest {
            attempt_id: record.attempt_id,
            attempt_number: record.attempt_number,
            asset_key: record.asset_key.clone(),
            partition_key: record.partition_key.clone(),
            upstream_signatures: record.upstream_signatures.clone(),
            compute_tier: attempt.tier,
        };

        match attempt.executor.submit(request).await {
            Ok(handle) => {
                DISPATCH_TOTAL
                    .with_label_values(&[attempt.tier.as_str(), "submitted"])
                    .inc();
                attempt.record.executor_handle = Some(handle.clone());
                self.store
                    .record_handle(attempt.record.attempt_id, handle.clone())
                    .await?;
                debug!(
                    executor = %handle.executor,
                    run = %handle.external_id,
                    attempt_number = attempt.record.attempt_number,
                    "Run submitted"
                );
                Ok(Ok(handle))
            }
            Err(e) => {
                DISPATCH_TOTAL
                    .with_label_values(&[attempt.tier.as_str(), "error"])
                    .inc();
                warn!(error = %e, "Executor refused submission");
                Ok(Err(e))
            }
        }
    }

    async fn drive(
        &self,
        attempt: &mut Attempt,
        first: std::result::Result<RunHandle, ExecutorError>,
    ) -> Result<UnitOutcome> {
        let mut submitted = first;
        loop {
            let status = match submitted {
                Err(e) if e.is_transient() => PollStatus::TransientFailure(format!("submission failed: {e}")),
                Err(e) => PollStatus::LogicalFailure(format!("submission failed: {e}")),
                Ok(handle) => match self.wait(attempt, &handle).await {
                    Waited::Finished(status) => status,
                    Waited::TimedOut(limit) => PollStatus::TransientFailure(format!(
                        "exceeded max duration of {}s",
                        limit.as_secs()
                    )),
                    Waited::Cancelled => return self.settled(attempt.record.attempt_id).await,
                },
            };

            match status {
                PollStatus::Success(output) => return self.succeed(attempt, output).await,
                PollStatus::LogicalFailure(reason) => {
                    return self
                        .finalize(attempt, Completion::failed(FailureInfo::logical(reason)))
                        .await
                }
                PollStatus::TransientFailure(reason) => match self.retry(attempt, reason).await? {
                    Retried::Done(outcome) => return Ok(outcome),
                    Retried::Next(next) => {
                        attempt.record = next;
                        submitted = self.submit(attempt).await?;
                    }
                },
                PollStatus::Pending => {
                    submitted = Err(ExecutorError::Unavailable("run reported pending after completion".to_string()));
                }
            }
        }
    }

    /// Poll until the run finishes, times out or is cancelled
    async fn wait(&self, attempt: &Attempt, handle: &RunHandle) -> Waited {
        let deadline = attempt
            .max_duration
            .map(|limit| (tokio::time::Instant::now() + limit, limit));
        let timeout = async move {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        loop {
            match attempt.executor.poll(handle).await {
                Ok(PollStatus::Pending) => {}
                Ok(status) => return Waited::Finished(status),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, run = %handle.external_id, "Poll failed, will poll again");
                }
                Err(e) => {
                    return Waited::Finished(PollStatus::TransientFailure(format!(
                        "lost track of run {}: {e}",
                        handle.external_id
                    )))
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = attempt.cancel.notified() => return Waited::Cancelled,
                _ = &mut timeout => {
                    let limit = deadline.map(|(_, limit)| limit).unwrap_or_default();
                    warn!(
                        run = %handle.external_id,
                        max_duration_secs = limit.as_secs(),
                        "Run exceeded max duration"
                    );
                    if let Err(e) = attempt.executor.cancel(handle).await {
                        warn!(error = %e, run = %handle.external_id, "Executor did not cancel timed out run");
                    }
                    return Waited::TimedOut(limit);
                }
            }
        }
    }

    /// Record a transient failure and open the next attempt, or give up
    async fn retry(&self, attempt: &Attempt, reason: String) -> Result<Retried> {
        let failure = FailureInfo::transient(reason);

        let Some(delay) = self.config.retry.after_attempt(attempt.record.attempt_number) else {
            info!(attempts = attempt.record.attempt_number, "Retries exhausted");
            let outcome = self.finalize(attempt, Completion::failed(failure)).await?;
            return Ok(Retried::Done(outcome));
        };

        let next = match self
            .store
            .retry_attempt(attempt.record.attempt_id, failure.clone())
            .await?
        {
            ClaimOutcome::Claimed(next) => next,
            ClaimOutcome::Conflict { .. } => {
                return Ok(Retried::Done(self.settled(attempt.record.attempt_id).await?))
            }
        };

        RETRY_TOTAL.with_label_values(&[attempt.tier.as_str()]).inc();
        for subscriber in &self.subscribers {
            subscriber.on_retry(&failure, &next, delay);
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(Retried::Next(next)),
            _ = attempt.cancel.notified() => Ok(Retried::Done(self.settled(next.attempt_id).await?)),
        }
    }

    async fn succeed(&self, attempt: &Attempt, output: MaterializationOutput) -> Result<UnitOutcome> {
        let graph = self.graph.snapshot();
        let checks = graph
            .get(&attempt.record.asset_key)
            .map(|definition| definition.checks.as_slice())
            .unwrap_or_default();

        let verdict = self.gate.evaluate(
            &attempt.record.asset_key,
            &attempt.record.partition_key,
            checks,
            &output,
        );
        let completion = match verdict.failure_reason() {
            None => Completion::success(output.content_signature, output.metadata, verdict.results),
            Some(reason) => Completion::blocked(
                output.content_signature,
                output.metadata,
                verdict.results,
                reason,
            ),
        };
        self.finalize(attempt, completion).await
    }

    async fn finalize(&self, attempt: &Attempt, completion: Completion) -> Result<UnitOutcome> {
        match self
            .store
            .finalize(attempt.record.attempt_id, completion)
            .await?
        {
            FinalizeOutcome::Finalized(record) => {
                self.observe(&record);
                for subscriber in &self.subscribers {
                    subscriber.on_finalized(&record);
                }
                Ok(UnitOutcome::from_record(record))
            }
            FinalizeOutcome::NotInProgress(record) => {
                info!(
                    attempt_id = %record.attempt_id,
                    status = %record.status,
                    "Attempt already finalized, discarding late result"
                );
                Ok(UnitOutcome::from_record(record))
            }
        }
    }

    /// Outcome of an attempt somebody else finalized
    async fn settled(&self, attempt_id: Uuid) -> Result<UnitOutcome> {
        Ok(match self.store.attempt(attempt_id).await? {
            Some(record) => UnitOutcome::from_record(record),
            None => UnitOutcome::Errored(format!("attempt {attempt_id} disappeared")),
        })
    }

    /// Give up on a claimed attempt after a coordinator error
    ///
    /// Stops the submitted run and fails the attempt as transient so the
    /// pair is not left in progress. Both steps are best effort.
    async fn abandon(&self, attempt: &Attempt, cause: &Error) {
        error!(
            attempt_id = %attempt.record.attempt_id,
            error = %cause,
            "Abandoning claimed attempt"
        );

        if let Some(handle) = &attempt.record.executor_handle {
            if let Err(e) = attempt.executor.cancel(handle).await {
                warn!(error = %e, run = %handle.external_id, "Executor did not cancel abandoned run");
            }
        }

        let failure = FailureInfo::transient(format!("coordinator error: {cause}"));
        match self
            .store
            .finalize(attempt.record.attempt_id, Completion::failed(failure))
            .await
        {
            Ok(FinalizeOutcome::Finalized(record)) => {
                self.observe(&record);
                for subscriber in &self.subscribers {
                    subscriber.on_finalized(&record);
                }
            }
            Ok(FinalizeOutcome::NotInProgress(_)) => {}
            Err(e) => error!(
                attempt_id = %attempt.record.attempt_id,
                error = %e,
                "Could not finalize abandoned attempt, pair stays in progress"
            ),
        }
    }

    fn observe(&self, record: &MaterializationRecord) {
        let Some(completed_at) = record.completed_at else {
            return;
        };
        let elapsed = (completed_at - record.started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        RUN_DURATION
            .with_label_values(&[record.compute_tier.as_str(), record.status.as_str()])
            .observe(elapsed);
    }

    fn release(&self, attempt: &Attempt) {
        let pair = attempt.pair();
        let mut cancellations = self.cancellations.lock();
        if cancellations
            .get(&pair)
            .is_some_and(|waiter| Arc::ptr_eq(waiter, &attempt.cancel))
        {
            cancellations.remove(&pair);
        }
    }
}
