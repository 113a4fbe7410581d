//! In-process executor for development and testing
//!
//! Runs registered async compute functions on tokio tasks inside the engine
//! process, without any external infrastructure. Useful for:
//!
//! - Local development and debugging
//! - Tests that exercise the full claim / dispatch / finalize path
//!
//! ## Limitations
//!
//! - **Single process**: runs die with the process
//! - **Abort-based cancellation**: a cancelled run's task is aborted at its
//!   next await point
//!
//! # Example
//!
//! ```rust,ignore
//! let executor = InProcessExecutor::new();
//! executor.register("raw", |ctx| async move {
//!     Ok(MaterializationOutput::new(format!("raw-{}", ctx.partition_key)))
//! });
//! ```

use crate::executor::{ComputeExecutor, ExecutorError, MaterializationOutput, PollStatus, SubmitRequest};
use async_trait::async_trait;
use cadence_core::{AssetKey, PartitionKey, RunHandle};
use cadence_storage::UpstreamSignature;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

const EXECUTOR_NAME: &str = "in_process";

/// Inputs handed to a compute function
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub attempt_id: Uuid,
    pub attempt_number: u32,
    pub asset_key: AssetKey,
    pub partition_key: PartitionKey,
    pub upstream_signatures: Vec<UpstreamSignature>,
}

/// Failure raised by a compute function
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Logical(String),
}

type ComputeResult = Result<MaterializationOutput, ComputeError>;
type ComputeFn = Arc<dyn Fn(ComputeContext) -> BoxFuture<'static, ComputeResult> + Send + Sync>;

enum RunState {
    Running(JoinHandle<ComputeResult>),
    Finished(PollStatus),
}

/// Executor running compute functions as tokio tasks
#[derive(Default)]
pub struct InProcessExecutor {
    functions: RwLock<HashMap<AssetKey, ComputeFn>>,
    runs: Mutex<HashMap<String, RunState>>,
}

impl InProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the compute function of an asset, replacing any previous one
    pub fn register<F, Fut>(&self, asset: impl Into<AssetKey>, f: F)
    where
        F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ComputeResult> + Send + 'static,
    {
        let f: ComputeFn = Arc::new(move |ctx| Box::pin(f(ctx)));
        self.functions.write().insert(asset.into(), f);
    }

    /// Number of runs that have not been polled to completion
    pub fn active_runs(&self) -> usize {
        self.runs
            .lock()
            .values()
            .filter(|state| matches!(state, RunState::Running(_)))
            .count()
    }
}

fn status_of(result: Result<ComputeResult, tokio::task::JoinError>) -> PollStatus {
    match result {
        Ok(Ok(output)) => PollStatus::Success(output),
        Ok(Err(ComputeError::Transient(reason))) => PollStatus::TransientFailure(reason),
        Ok(Err(ComputeError::Logical(reason))) => PollStatus::LogicalFailure(reason),
        Err(e) if e.is_cancelled() => PollStatus::LogicalFailure("run was aborted".to_string()),
        Err(e) => PollStatus::LogicalFailure(format!("compute function panicked: {e}")),
    }
}

#[async_trait]
impl ComputeExecutor for InProcessExecutor {
    fn name(&self) -> &str {
        EXECUTOR_NAME
    }

    async fn submit(&self, request: SubmitRequest) -> Result<RunHandle, ExecutorError> {
        let function = self
            .functions
            .read()
            .get(&request.asset_key)
            .cloned()
            .ok_or_else(|| {
                ExecutorError::Rejected(format!(
                    "no compute function registered for {}",
                    request.asset_key
                ))
            })?;

        let ctx = ComputeContext {
            attempt_id: request.attempt_id,
            attempt_number: request.attempt_number,
            asset_key: request.asset_key,
            partition_key: request.partition_key,
            upstream_signatures: request.upstream_signatures,
        };
        let external_id = request.attempt_id.to_string();
        debug!(run = %external_id, "Spawning in-process run of {}[{}]", ctx.asset_key, ctx.partition_key);

        let task = tokio::spawn(function(ctx));
        self.runs
            .lock()
            .insert(external_id.clone(), RunState::Running(task));

        Ok(RunHandle {
            executor: EXECUTOR_NAME.to_string(),
            external_id,
            submitted_at: Utc::now(),
        })
    }

    async fn poll(&self, handle: &RunHandle) -> Result<PollStatus, ExecutorError> {
        let finished = {
            let mut runs = self.runs.lock();
            match runs.get(&handle.external_id) {
                None => return Err(ExecutorError::UnknownHandle(handle.external_id.clone())),
                Some(RunState::Finished(status)) => return Ok(status.clone()),
                Some(RunState::Running(task)) if !task.is_finished() => {
                    return Ok(PollStatus::Pending)
                }
                Some(RunState::Running(_)) => runs.remove(&handle.external_id),
            }
        };

        let Some(RunState::Running(task)) = finished else {
            return Ok(PollStatus::Pending);
        };
        // The task is finished, so this resolves immediately.
        let status = status_of(task.await);
        self.runs
            .lock()
            .insert(handle.external_id.clone(), RunState::Finished(status.clone()));
        Ok(status)
    }

    async fn cancel(&self, handle: &RunHandle) -> Result<(), ExecutorError> {
        match self.runs.lock().remove(&handle.external_id) {
            Some(RunState::Running(task)) => {
                task.abort();
                Ok(())
            }
            Some(RunState::Finished(_)) => Ok(()),
            None => Err(ExecutorError::UnknownHandle(handle.external_id.clone())),
        }
    }
}
