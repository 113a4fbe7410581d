//! Materialization store abstraction
//!
//! The store is the only state shared between evaluator and coordinator
//! replicas. Its `claim` operation is an atomic conditional write and is the
//! sole synchronization primitive of the engine: two replicas can never both
//! hold an in-progress attempt for the same (asset, partition) pair.
//!
//! ## Layout
//!
//! - attempts keyed by attempt id, each carrying its (asset, partition)
//! - a current-attempt pointer per (asset, partition)
//! - range scans by asset key for freshness evaluation
//! - named sets of dynamic partition keys

use crate::models::{
    ClaimOutcome, ClaimRequest, Completion, FailureInfo, FinalizeOutcome, MaterializationRecord,
};
use crate::Result;
use async_trait::async_trait;
use cadence_core::{AssetKey, DynamicPartitionsSnapshot, PartitionKey, RunHandle};
use uuid::Uuid;

/// Durable record of materialization attempts
#[async_trait]
pub trait MaterializationStore: Send + Sync {
    // --- Claims and lifecycle ---

    /// Atomically create an in-progress attempt and point the pair at it
    ///
    /// Succeeds only if [`ClaimRequest::is_allowed`] holds against the pair's
    /// current attempt at write time. A refused claim is a
    /// [`ClaimOutcome::Conflict`], not an error.
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome>;

    /// Atomically fail an in-progress attempt as transient and start the
    /// next attempt of the same pair
    ///
    /// Returns a conflict if `attempt_id` is no longer the pair's current
    /// in-progress attempt (e.g. it was cancelled meanwhile).
    async fn retry_attempt(&self, attempt_id: Uuid, failure: FailureInfo) -> Result<ClaimOutcome>;

    /// Apply a terminal result to an in-progress attempt
    ///
    /// Completions for attempts that are no longer in progress are
    /// discarded and reported as [`FinalizeOutcome::NotInProgress`].
    async fn finalize(&self, attempt_id: Uuid, completion: Completion) -> Result<FinalizeOutcome>;

    /// Cancel the pair's in-progress attempt, releasing the claim
    ///
    /// Returns the cancelled attempt, or `None` if nothing was in progress.
    async fn cancel(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>>;

    /// Remember the executor handle of an in-progress attempt
    async fn record_handle(&self, attempt_id: Uuid, handle: RunHandle) -> Result<()>;

    // --- Queries ---

    /// Current attempt of a pair
    async fn current(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>>;

    /// One attempt by id
    async fn attempt(&self, attempt_id: Uuid) -> Result<Option<MaterializationRecord>>;

    /// All attempts of a pair, oldest first
    async fn history(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Vec<MaterializationRecord>>;

    /// Current attempts of every partition of an asset, ordered by partition
    async fn scan_asset(&self, asset: &AssetKey) -> Result<Vec<MaterializationRecord>>;

    /// Most recent successful attempt of a pair
    async fn last_success(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        let history = self.history(asset, partition).await?;
        Ok(history.into_iter().rev().find(|r| r.is_success()))
    }

    // --- Administration ---

    /// Delete all attempts of an asset, or of the given partitions only
    ///
    /// Pairs with an attempt in progress are left alone. Idempotent: wiping
    /// again deletes nothing. Returns the number of pairs wiped.
    async fn wipe(&self, asset: &AssetKey, partitions: Option<&[PartitionKey]>) -> Result<u64>;

    /// Register keys in a dynamic partition set, returning the keys that
    /// were not already present
    async fn add_dynamic_partitions(&self, name: &str, keys: &[String]) -> Result<Vec<String>>;

    /// Remove one key from a dynamic partition set
    async fn delete_dynamic_partition(&self, name: &str, key: &str) -> Result<bool>;

    /// All dynamic partition sets as of now
    async fn dynamic_partitions(&self) -> Result<DynamicPartitionsSnapshot>;
}
