//! In-memory materialization store
//!
//! [`InMemoryMaterializationStore`] keeps every attempt in process memory
//! behind a single lock, so each operation is trivially atomic. It is meant
//! for tests and single-process development:
//!
//! - **No durability**: state is lost when the process exits
//! - **Single process only**: replicas in other processes cannot share it

use crate::metrics::{CLAIM_TOTAL, FINALIZE_TOTAL, STORE_OPERATION_DURATION};
use crate::models::{
    ClaimOutcome, ClaimRequest, Completion, FailureInfo, FinalizeOutcome, MaterializationRecord,
};
use crate::store::MaterializationStore;
use crate::{Error, Result};
use async_trait::async_trait;
use cadence_core::{AssetKey, DynamicPartitionsSnapshot, PartitionKey, RunHandle};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

const BACKEND: &str = "memory";

type PairKey = (AssetKey, PartitionKey);

#[derive(Debug, Default)]
struct Inner {
    attempts: HashMap<Uuid, MaterializationRecord>,
    /// Attempt ids per pair, oldest first
    history: BTreeMap<PairKey, Vec<Uuid>>,
    current: BTreeMap<PairKey, Uuid>,
    /// Dynamic partition keys per set, in registration order
    dynamic: BTreeMap<String, Vec<String>>,
}

impl Inner {
    fn current_record(&self, pair: &PairKey) -> Option<&MaterializationRecord> {
        self.current.get(pair).and_then(|id| self.attempts.get(id))
    }

    fn insert_attempt(&mut self, record: MaterializationRecord) {
        let pair = (record.asset_key.clone(), record.partition_key.clone());
        self.history.entry(pair.clone()).or_default().push(record.attempt_id);
        self.current.insert(pair, record.attempt_id);
        self.attempts.insert(record.attempt_id, record);
    }

    fn conflict(&self, pair: &PairKey) -> ClaimOutcome {
        ClaimOutcome::Conflict {
            current: self.current_record(pair).cloned().map(Box::new),
        }
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::LockPoisoned
}

/// In-memory store for tests and local development
#[derive(Debug, Default)]
pub struct InMemoryMaterializationStore {
    inner: RwLock<Inner>,
}

impl InMemoryMaterializationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(poison_err)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(poison_err)
    }

    /// Number of attempts stored across all pairs
    pub fn attempt_count(&self) -> Result<usize> {
        Ok(self.read()?.attempts.len())
    }

    /// Overwrite an attempt, bypassing claim rules
    ///
    /// Test helper for seeding a store with existing materializations.
    pub fn seed(&self, record: MaterializationRecord) -> Result<()> {
        self.write()?.insert_attempt(record);
        Ok(())
    }
}

#[async_trait]
impl MaterializationStore for InMemoryMaterializationStore {
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome> {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "claim"])
            .start_timer();
        let pair = (request.asset_key.clone(), request.partition_key.clone());

        let mut inner = self.write()?;
        if !request.is_allowed(inner.current_record(&pair)) {
            CLAIM_TOTAL.with_label_values(&[BACKEND, "conflict"]).inc();
            return Ok(inner.conflict(&pair));
        }

        let record = request.into_record(Utc::now());
        inner.insert_attempt(record.clone());
        CLAIM_TOTAL.with_label_values(&[BACKEND, "claimed"]).inc();
        debug!(attempt_id = %record.attempt_id, "Claimed {}[{}]", pair.0, pair.1);
        Ok(ClaimOutcome::Claimed(record))
    }

    async fn retry_attempt(&self, attempt_id: Uuid, failure: FailureInfo) -> Result<ClaimOutcome> {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "retry_attempt"])
            .start_timer();
        let mut inner = self.write()?;

        let Some(previous) = inner.attempts.get(&attempt_id).cloned() else {
            return Err(Error::NotFound(format!("attempt {attempt_id}")));
        };
        let pair = (previous.asset_key.clone(), previous.partition_key.clone());
        if inner.current.get(&pair) != Some(&attempt_id) || !previous.is_in_progress() {
            return Ok(inner.conflict(&pair));
        }

        let now = Utc::now();
        let next = previous.next_attempt(now);
        if let Some(record) = inner.attempts.get_mut(&attempt_id) {
            record.complete(Completion::failed(failure), now);
        }
        inner.insert_attempt(next.clone());
        Ok(ClaimOutcome::Claimed(next))
    }

    async fn finalize(&self, attempt_id: Uuid, completion: Completion) -> Result<FinalizeOutcome> {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "finalize"])
            .start_timer();
        let mut inner = self.write()?;

        let record = inner
            .attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| Error::NotFound(format!("attempt {attempt_id}")))?;

        if !record.is_in_progress() {
            FINALIZE_TOTAL.with_label_values(&[BACKEND, "discarded"]).inc();
            return Ok(FinalizeOutcome::NotInProgress(record.clone()));
        }
        if !record.status.can_transition_to(completion.status) {
            return Err(Error::InvalidTransition {
                attempt_id,
                from: record.status,
                to: completion.status,
            });
        }

        record.complete(completion, Utc::now());
        FINALIZE_TOTAL
            .with_label_values(&[BACKEND, record.status.as_str()])
            .inc();
        Ok(FinalizeOutcome::Finalized(record.clone()))
    }

    async fn cancel(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "cancel"])
            .start_timer();
        let mut inner = self.write()?;
        let pair = (asset.clone(), partition.clone());

        let Some(id) = inner.current.get(&pair).copied() else {
            return Ok(None);
        };
        match inner.attempts.get_mut(&id) {
            Some(record) if record.is_in_progress() => {
                record.complete(Completion::cancelled(), Utc::now());
                FINALIZE_TOTAL.with_label_values(&[BACKEND, "cancelled"]).inc();
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_handle(&self, attempt_id: Uuid, handle: RunHandle) -> Result<()> {
        let mut inner = self.write()?;
        let record = inner
            .attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| Error::NotFound(format!("attempt {attempt_id}")))?;
        record.executor_handle = Some(handle);
        Ok(())
    }

    async fn current(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        let inner = self.read()?;
        Ok(inner
            .current_record(&(asset.clone(), partition.clone()))
            .cloned())
    }

    async fn attempt(&self, attempt_id: Uuid) -> Result<Option<MaterializationRecord>> {
        Ok(self.read()?.attempts.get(&attempt_id).cloned())
    }

    async fn history(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Vec<MaterializationRecord>> {
        let inner = self.read()?;
        Ok(inner
            .history
            .get(&(asset.clone(), partition.clone()))
            .into_iter()
            .flatten()
            .filter_map(|id| inner.attempts.get(id).cloned())
            .collect())
    }

    async fn scan_asset(&self, asset: &AssetKey) -> Result<Vec<MaterializationRecord>> {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "scan_asset"])
            .start_timer();
        let inner = self.read()?;
        Ok(inner
            .current
            .range((asset.clone(), PartitionKey::Unpartitioned)..)
            .take_while(|((a, _), _)| a == asset)
            .filter_map(|(_, id)| inner.attempts.get(id).cloned())
            .collect())
    }

    async fn wipe(&self, asset: &AssetKey, partitions: Option<&[PartitionKey]>) -> Result<u64> {
        let mut inner = self.write()?;

        let pairs: Vec<PairKey> = inner
            .history
            .range((asset.clone(), PartitionKey::Unpartitioned)..)
            .take_while(|((a, _), _)| a == asset)
            .map(|(pair, _)| pair.clone())
            .filter(|(_, p)| partitions.map_or(true, |only| only.contains(p)))
            .collect();

        let mut wiped = 0;
        for pair in pairs {
            if inner.current_record(&pair).map_or(false, |r| r.is_in_progress()) {
                debug!("Skipping wipe of in-progress {}[{}]", pair.0, pair.1);
                continue;
            }
            inner.current.remove(&pair);
            if let Some(ids) = inner.history.remove(&pair) {
                for id in ids {
                    inner.attempts.remove(&id);
                }
            }
            wiped += 1;
        }
        Ok(wiped)
    }

    async fn add_dynamic_partitions(&self, name: &str, keys: &[String]) -> Result<Vec<String>> {
        for key in keys {
            cadence_core::partition::validate_key(key)
                .map_err(|e| Error::ValidationError(e.to_string()))?;
        }
        let mut inner = self.write()?;
        let set = inner.dynamic.entry(name.to_string()).or_default();
        let mut added = Vec::new();
        for key in keys {
            if !set.contains(key) {
                set.push(key.clone());
                added.push(key.clone());
            }
        }
        Ok(added)
    }

    async fn delete_dynamic_partition(&self, name: &str, key: &str) -> Result<bool> {
        let mut inner = self.write()?;
        let Some(set) = inner.dynamic.get_mut(name) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|k| k != key);
        Ok(set.len() != before)
    }

    async fn dynamic_partitions(&self) -> Result<DynamicPartitionsSnapshot> {
        let inner = self.read()?;
        let mut snapshot = DynamicPartitionsSnapshot::new();
        for (name, keys) in &inner.dynamic {
            snapshot.extend(name, keys.iter().cloned());
        }
        Ok(snapshot)
    }
}
