//! PostgreSQL materialization store
//!
//! Claims are serialized with row locks on `materialization_current`: the
//! current pointer of a pair is read `FOR UPDATE` before the claim rule is
//! checked, and a never-run pair is claimed with `INSERT ... ON CONFLICT DO
//! NOTHING` so that exactly one of several racing replicas creates it.

use crate::metrics::{CLAIM_TOTAL, FINALIZE_TOTAL, STORE_OPERATION_DURATION};
use crate::models::{
    ClaimOutcome, ClaimRequest, Completion, FailureInfo, FinalizeOutcome, MaterializationRecord,
    UpstreamSignature,
};
use crate::store::MaterializationStore;
use crate::{Error, Result};
use async_trait::async_trait;
use cadence_core::{
    AssetKey, CheckResult, DynamicPartitionsSnapshot, OutputMetadata, PartitionKey, RunHandle,
    RunReason,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::types::Json;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use std::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const BACKEND: &str = "postgres";

const ATTEMPT_COLUMNS: &str = r#"
    a.attempt_id, a.run_id, a.asset_key, a.partition_key, a.attempt_number, a.owner,
    a.reason, a.source_version, a.status, a.compute_tier, a.started_at, a.completed_at,
    a.content_signature, a.upstream_signatures, a.check_results, a.output_metadata,
    a.failure_kind, a.failure_reason, a.executor_handle
"#;

/// Configuration for the PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: None,
            max_lifetime_secs: None,
        }
    }
}

/// Row of `materialization_attempts`
#[derive(Debug, FromRow)]
struct AttemptRow {
    attempt_id: Uuid,
    run_id: Uuid,
    asset_key: String,
    partition_key: String,
    attempt_number: i32,
    owner: String,
    reason: Json<RunReason>,
    source_version: Option<String>,
    status: String,
    compute_tier: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    content_signature: Option<String>,
    upstream_signatures: Json<Vec<UpstreamSignature>>,
    check_results: Json<Vec<CheckResult>>,
    output_metadata: Json<OutputMetadata>,
    failure_kind: Option<String>,
    failure_reason: Option<String>,
    executor_handle: Option<Json<RunHandle>>,
}

impl TryFrom<AttemptRow> for MaterializationRecord {
    type Error = Error;

    fn try_from(row: AttemptRow) -> Result<Self> {
        let partition_key = row
            .partition_key
            .parse::<PartitionKey>()
            .map_err(|e| Error::ValidationError(e.to_string()))?;
        let attempt_number = u32::try_from(row.attempt_number).map_err(|_| {
            Error::ValidationError(format!("Invalid attempt number: {}", row.attempt_number))
        })?;
        let failure = match row.failure_kind {
            Some(kind) => Some(FailureInfo {
                kind: kind.parse()?,
                reason: row.failure_reason.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(MaterializationRecord {
            attempt_id: row.attempt_id,
            run_id: row.run_id,
            asset_key: AssetKey::new(row.asset_key),
            partition_key,
            attempt_number,
            owner: row.owner,
            reason: row.reason.0,
            source_version: row.source_version,
            status: row.status.parse()?,
            compute_tier: row.compute_tier.parse().map_err(Error::ValidationError)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            content_signature: row.content_signature,
            upstream_signatures: row.upstream_signatures.0,
            check_results: row.check_results.0,
            output_metadata: row.output_metadata.0,
            failure,
            executor_handle: row.executor_handle.map(|h| h.0),
        })
    }
}

/// PostgreSQL store backend
pub struct PostgresMaterializationStore {
    pool: PgPool,
}

impl PostgresMaterializationStore {
    /// Connect with the default pool configuration
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_config(database_url, PoolConfig::default()).await
    }

    /// Connect using a PoolConfig
    pub async fn with_pool_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        if config.min_connections == 0 {
            return Err(Error::ValidationError(
                "min_connections must be > 0".to_string(),
            ));
        }
        if config.max_connections == 0 || config.max_connections < config.min_connections {
            return Err(Error::ValidationError(
                "max_connections must be >= min_connections and > 0".to_string(),
            ));
        }

        let mut opts = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs));

        if let Some(idle) = config.idle_timeout_secs {
            opts = opts.idle_timeout(std::time::Duration::from_secs(idle));
        }
        if let Some(max_life) = config.max_lifetime_secs {
            opts = opts.max_lifetime(std::time::Duration::from_secs(max_life));
        }

        let pool = opts.connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `f` in a transaction; commits on success, rolls back on error
    async fn with_transaction<F, T>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Transaction<'_, Postgres>) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, operation])
            .start_timer();
        let start = Instant::now();
        let mut tx = self.pool.begin().await?;

        let result = match f(&mut tx).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        };

        let elapsed = start.elapsed();
        if elapsed.as_millis() > 100 {
            warn!(
                operation,
                duration_ms = elapsed.as_millis(),
                "Slow database operation detected"
            );
        }

        result
    }
}

/// Current attempt of a pair, locking its pointer row
async fn lock_current(
    tx: &mut Transaction<'_, Postgres>,
    asset: &str,
    partition: &str,
) -> Result<Option<MaterializationRecord>> {
    let row = sqlx::query_as::<_, AttemptRow>(&format!(
        r#"
        SELECT {ATTEMPT_COLUMNS}
        FROM materialization_current c
        JOIN materialization_attempts a ON a.attempt_id = c.attempt_id
        WHERE c.asset_key = $1 AND c.partition_key = $2
        FOR UPDATE OF c
        "#
    ))
    .bind(asset)
    .bind(partition)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(MaterializationRecord::try_from).transpose()
}

async fn insert_attempt(
    tx: &mut Transaction<'_, Postgres>,
    record: &MaterializationRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO materialization_attempts (
            attempt_id, run_id, asset_key, partition_key, attempt_number, owner, reason,
            source_version, status, compute_tier, started_at, completed_at, content_signature,
            upstream_signatures, check_results, output_metadata, failure_kind, failure_reason,
            executor_handle
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(record.attempt_id)
    .bind(record.run_id)
    .bind(record.asset_key.as_str())
    .bind(record.partition_key.to_string())
    .bind(record.attempt_number as i32)
    .bind(&record.owner)
    .bind(Json(&record.reason))
    .bind(&record.source_version)
    .bind(record.status.as_str())
    .bind(record.compute_tier.as_str())
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(&record.content_signature)
    .bind(Json(&record.upstream_signatures))
    .bind(Json(&record.check_results))
    .bind(Json(&record.output_metadata))
    .bind(record.failure.as_ref().map(|f| f.kind.as_str()))
    .bind(record.failure.as_ref().map(|f| f.reason.as_str()))
    .bind(record.executor_handle.as_ref().map(Json))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Persist the terminal fields of a completed record
async fn write_completion(
    tx: &mut Transaction<'_, Postgres>,
    record: &MaterializationRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE materialization_attempts
        SET status = $2,
            completed_at = $3,
            content_signature = $4,
            check_results = $5,
            output_metadata = $6,
            failure_kind = $7,
            failure_reason = $8
        WHERE attempt_id = $1
        "#,
    )
    .bind(record.attempt_id)
    .bind(record.status.as_str())
    .bind(record.completed_at)
    .bind(&record.content_signature)
    .bind(Json(&record.check_results))
    .bind(Json(&record.output_metadata))
    .bind(record.failure.as_ref().map(|f| f.kind.as_str()))
    .bind(record.failure.as_ref().map(|f| f.reason.as_str()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Move a pair's pointer from `expected` to `next`; false if it moved meanwhile
async fn swap_current(
    tx: &mut Transaction<'_, Postgres>,
    record: &MaterializationRecord,
    expected: Option<Uuid>,
) -> Result<bool> {
    let result = match expected {
        None => {
            sqlx::query(
                r#"
                INSERT INTO materialization_current (asset_key, partition_key, attempt_id, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (asset_key, partition_key) DO NOTHING
                "#,
            )
            .bind(record.asset_key.as_str())
            .bind(record.partition_key.to_string())
            .bind(record.attempt_id)
            .bind(record.started_at)
            .execute(&mut **tx)
            .await?
        }
        Some(expected) => {
            sqlx::query(
                r#"
                UPDATE materialization_current
                SET attempt_id = $3, updated_at = $4
                WHERE asset_key = $1 AND partition_key = $2 AND attempt_id = $5
                "#,
            )
            .bind(record.asset_key.as_str())
            .bind(record.partition_key.to_string())
            .bind(record.attempt_id)
            .bind(record.started_at)
            .bind(expected)
            .execute(&mut **tx)
            .await?
        }
    };
    Ok(result.rows_affected() > 0)
}

async fn fetch_attempt(
    tx: &mut Transaction<'_, Postgres>,
    attempt_id: Uuid,
    lock: bool,
) -> Result<Option<MaterializationRecord>> {
    let suffix = if lock { "FOR UPDATE" } else { "" };
    let row = sqlx::query_as::<_, AttemptRow>(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM materialization_attempts a WHERE a.attempt_id = $1 {suffix}"
    ))
    .bind(attempt_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(MaterializationRecord::try_from).transpose()
}

fn conflict(current: Option<MaterializationRecord>) -> ClaimOutcome {
    CLAIM_TOTAL.with_label_values(&[BACKEND, "conflict"]).inc();
    ClaimOutcome::Conflict {
        current: current.map(Box::new),
    }
}

#[async_trait]
impl MaterializationStore for PostgresMaterializationStore {
    #[instrument(
        skip(self, request),
        fields(
            db.system = "postgresql",
            asset = %request.asset_key,
            partition = %request.partition_key,
        )
    )]
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome> {
        self.with_transaction("claim", |tx| {
            Box::pin(async move {
                let asset = request.asset_key.as_str().to_string();
                let partition = request.partition_key.to_string();
                let current = lock_current(tx, &asset, &partition).await?;

                if !request.is_allowed(current.as_ref()) {
                    return Ok(conflict(current));
                }

                let expected = request.expected_current;
                let record = request.into_record(Utc::now());
                insert_attempt(tx, &record).await?;

                if !swap_current(tx, &record, expected).await? {
                    // Lost the race for a never-run pair.
                    sqlx::query("DELETE FROM materialization_attempts WHERE attempt_id = $1")
                        .bind(record.attempt_id)
                        .execute(&mut **tx)
                        .await?;
                    let winner = lock_current(tx, &asset, &partition).await?;
                    return Ok(conflict(winner));
                }

                CLAIM_TOTAL.with_label_values(&[BACKEND, "claimed"]).inc();
                debug!(attempt_id = %record.attempt_id, "Claimed {asset}[{partition}]");
                Ok(ClaimOutcome::Claimed(record))
            })
        })
        .await
    }

    #[instrument(skip(self, failure), fields(db.system = "postgresql"))]
    async fn retry_attempt(&self, attempt_id: Uuid, failure: FailureInfo) -> Result<ClaimOutcome> {
        self.with_transaction("retry_attempt", |tx| {
            Box::pin(async move {
                let previous = fetch_attempt(tx, attempt_id, false)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("attempt {attempt_id}")))?;
                let current = lock_current(
                    tx,
                    previous.asset_key.as_str(),
                    &previous.partition_key.to_string(),
                )
                .await?;

                let still_current = current
                    .as_ref()
                    .map_or(false, |c| c.attempt_id == attempt_id && c.is_in_progress());
                if !still_current {
                    return Ok(conflict(current));
                }

                let now = Utc::now();
                let next = previous.next_attempt(now);
                let mut failed = previous;
                failed.complete(Completion::failed(failure), now);
                write_completion(tx, &failed).await?;
                insert_attempt(tx, &next).await?;
                if !swap_current(tx, &next, Some(attempt_id)).await? {
                    return Err(Error::Internal(format!(
                        "current pointer moved while locked for attempt {attempt_id}"
                    )));
                }
                Ok(ClaimOutcome::Claimed(next))
            })
        })
        .await
    }

    #[instrument(skip(self, completion), fields(db.system = "postgresql", status = %completion.status))]
    async fn finalize(&self, attempt_id: Uuid, completion: Completion) -> Result<FinalizeOutcome> {
        self.with_transaction("finalize", |tx| {
            Box::pin(async move {
                let mut record = fetch_attempt(tx, attempt_id, true)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("attempt {attempt_id}")))?;

                if !record.is_in_progress() {
                    FINALIZE_TOTAL.with_label_values(&[BACKEND, "discarded"]).inc();
                    return Ok(FinalizeOutcome::NotInProgress(record));
                }
                if !record.status.can_transition_to(completion.status) {
                    return Err(Error::InvalidTransition {
                        attempt_id,
                        from: record.status,
                        to: completion.status,
                    });
                }

                record.complete(completion, Utc::now());
                write_completion(tx, &record).await?;
                FINALIZE_TOTAL
                    .with_label_values(&[BACKEND, record.status.as_str()])
                    .inc();
                Ok(FinalizeOutcome::Finalized(record))
            })
        })
        .await
    }

    #[instrument(skip(self), fields(db.system = "postgresql"))]
    async fn cancel(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        let asset = asset.as_str().to_string();
        let partition = partition.to_string();
        self.with_transaction("cancel", |tx| {
            Box::pin(async move {
                let Some(mut record) = lock_current(tx, &asset, &partition).await? else {
                    return Ok(None);
                };
                if !record.is_in_progress() {
                    return Ok(None);
                }
                record.complete(Completion::cancelled(), Utc::now());
                write_completion(tx, &record).await?;
                FINALIZE_TOTAL.with_label_values(&[BACKEND, "cancelled"]).inc();
                Ok(Some(record))
            })
        })
        .await
    }

    async fn record_handle(&self, attempt_id: Uuid, handle: RunHandle) -> Result<()> {
        let result = sqlx::query(
            "UPDATE materialization_attempts SET executor_handle = $2 WHERE attempt_id = $1",
        )
        .bind(attempt_id)
        .bind(Json(&handle))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("attempt {attempt_id}")));
        }
        Ok(())
    }

    async fn current(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Option<MaterializationRecord>> {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "current"])
            .start_timer();
        let row = sqlx::query_as::<_, AttemptRow>(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM materialization_current c
            JOIN materialization_attempts a ON a.attempt_id = c.attempt_id
            WHERE c.asset_key = $1 AND c.partition_key = $2
            "#
        ))
        .bind(asset.as_str())
        .bind(partition.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(MaterializationRecord::try_from).transpose()
    }

    async fn attempt(&self, attempt_id: Uuid) -> Result<Option<MaterializationRecord>> {
        let row = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM materialization_attempts a WHERE a.attempt_id = $1"
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MaterializationRecord::try_from).transpose()
    }

    async fn history(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
    ) -> Result<Vec<MaterializationRecord>> {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "history"])
            .start_timer();
        let rows = sqlx::query_as::<_, AttemptRow>(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM materialization_attempts a
            WHERE a.asset_key = $1 AND a.partition_key = $2
            ORDER BY a.started_at, a.attempt_number
            "#
        ))
        .bind(asset.as_str())
        .bind(partition.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MaterializationRecord::try_from).collect()
    }

    async fn scan_asset(&self, asset: &AssetKey) -> Result<Vec<MaterializationRecord>> {
        let _timer = STORE_OPERATION_DURATION
            .with_label_values(&[BACKEND, "scan_asset"])
            .start_timer();
        let rows = sqlx::query_as::<_, AttemptRow>(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM materialization_current c
            JOIN materialization_attempts a ON a.attempt_id = c.attempt_id
            WHERE c.asset_key = $1
            ORDER BY c.partition_key
            "#
        ))
        .bind(asset.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MaterializationRecord::try_from).collect()
    }

    #[instrument(skip(self, partitions), fields(db.system = "postgresql"))]
    async fn wipe(&self, asset: &AssetKey, partitions: Option<&[PartitionKey]>) -> Result<u64> {
        let asset = asset.as_str().to_string();
        let filter: Option<Vec<String>> =
            partitions.map(|keys| keys.iter().map(ToString::to_string).collect());

        self.with_transaction("wipe", |tx| {
            Box::pin(async move {
                let pairs: Vec<(String,)> = sqlx::query_as(
                    r#"
                    SELECT c.partition_key
                    FROM materialization_current c
                    JOIN materialization_attempts a ON a.attempt_id = c.attempt_id
                    WHERE c.asset_key = $1
                      AND ($2::text[] IS NULL OR c.partition_key = ANY($2))
                      AND a.status <> 'in_progress'
                    FOR UPDATE OF c
                    "#,
                )
                .bind(&asset)
                .bind(&filter)
                .fetch_all(&mut **tx)
                .await?;

                let keys: Vec<String> = pairs.into_iter().map(|(key,)| key).collect();
                if keys.is_empty() {
                    return Ok(0);
                }

                let wiped = sqlx::query(
                    "DELETE FROM materialization_current WHERE asset_key = $1 AND partition_key = ANY($2)",
                )
                .bind(&asset)
                .bind(&keys)
                .execute(&mut **tx)
                .await?
                .rows_affected();

                sqlx::query(
                    "DELETE FROM materialization_attempts WHERE asset_key = $1 AND partition_key = ANY($2)",
                )
                .bind(&asset)
                .bind(&keys)
                .execute(&mut **tx)
                .await?;

                Ok(wiped)
            })
        })
        .await
    }

    async fn add_dynamic_partitions(&self, name: &str, keys: &[String]) -> Result<Vec<String>> {
        for key in keys {
            cadence_core::partition::validate_key(key)
                .map_err(|e| Error::ValidationError(e.to_string()))?;
        }
        let name = name.to_string();
        let keys = keys.to_vec();

        self.with_transaction("add_dynamic_partitions", |tx| {
            Box::pin(async move {
                let mut added = Vec::new();
                for key in keys {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO dynamic_partitions (name, partition_key)
                        VALUES ($1, $2)
                        ON CONFLICT (name, partition_key) DO NOTHING
                        "#,
                    )
                    .bind(&name)
                    .bind(&key)
                    .execute(&mut **tx)
                    .await?;
                    if result.rows_affected() > 0 {
                        added.push(key);
                    }
                }
                Ok(added)
            })
        })
        .await
    }

    async fn delete_dynamic_partition(&self, name: &str, key: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM dynamic_partitions WHERE name = $1 AND partition_key = $2")
                .bind(name)
                .bind(key)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn dynamic_partitions(&self) -> Result<DynamicPartitionsSnapshot> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, partition_key FROM dynamic_partitions ORDER BY name, seq")
                .fetch_all(&self.pool)
                .await?;

        let mut snapshot = DynamicPartitionsSnapshot::new();
        for (name, key) in rows {
            snapshot.extend(&name, [key]);
        }
        Ok(snapshot)
    }
}
