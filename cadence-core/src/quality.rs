//! Data quality check definitions
//!
//! Checks run after a computation succeeds and before its output is
//! considered available to downstream assets. A failing `Blocking` check
//! turns an otherwise successful materialization into a failure; a failing
//! `Warning` check is recorded but does not stop the materialization.
//!
//! Checks must be side-effect free. They inspect the metadata an executor
//! reported for the materialized partition (row counts, null counts, column
//! lists and so on); the engine never reads the data itself.

use crate::asset::AssetKey;
use crate::partition::PartitionKey;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Metadata reported by an executor for one materialization
pub type OutputMetadata = BTreeMap<String, serde_json::Value>;

/// Severity of a check failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckSeverity {
    /// Recorded, materialization still succeeds
    Warning,

    /// Materialization fails and dependents are not scheduled
    #[default]
    Blocking,
}

impl CheckSeverity {
    /// Returns true if a failure at this severity blocks the materialization
    pub fn can_block(&self) -> bool {
        matches!(self, CheckSeverity::Blocking)
    }
}

impl fmt::Display for CheckSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckSeverity::Warning => write!(f, "warning"),
            CheckSeverity::Blocking => write!(f, "blocking"),
        }
    }
}

/// Outcome of a check evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    /// Data meets the check's criteria
    Passed,

    /// Data does not meet the check's criteria
    Failed,

    /// The check itself raised an error or panicked
    Errored,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutcome::Passed => write!(f, "passed"),
            CheckOutcome::Failed => write!(f, "failed"),
            CheckOutcome::Errored => write!(f, "errored"),
        }
    }
}

/// Error raised by a check that could not reach a verdict
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    #[error("Required metadata '{0}' was not reported")]
    MissingMetadata(String),

    #[error("Metadata '{key}' has an unexpected shape: {reason}")]
    InvalidMetadata { key: String, reason: String },

    #[error("Check failed to evaluate: {0}")]
    Evaluation(String),
}

/// Inputs available to a check
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub asset_key: &'a AssetKey,
    pub partition_key: &'a PartitionKey,
    pub content_signature: &'a str,
    pub metadata: &'a OutputMetadata,
    pub evaluated_at: DateTime<Utc>,
}

impl CheckContext<'_> {
    fn require(&self, key: &str) -> Result<&serde_json::Value, CheckError> {
        self.metadata
            .get(key)
            .ok_or_else(|| CheckError::MissingMetadata(key.to_string()))
    }

    fn require_u64(&self, key: &str) -> Result<u64, CheckError> {
        self.require(key)?
            .as_u64()
            .ok_or_else(|| CheckError::InvalidMetadata {
                key: key.to_string(),
                reason: "expected a non-negative integer".to_string(),
            })
    }

    fn require_object(
        &self,
        key: &str,
    ) -> Result<&serde_json::Map<String, serde_json::Value>, CheckError> {
        self.require(key)?
            .as_object()
            .ok_or_else(|| CheckError::InvalidMetadata {
                key: key.to_string(),
                reason: "expected an object".to_string(),
            })
    }
}

/// Verdict returned by a check that ran to completion
#[derive(Debug, Clone, PartialEq)]
pub struct CheckEvaluation {
    pub passed: bool,
    pub description: Option<String>,
    pub metadata: OutputMetadata,
}

impl CheckEvaluation {
    pub fn pass() -> Self {
        Self {
            passed: true,
            description: None,
            metadata: OutputMetadata::new(),
        }
    }

    pub fn fail(description: impl Into<String>) -> Self {
        Self {
            passed: false,
            description: Some(description.into()),
            metadata: OutputMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A data quality check
pub trait AssetCheck: Send + Sync {
    /// Evaluate the check against one materialized partition
    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckEvaluation, CheckError>;
}

/// Built-in checks over executor-reported metadata
///
/// Each variant reads a well-known metadata key:
///
/// | check | metadata |
/// |---|---|
/// | `NotNull` | `null_counts`: `{column: count}` |
/// | `Unique` | `duplicate_counts`: `{column: count}` |
/// | `RowCount` | `row_count`: integer |
/// | `SchemaMatch` | `columns`: `[name, ...]` |
/// | `Freshness` | `max_timestamp`: RFC 3339 string |
/// | `AcceptedValues` | `distinct_values`: `{column: [value, ...]}` |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckType {
    /// Column(s) cannot contain null values
    NotNull { columns: Vec<String> },

    /// Column values must be unique
    Unique { columns: Vec<String> },

    /// Row count must be within bounds (inclusive)
    RowCount { min: Option<u64>, max: Option<u64> },

    /// Reported columns must match the expected list
    SchemaMatch {
        expected_columns: Vec<String>,
        allow_extra_columns: bool,
    },

    /// Newest record must be younger than the given age
    Freshness { max_age_seconds: u64 },

    /// Column values must be one of a predefined set
    AcceptedValues {
        column: String,
        values: Vec<serde_json::Value>,
    },
}

impl CheckType {
    /// Check type name for metrics and logging
    pub fn type_name(&self) -> &'static str {
        match self {
            CheckType::NotNull { .. } => "not_null",
            CheckType::Unique { .. } => "unique",
            CheckType::RowCount { .. } => "row_count",
            CheckType::SchemaMatch { .. } => "schema_match",
            CheckType::Freshness { .. } => "freshness",
            CheckType::AcceptedValues { .. } => "accepted_values",
        }
    }

    fn count_violations(
        ctx: &CheckContext<'_>,
        key: &str,
        columns: &[String],
        what: &str,
    ) -> Result<CheckEvaluation, CheckError> {
        let counts = ctx.require_object(key)?;
        let mut offending = BTreeMap::new();
        for column in columns {
            let count = counts
                .get(column)
                .ok_or_else(|| CheckError::MissingMetadata(format!("{key}.{column}")))?
                .as_u64()
                .ok_or_else(|| CheckError::InvalidMetadata {
                    key: format!("{key}.{column}"),
                    reason: "expected a non-negative integer".to_string(),
                })?;
            if count > 0 {
                offending.insert(column.clone(), count);
            }
        }

        if offending.is_empty() {
            return Ok(CheckEvaluation::pass());
        }
        let summary: Vec<String> = offending
            .iter()
            .map(|(column, count)| format!("{column} ({count})"))
            .collect();
        Ok(
            CheckEvaluation::fail(format!("{what} found in {}", summary.join(", ")))
                .with_metadata("violations", serde_json::json!(offending)),
        )
    }
}

impl AssetCheck for CheckType {
    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckEvaluation, CheckError> {
        match self {
            CheckType::NotNull { columns } => {
                Self::count_violations(ctx, "null_counts", columns, "Null values")
            }
            CheckType::Unique { columns } => {
                Self::count_violations(ctx, "duplicate_counts", columns, "Duplicate values")
            }
            CheckType::RowCount { min, max } => {
                let rows = ctx.require_u64("row_count")?;
                let evaluation = match (min, max) {
                    (Some(min), _) if rows < *min => {
                        CheckEvaluation::fail(format!("{rows} rows, expected at least {min}"))
                    }
                    (_, Some(max)) if rows > *max => {
                        CheckEvaluation::fail(format!("{rows} rows, expected at most {max}"))
                    }
                    _ => CheckEvaluation::pass(),
                };
                Ok(evaluation.with_metadata("row_count", serde_json::json!(rows)))
            }
            CheckType::SchemaMatch {
                expected_columns,
                allow_extra_columns,
            } => {
                let reported: Vec<String> = ctx
                    .require("columns")?
                    .as_array()
                    .and_then(|cols| {
                        cols.iter()
                            .map(|c| c.as_str().map(str::to_string))
                            .collect::<Option<Vec<_>>>()
                    })
                    .ok_or_else(|| CheckError::InvalidMetadata {
                        key: "columns".to_string(),
                        reason: "expected an array of column names".to_string(),
                    })?;

                let missing: Vec<&String> = expected_columns
                    .iter()
                    .filter(|c| !reported.contains(c))
                    .collect();
                let extra: Vec<&String> = reported
                    .iter()
                    .filter(|c| !expected_columns.contains(c))
                    .collect();

                if !missing.is_empty() {
                    return Ok(CheckEvaluation::fail(format!(
                        "Missing columns: {}",
                        missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                    )));
                }
                if !allow_extra_columns && !extra.is_empty() {
                    return Ok(CheckEvaluation::fail(format!(
                        "Unexpected columns: {}",
                        extra.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                    )));
                }
                Ok(CheckEvaluation::pass())
            }
            CheckType::Freshness { max_age_seconds } => {
                let raw = ctx.require("max_timestamp")?.as_str().ok_or_else(|| {
                    CheckError::InvalidMetadata {
                        key: "max_timestamp".to_string(),
                        reason: "expected an RFC 3339 string".to_string(),
                    }
                })?;
                let newest = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| CheckError::InvalidMetadata {
                        key: "max_timestamp".to_string(),
                        reason: e.to_string(),
                    })?
                    .with_timezone(&Utc);

                let age = ctx.evaluated_at - newest;
                let max_age = Duration::seconds(*max_age_seconds as i64);
                if age > max_age {
                    Ok(CheckEvaluation::fail(format!(
                        "Newest record is {}s old, limit is {}s",
                        age.num_seconds(),
                        max_age_seconds
                    )))
                } else {
                    Ok(CheckEvaluation::pass())
                }
            }
            CheckType::AcceptedValues { column, values } => {
                let distinct = ctx.require_object("distinct_values")?;
                let observed = distinct
                    .get(column)
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| CheckError::MissingMetadata(format!("distinct_values.{column}")))?;
                let rejected: Vec<&serde_json::Value> =
                    observed.iter().filter(|v| !values.contains(v)).collect();
                if rejected.is_empty() {
                    Ok(CheckEvaluation::pass())
                } else {
                    Ok(CheckEvaluation::fail(format!(
                        "{} unexpected value(s) in {column}",
                        rejected.len()
                    ))
                    .with_metadata("rejected", serde_json::json!(rejected)))
                }
            }
        }
    }
}

/// Check backed by a closure
pub struct FnCheck<F>(pub F);

impl<F> AssetCheck for FnCheck<F>
where
    F: Fn(&CheckContext<'_>) -> Result<CheckEvaluation, CheckError> + Send + Sync,
{
    fn evaluate(&self, ctx: &CheckContext<'_>) -> Result<CheckEvaluation, CheckError> {
        (self.0)(ctx)
    }
}

/// A named check registered against an asset
#[derive(Clone)]
pub struct CheckDefinition {
    pub name: String,
    pub description: Option<String>,
    pub severity: CheckSeverity,
    pub enabled: bool,
    pub check: Arc<dyn AssetCheck>,
}

impl CheckDefinition {
    /// A blocking check
    pub fn new(name: impl Into<String>, check: impl AssetCheck + 'static) -> Self {
        Self {
            name: name.into(),
            description: None,
            severity: CheckSeverity::Blocking,
            enabled: true,
            check: Arc::new(check),
        }
    }

    /// A blocking check from a closure
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CheckContext<'_>) -> Result<CheckEvaluation, CheckError> + Send + Sync + 'static,
    {
        Self::new(name, FnCheck(f))
    }

    pub fn severity(mut self, severity: CheckSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Downgrade the check to a warning
    pub fn warning(self) -> Self {
        self.severity(CheckSeverity::Warning)
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl fmt::Debug for CheckDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("severity", &self.severity)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Recorded outcome of one check against one materialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_name: String,
    pub asset_key: AssetKey,
    pub partition_key: PartitionKey,
    pub passed: bool,
    pub severity: CheckSeverity,
    pub outcome: CheckOutcome,
    pub description: Option<String>,
    pub metadata: OutputMetadata,
    pub evaluated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CheckResult {
    /// Result from a check that reached a verdict
    pub fn from_evaluation(
        definition: &CheckDefinition,
        ctx: &CheckContext<'_>,
        evaluation: CheckEvaluation,
        duration_ms: u64,
    ) -> Self {
        Self {
            check_name: definition.name.clone(),
            asset_key: ctx.asset_key.clone(),
            partition_key: ctx.partition_key.clone(),
            passed: evaluation.passed,
            severity: definition.severity,
            outcome: if evaluation.passed {
                CheckOutcome::Passed
            } else {
                CheckOutcome::Failed
            },
            description: evaluation.description,
            metadata: evaluation.metadata,
            evaluated_at: ctx.evaluated_at,
            duration_ms,
        }
    }

    /// Result from a check that errored
    ///
    /// Errored checks always count as blocking failures regardless of the
    /// declared severity.
    pub fn errored(
        definition: &CheckDefinition,
        ctx: &CheckContext<'_>,
        reason: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            check_name: definition.name.clone(),
            asset_key: ctx.asset_key.clone(),
            partition_key: ctx.partition_key.clone(),
            passed: false,
            severity: CheckSeverity::Blocking,
            outcome: CheckOutcome::Errored,
            description: Some(reason.into()),
            metadata: OutputMetadata::new(),
            evaluated_at: ctx.evaluated_at,
            duration_ms,
        }
    }

    /// Returns true if this result prevents the materialization from succeeding
    pub fn is_blocking_failure(&self) -> bool {
        !self.passed && self.severity.can_block()
    }
}
