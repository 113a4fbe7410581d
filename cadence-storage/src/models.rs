//! Materialization records and claim semantics
//!
//! Every attempt to materialize an (asset, partition) pair is stored as its
//! own record keyed by attempt id. A separate "current" pointer per pair
//! names the attempt that currently speaks for the pair; older attempts stay
//! in history.
//!
//! The rules for when a new attempt may take over the pointer live here so
//! that every store backend enforces exactly the same conditions.

use cadence_core::{AssetKey, CheckResult, ComputeTier, OutputMetadata, PartitionKey, RunHandle, RunReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Status of one materialization attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationStatus {
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl MaterializationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterializationStatus::InProgress => "in_progress",
            MaterializationStatus::Success => "success",
            MaterializationStatus::Failed => "failed",
            MaterializationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MaterializationStatus::InProgress)
    }

    /// Only `InProgress -> terminal` transitions exist
    pub fn can_transition_to(&self, next: MaterializationStatus) -> bool {
        matches!(self, MaterializationStatus::InProgress) && next.is_terminal()
    }
}

impl fmt::Display for MaterializationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MaterializationStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(MaterializationStatus::InProgress),
            "success" => Ok(MaterializationStatus::Success),
            "failed" => Ok(MaterializationStatus::Failed),
            "cancelled" => Ok(MaterializationStatus::Cancelled),
            other => Err(crate::Error::ValidationError(format!(
                "Invalid materialization status: {other}"
            ))),
        }
    }
}

/// Distinguishes why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Infrastructure error or timeout; eligible for retry
    Transient,

    /// The asset's own computation raised an error
    Logical,

    /// The computation succeeded but a blocking check failed or errored
    QualityGateBlocking,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Logical => "logical",
            FailureKind::QualityGateBlocking => "quality_gate_blocking",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "logical" => Ok(FailureKind::Logical),
            "quality_gate_blocking" => Ok(FailureKind::QualityGateBlocking),
            other => Err(crate::Error::ValidationError(format!(
                "Invalid failure kind: {other}"
            ))),
        }
    }
}

/// Reason attached to every failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub reason: String,
}

impl FailureInfo {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn logical(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Logical,
            reason: reason.into(),
        }
    }

    pub fn quality_gate(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::QualityGateBlocking,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Content signature of an upstream pair as read by an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSignature {
    pub asset_key: AssetKey,
    pub partition_key: PartitionKey,
    pub attempt_id: Uuid,
    pub content_signature: String,
}

/// One materialization attempt of an (asset, partition) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializationRecord {
    pub attempt_id: Uuid,

    /// Batch that scheduled the attempt
    pub run_id: Uuid,

    pub asset_key: AssetKey,
    pub partition_key: PartitionKey,

    /// 1 for a fresh claim, incremented by each transient retry
    pub attempt_number: u32,

    /// Coordinator instance that claimed the attempt
    pub owner: String,

    pub reason: RunReason,
    pub source_version: Option<String>,
    pub status: MaterializationStatus,
    pub compute_tier: ComputeTier,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub content_signature: Option<String>,
    pub upstream_signatures: Vec<UpstreamSignature>,
    pub check_results: Vec<CheckResult>,
    pub output_metadata: OutputMetadata,
    pub failure: Option<FailureInfo>,
    pub executor_handle: Option<RunHandle>,
}

impl MaterializationRecord {
    pub fn is_success(&self) -> bool {
        self.status == MaterializationStatus::Success
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == MaterializationStatus::InProgress
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Signature of the upstream pair this attempt read, if recorded
    pub fn upstream_signature(&self, asset: &AssetKey, partition: &PartitionKey) -> Option<&str> {
        self.upstream_signatures
            .iter()
            .find(|s| &s.asset_key == asset && &s.partition_key == partition)
            .map(|s| s.content_signature.as_str())
    }

    /// Apply a completion to an in-progress record
    pub(crate) fn complete(&mut self, completion: Completion, now: DateTime<Utc>) {
        self.status = completion.status;
        self.completed_at = Some(now);
        self.content_signature = completion.content_signature;
        self.check_results = completion.check_results;
        self.output_metadata = completion.output_metadata;
        self.failure = completion.failure;
    }

    /// Next attempt of the same pair after a transient failure
    pub(crate) fn next_attempt(&self, now: DateTime<Utc>) -> MaterializationRecord {
        MaterializationRecord {
            attempt_id: Uuid::new_v4(),
            attempt_number: self.attempt_number + 1,
            status: MaterializationStatus::InProgress,
            started_at: now,
            completed_at: None,
            content_signature: None,
            check_results: Vec::new(),
            output_metadata: OutputMetadata::new(),
            failure: None,
            executor_handle: None,
            ..self.clone()
        }
    }
}

/// Request to claim an (asset, partition) pair for a new attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    pub run_id: Uuid,
    pub asset_key: AssetKey,
    pub partition_key: PartitionKey,
    pub reason: RunReason,

    /// Attempt the caller believes is current (`None` for a never-run pair)
    pub expected_current: Option<Uuid>,

    pub owner: String,
    pub compute_tier: ComputeTier,
    pub upstream_signatures: Vec<UpstreamSignature>,
}

impl ClaimRequest {
    /// Whether this request may take the pointer from `current`
    ///
    /// The pointer must still name the attempt the caller observed, nothing
    /// may be in progress, and a successful attempt is only replaced when
    /// the request's reason supersedes it.
    pub fn is_allowed(&self, current: Option<&MaterializationRecord>) -> bool {
        if current.map(|r| r.attempt_id) != self.expected_current {
            return false;
        }
        match current {
            None => true,
            Some(record) => match record.status {
                MaterializationStatus::InProgress => false,
                MaterializationStatus::Failed | MaterializationStatus::Cancelled => true,
                MaterializationStatus::Success => self.supersedes(record),
            },
        }
    }

    /// Whether the request's reason justifies replacing a success
    pub fn supersedes(&self, success: &MaterializationRecord) -> bool {
        match &self.reason {
            RunReason::Missing => false,
            reason => match reason.source_version() {
                Some(version) => success.source_version.as_deref() != Some(version.as_str()),
                None => true,
            },
        }
    }

    /// Build the record written on a successful claim
    pub fn into_record(self, now: DateTime<Utc>) -> MaterializationRecord {
        let source_version = self.reason.source_version();
        MaterializationRecord {
            attempt_id: Uuid::new_v4(),
            run_id: self.run_id,
            asset_key: self.asset_key,
            partition_key: self.partition_key,
            attempt_number: 1,
            owner: self.owner,
            reason: self.reason,
            source_version,
            status: MaterializationStatus::InProgress,
            compute_tier: self.compute_tier,
            started_at: now,
            completed_at: None,
            content_signature: None,
            upstream_signatures: self.upstream_signatures,
            check_results: Vec::new(),
            output_metadata: OutputMetadata::new(),
            failure: None,
            executor_handle: None,
        }
    }
}

/// Result of a claim
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The new in-progress attempt now owns the pair
    Claimed(MaterializationRecord),

    /// Another attempt owns the pair or the caller's view was stale
    Conflict {
        current: Option<Box<MaterializationRecord>>,
    },
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Terminal result applied to an in-progress attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: MaterializationStatus,
    pub content_signature: Option<String>,
    pub check_results: Vec<CheckResult>,
    pub output_metadata: OutputMetadata,
    pub failure: Option<FailureInfo>,
}

impl Completion {
    pub fn success(
        content_signature: impl Into<String>,
        output_metadata: OutputMetadata,
        check_results: Vec<CheckResult>,
    ) -> Self {
        Self {
            status: MaterializationStatus::Success,
            content_signature: Some(content_signature.into()),
            check_results,
            output_metadata,
            failure: None,
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            status: MaterializationStatus::Failed,
            content_signature: None,
            check_results: Vec::new(),
            output_metadata: OutputMetadata::new(),
            failure: Some(failure),
        }
    }

    /// A computation that succeeded but was rejected by the quality gate
    pub fn blocked(
        content_signature: impl Into<String>,
        output_metadata: OutputMetadata,
        check_results: Vec<CheckResult>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            status: MaterializationStatus::Failed,
            content_signature: Some(content_signature.into()),
            check_results,
            output_metadata,
            failure: Some(FailureInfo::quality_gate(reason)),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: MaterializationStatus::Cancelled,
            content_signature: None,
            check_results: Vec::new(),
            output_metadata: OutputMetadata::new(),
            failure: None,
        }
    }
}

/// Result of finalizing an attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Finalized(MaterializationRecord),

    /// The attempt was no longer in progress (cancelled or already final);
    /// the completion was discarded
    NotInProgress(MaterializationRecord),
}
