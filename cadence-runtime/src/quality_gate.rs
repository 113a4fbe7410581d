//! Quality gate
//!
//! Runs the checks registered against an asset on a freshly materialized
//! partition and decides whether the materialization may become available
//! to downstream consumers.
//!
//! # Outcomes
//!
//! - All blocking checks pass: the attempt finalizes as `Success`; failed
//!   warning checks are kept on the record for observability
//! - A blocking check fails: the attempt finalizes as `Failed` with kind
//!   `QualityGateBlocking`, even though the computation itself succeeded
//! - A check errors or panics: recorded with outcome `Errored` and treated
//!   as a blocking failure

use crate::executor::MaterializationOutput;
use crate::metrics::CHECK_RESULTS_TOTAL;
use cadence_core::{AssetKey, CheckContext, CheckDefinition, CheckResult, PartitionKey};
use chrono::Utc;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Aggregated results of one gate evaluation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GateVerdict {
    pub results: Vec<CheckResult>,
}

impl GateVerdict {
    /// Returns true if no blocking check failed or errored
    pub fn passed(&self) -> bool {
        !self.results.iter().any(CheckResult::is_blocking_failure)
    }

    pub fn blocking_failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.is_blocking_failure())
    }

    /// Human-readable reason recorded on a blocked attempt
    pub fn failure_reason(&self) -> Option<String> {
        let failures: Vec<String> = self
            .blocking_failures()
            .map(|r| match &r.description {
                Some(description) => format!("{} ({}): {}", r.check_name, r.outcome, description),
                None => format!("{} ({})", r.check_name, r.outcome),
            })
            .collect();
        (!failures.is_empty()).then(|| format!("blocking checks failed: {}", failures.join("; ")))
    }
}

/// Evaluates asset checks against materialized output
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityGate;

impl QualityGate {
    pub fn new() -> Self {
        Self
    }

    /// Run every enabled check against one materialized partition
    ///
    /// Checks are side-effect free and independent; a check that returns an
    /// error or panics does not prevent the remaining checks from running.
    #[instrument(
        name = "quality_gate.evaluate",
        skip(self, checks, output),
        fields(asset = %asset, partition = %partition, checks = checks.len())
    )]
    pub fn evaluate(
        &self,
        asset: &AssetKey,
        partition: &PartitionKey,
        checks: &[CheckDefinition],
        output: &MaterializationOutput,
    ) -> GateVerdict {
        let ctx = CheckContext {
            asset_key: asset,
            partition_key: partition,
            content_signature: &output.content_signature,
            metadata: &output.metadata,
            evaluated_at: Utc::now(),
        };

        let results: Vec<CheckResult> = checks
            .iter()
            .filter(|check| check.enabled)
            .map(|check| run_check(check, &ctx))
            .collect();

        let verdict = GateVerdict { results };
        if verdict.passed() {
            debug!("Quality gate passed");
        } else {
            warn!(
                reason = verdict.failure_reason().unwrap_or_default(),
                "Quality gate blocked materialization"
            );
        }
        verdict
    }
}

fn run_check(check: &CheckDefinition, ctx: &CheckContext<'_>) -> CheckResult {
    let start = Instant::now();
    let evaluation = catch_unwind(AssertUnwindSafe(|| check.check.evaluate(ctx)));
    let duration_ms = start.elapsed().as_millis() as u64;

    let result = match evaluation {
        Ok(Ok(evaluation)) => CheckResult::from_evaluation(check, ctx, evaluation, duration_ms),
        Ok(Err(e)) => CheckResult::errored(check, ctx, format!("check errored: {e}"), duration_ms),
        Err(_) => CheckResult::errored(check, ctx, "check errored: panicked", duration_ms),
    };

    let severity = result.severity.to_string();
    let outcome = result.outcome.to_string();
    CHECK_RESULTS_TOTAL
        .with_label_values(&[severity.as_str(), outcome.as_str()])
        .inc();
    if !result.passed {
        debug!(check = %check.name, outcome = %result.outcome, "Check did not pass");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{CheckError, CheckEvaluation, CheckOutcome, CheckSeverity, CheckType};
    use serde_json::json;

    fn output() -> MaterializationOutput {
        MaterializationOutput::new("sig-1")
            .with_metadata("row_count", json!(10))
            .with_metadata("null_counts", json!({"id": 0, "email": 3}))
    }

    fn evaluate(checks: &[CheckDefinition]) -> GateVerdict {
        QualityGate::new().evaluate(
            &AssetKey::new("clean"),
            &PartitionKey::single("2024-01-02"),
            checks,
            &output(),
        )
    }

    #[test]
    fn test_all_checks_pass() {
        let verdict = evaluate(&[
            CheckDefinition::new("has_rows", CheckType::RowCount { min: Some(1), max: None }),
            CheckDefinition::new("id_not_null", CheckType::NotNull { columns: vec!["id".into()] }),
        ]);
        assert!(verdict.passed());
        assert_eq!(verdict.results.len(), 2);
        assert!(verdict.failure_reason().is_none());
    }

    #[test]
    fn test_blocking_failure_blocks() {
        let verdict = evaluate(&[CheckDefinition::new(
            "non-null",
            CheckType::NotNull { columns: vec!["email".into()] },
        )]);
        assert!(!verdict.passed());
        let reason = verdict.failure_reason().unwrap();
        assert!(reason.contains("non-null"), "{reason}");
    }

    #[test]
    fn test_warning_failure_does_not_block() {
        let verdict = evaluate(&[CheckDefinition::new(
            "email_not_null",
            CheckType::NotNull { columns: vec!["email".into()] },
        )
        .warning()]);
        assert!(verdict.passed());
        assert!(!verdict.results[0].passed);
        assert_eq!(verdict.results[0].severity, CheckSeverity::Warning);
    }

    #[test]
    fn test_errored_and_panicking_checks_block() {
        let verdict = evaluate(&[
            CheckDefinition::from_fn("needs_columns", |_ctx| {
                Err(CheckError::MissingMetadata("columns".into()))
            })
            .warning(),
            CheckDefinition::from_fn("explodes", |_ctx| -> Result<CheckEvaluation, CheckError> {
                panic!("boom")
            }),
        ]);
        assert!(!verdict.passed());
        assert_eq!(verdict.blocking_failures().count(), 2);
        assert!(verdict
            .results
            .iter()
            .all(|r| r.outcome == CheckOutcome::Errored && r.severity == CheckSeverity::Blocking));
    }

    #[test]
    fn test_disabled_checks_are_skipped() {
        let verdict = evaluate(&[CheckDefinition::from_fn("never", |_ctx| {
            Ok(CheckEvaluation::fail("should not run"))
        })
        .disabled()]);
        assert!(verdict.passed());
        assert!(verdict.results.is_empty());
    }
}
