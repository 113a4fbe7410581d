//! Prometheus metrics for evaluation and run coordination

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

lazy_static! {
    /// Units scheduled by evaluator passes
    ///
    /// Labels:
    /// - reason: "manual", "freshness", "schedule", "sensor", "upstream_changed", "missing"
    pub static ref EVALUATED_UNITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cadence_evaluated_units_total",
        "Total number of run units produced by evaluator passes",
        &["reason"]
    )
    .expect("cadence_evaluated_units_total metric registration");

    /// Pairs the evaluator considered and left out of a batch
    ///
    /// Labels:
    /// - reason: "in_progress", "up_to_date", "upstream_not_ready", "missing_upstream", "invalid"
    pub static ref EVALUATION_SKIPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cadence_evaluation_skipped_total",
        "Total number of pairs skipped by evaluator passes",
        &["reason"]
    )
    .expect("cadence_evaluation_skipped_total metric registration");

    /// Dispatch attempts by outcome
    ///
    /// Labels:
    /// - tier: compute tier
    /// - outcome: "submitted", "already_running", "error"
    pub static ref DISPATCH_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cadence_dispatch_total",
        "Total number of run unit dispatch attempts",
        &["tier", "outcome"]
    )
    .expect("cadence_dispatch_total metric registration");

    /// Wall-clock duration of finalized attempts
    ///
    /// Labels:
    /// - tier: compute tier
    /// - status: "success", "failed", "cancelled"
    pub static ref RUN_DURATION: HistogramVec = register_histogram_vec!(
        "cadence_run_duration_seconds",
        "Duration of materialization attempts from claim to finalize",
        &["tier", "status"],
        vec![0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0, 43200.0, 86400.0]
    )
    .expect("cadence_run_duration_seconds metric registration");

    /// Transient failures that were retried
    ///
    /// Labels:
    /// - tier: compute tier
    pub static ref RETRY_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cadence_retry_total",
        "Total number of retries after transient failures",
        &["tier"]
    )
    .expect("cadence_retry_total metric registration");

    /// Check results by severity and outcome
    ///
    /// Labels:
    /// - severity: "warning", "blocking"
    /// - outcome: "passed", "failed", "errored"
    pub static ref CHECK_RESULTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cadence_check_results_total",
        "Total number of quality check evaluations",
        &["severity", "outcome"]
    )
    .expect("cadence_check_results_total metric registration");

    /// Units currently being driven by this coordinator
    pub static ref RUNS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "cadence_runs_in_flight",
        "Number of run units currently in flight"
    )
    .expect("cadence_runs_in_flight metric registration");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = EVALUATED_UNITS_TOTAL.with_label_values(&["manual"]);
        let _ = EVALUATION_SKIPPED_TOTAL.with_label_values(&["in_progress"]);
        let _ = DISPATCH_TOTAL.with_label_values(&["container", "submitted"]);
        let _ = RUN_DURATION.with_label_values(&["function", "success"]);
        let _ = RETRY_TOTAL.with_label_values(&["batch"]);
        let _ = CHECK_RESULTS_TOTAL.with_label_values(&["blocking", "failed"]);
        let _ = RUNS_IN_FLIGHT.get();
    }
}
