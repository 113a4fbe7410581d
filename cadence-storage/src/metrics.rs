//! Prometheus metrics for materialization store operations

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    /// Duration of store operations in seconds
    ///
    /// Labels:
    /// - backend: "memory", "postgres"
    /// - operation: "claim", "retry_attempt", "finalize", "cancel", "current", "history", "scan_asset", "wipe"
    pub static ref STORE_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "cadence_store_operation_duration_seconds",
        "Duration of materialization store operations",
        &["backend", "operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("cadence_store_operation_duration_seconds metric registration");

    /// Total number of claim attempts
    ///
    /// Labels:
    /// - backend: "memory", "postgres"
    /// - outcome: "claimed", "conflict"
    pub static ref CLAIM_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cadence_claim_total",
        "Total number of materialization claim attempts",
        &["backend", "outcome"]
    )
    .expect("cadence_claim_total metric registration");

    /// Total number of finalized attempts
    ///
    /// Labels:
    /// - backend: "memory", "postgres"
    /// - status: "success", "failed", "cancelled", "discarded"
    pub static ref FINALIZE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cadence_finalize_total",
        "Total number of materialization attempts finalized",
        &["backend", "status"]
    )
    .expect("cadence_finalize_total metric registration");
}
