//! # Cadence Storage
//!
//! Materialization store for Cadence: the durable record of which
//! (asset, partition) pairs were materialized, when, with what content
//! signature and check results, plus the attempt history behind them.
//!
//! Two backends implement [`MaterializationStore`]: an in-memory store for
//! tests and single-process development, and PostgreSQL for replicated
//! deployments.

pub mod memory;
pub mod metrics;
pub mod migrations;
pub mod models;
pub mod postgres;
pub mod store;

// Re-export commonly used types
pub use memory::InMemoryMaterializationStore;
pub use models::{
    ClaimOutcome, ClaimRequest, Completion, FailureInfo, FailureKind, FinalizeOutcome,
    MaterializationRecord, MaterializationStatus, UpstreamSignature,
};
pub use postgres::{PoolConfig, PostgresMaterializationStore};
pub use store::MaterializationStore;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid transition of attempt {attempt_id} from {from} to {to}")]
    InvalidTransition {
        attempt_id: uuid::Uuid,
        from: MaterializationStatus,
        to: MaterializationStatus,
    },

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Internal error: {0}")]
    Internal(String),
}
