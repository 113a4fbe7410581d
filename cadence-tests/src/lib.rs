//! Shared test utilities for Cadence crates
//!
//! This crate provides:
//! - **Fixtures**: asset graphs and a ready-to-drive engine harness
//! - **Mocks**: a scripted compute executor, a recording lifecycle subscriber
//!   and a store with injectable faults
//! - **Assertions**: store-level checks with readable failure messages
//!
//! # Example
//!
//! ```ignore
//! use cadence_tests::{fixtures, assertions};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_pipeline() {
//!     let harness = fixtures::harness(fixtures::graph::pipeline());
//!     harness
//!         .engine
//!         .handle_trigger(Trigger::manual("raw", ["2024-01-02"]))
//!         .await
//!         .unwrap();
//!     assertions::assert_success(harness.store.as_ref(), "raw", "2024-01-02").await;
//! }
//! ```

pub mod assertions;
pub mod fixtures;
pub mod mocks;

// Re-export commonly used items
pub use fixtures::{harness, harness_with, test_config, Harness};
pub use mocks::{FaultyStore, LifecycleEvent, RecordingSubscriber, ScriptedExecutor};
