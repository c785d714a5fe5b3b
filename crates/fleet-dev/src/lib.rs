//! # fleet-dev
//!
//! Mocks and test tooling for gpufleet.
//!
//! This crate provides in-memory implementations of every capability the
//! controller depends on, so reconcilers can be exercised end to end
//! without a cluster, a cloud account, or a wall clock:
//!
//! - `MockClusterRuntime`: nodes, workloads, and declared objects with
//!   recorded evictions and events
//! - `MockMetricsReader`: programmable GPU samples and failure injection
//! - `CapturingAlerter`: records dispatched alerts instead of sending
//! - `ManualClock`: a settable clock for deterministic cooldown and
//!   accrual tests
//! - `harness`: scenario builders used by the integration tests

pub mod clock;
pub mod harness;
pub mod mock_metrics;
pub mod mock_notifier;
pub mod mock_runtime;

pub use clock::ManualClock;
pub use harness::Scenario;
pub use mock_metrics::MockMetricsReader;
pub use mock_notifier::CapturingAlerter;
pub use mock_runtime::MockClusterRuntime;
