//! # fleet-store
//!
//! Time-series cost persistence capability for gpufleet.
//!
//! The `CostStore` trait is the controller's write-and-aggregate interface
//! to durable cost history: per-minute upserts of workload cost rows,
//! scope queries for budget reconciliation, hourly/daily series for
//! attribution, savings records, and budget state history.
//!
//! `MemoryStore` is the reference implementation: an append-only,
//! time-partitioned in-memory table with minute-bucket upsert semantics
//! and periodically refreshed aggregates. Production deployments point
//! the same trait at a hypertable-backed store.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{
    BudgetStatePoint, CostRow, CostScope, CostStore, DailyPoint, SavingsRow, SeriesPoint,
};

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Write failed: {0}")]
    Write(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Write(_))
    }
}

impl From<StoreError> for fleet_core::Error {
    fn from(e: StoreError) -> Self {
        fleet_core::Error::Store(e.to_string())
    }
}
