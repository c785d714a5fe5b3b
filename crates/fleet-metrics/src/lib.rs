//! # fleet-metrics
//!
//! Prometheus metrics handling for the gpufleet controller.
//!
//! This crate provides:
//! - The controller metric set (scaling, nodes, utilization, spot, cost,
//!   prediction, cooldowns, reconcile health, admission outcomes)
//! - A registry wrapper that components record through
//! - An axum-served `/metrics` + `/health` endpoint

pub mod endpoint;
pub mod registry;

pub use endpoint::MetricsEndpoint;
pub use registry::ControllerMetrics;

/// Result type for metrics operations
pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("Export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
