//! # fleet-cloud
//!
//! Cloud capacity-control adapters for gpufleet.
//!
//! This crate provides the narrow `CloudProvider` capability the
//! autoscaler acts through: add nodes to a pool, remove a named node,
//! poll for spot reclamation notices, and answer pricing and placement
//! questions. Three provider implementations (AWS, GCP, Azure) are backed
//! by built-in price tables so the control plane works without live cloud
//! APIs, plus a scriptable mock for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::policy::NodePoolSpec;
use thiserror::Error;

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod mock;

pub use aws::AwsProvider;
pub use azure::AzureProvider;
pub use gcp::GcpProvider;
pub use mock::MockCloudProvider;

/// Result type for cloud operations
pub type Result<T> = std::result::Result<T, CloudError>;

/// Errors that can occur talking to a cloud provider
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Unknown node pool: {0}")]
    UnknownPool(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Price not found for instance class: {0}")]
    PriceNotFound(String),

    #[error("Capacity request rejected: {0}")]
    CapacityRejected(String),

    #[error("Provider API error: {0}")]
    Api(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl CloudError {
    /// Check if this error is retryable on the next reconcile
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Api(_) | CloudError::Timeout(_))
    }
}

impl From<CloudError> for fleet_core::Error {
    fn from(e: CloudError) -> Self {
        fleet_core::Error::Cloud(e.to_string())
    }
}

/// A pending forced reclamation of a spot node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclamationNotice {
    pub deadline: DateTime<Utc>,
}

/// Information about a provider-side node pool
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodePoolInfo {
    pub name: String,
    pub current_size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub instance_type: String,
    pub capacity_class: String,
    pub available_gpus: u32,
    pub hourly_cost: f64,
}

/// Narrow capacity-control interface to the cloud
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Add `count` nodes to a node pool
    async fn scale_up(&self, pool: &NodePoolSpec, count: u32) -> Result<()>;

    /// Remove a node from the cluster by name
    async fn scale_down(&self, node_name: &str) -> Result<()>;

    /// Check whether a spot node has a pending reclamation notice
    async fn reclamation_notice(&self, node_name: &str) -> Result<Option<ReclamationNotice>>;

    /// Current spot price per hour for an instance class
    async fn spot_price(&self, instance_type: &str) -> Result<f64>;

    /// On-demand price per hour for an instance class
    async fn on_demand_price(&self, instance_type: &str) -> Result<f64>;

    /// GPU instance classes with good spot availability, diversified
    async fn recommended_spot_instance_types(&self) -> Result<Vec<String>>;

    /// Availability zones with low spot interruption rates
    async fn availability_zones(&self) -> Result<Vec<String>>;

    /// Provider-side state of a node pool
    async fn pool_info(&self, pool_name: &str) -> Result<NodePoolInfo>;
}
