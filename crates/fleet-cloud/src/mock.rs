//! Mock cloud provider for testing
//!
//! Records every capacity call and serves scripted reclamation notices so
//! tests can drive the interruption orchestrator deterministically.

use crate::{CloudError, CloudProvider, NodePoolInfo, ReclamationNotice, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::policy::NodePoolSpec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A recorded capacity-control call
#[derive(Debug, Clone, PartialEq)]
pub enum CloudCall {
    ScaleUp { pool: String, count: u32 },
    ScaleDown { node: String },
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<CloudCall>,
    reclamations: HashMap<String, DateTime<Utc>>,
    pool_sizes: HashMap<String, u32>,
    fail_scale_up: bool,
    fail_scale_down: bool,
}

/// Scriptable in-memory cloud provider
#[derive(Debug, Clone, Default)]
pub struct MockCloudProvider {
    state: Arc<RwLock<MockState>>,
}

impl MockCloudProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a reclamation notice for a node
    pub async fn set_reclamation(&self, node: impl Into<String>, deadline: DateTime<Utc>) {
        self.state
            .write()
            .await
            .reclamations
            .insert(node.into(), deadline);
    }

    /// Clear a scripted reclamation notice
    pub async fn clear_reclamation(&self, node: &str) {
        self.state.write().await.reclamations.remove(node);
    }

    /// Make subsequent scale calls fail, to exercise error paths
    pub async fn fail_scaling(&self, up: bool, down: bool) {
        let mut state = self.state.write().await;
        state.fail_scale_up = up;
        state.fail_scale_down = down;
    }

    /// All recorded capacity calls in order
    pub async fn calls(&self) -> Vec<CloudCall> {
        self.state.read().await.calls.clone()
    }

    /// Recorded scale-up total for a pool
    pub async fn pool_size(&self, pool: &str) -> u32 {
        self.state
            .read()
            .await
            .pool_sizes
            .get(pool)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    async fn scale_up(&self, pool: &NodePoolSpec, count: u32) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_scale_up {
            return Err(CloudError::Api("scripted scale-up failure".to_string()));
        }
        debug!(pool = %pool.name, count, "mock scale up");
        state.calls.push(CloudCall::ScaleUp {
            pool: pool.name.clone(),
            count,
        });
        *state.pool_sizes.entry(pool.name.clone()).or_insert(0) += count;
        Ok(())
    }

    async fn scale_down(&self, node_name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_scale_down {
            return Err(CloudError::Api("scripted scale-down failure".to_string()));
        }
        debug!(node = %node_name, "mock scale down");
        state.calls.push(CloudCall::ScaleDown {
            node: node_name.to_string(),
        });
        Ok(())
    }

    async fn reclamation_notice(&self, node_name: &str) -> Result<Option<ReclamationNotice>> {
        Ok(self
            .state
            .read()
            .await
            .reclamations
            .get(node_name)
            .map(|deadline| ReclamationNotice {
                deadline: *deadline,
            }))
    }

    async fn spot_price(&self, _instance_type: &str) -> Result<f64> {
        Ok(1.05)
    }

    async fn on_demand_price(&self, _instance_type: &str) -> Result<f64> {
        Ok(3.00)
    }

    async fn recommended_spot_instance_types(&self) -> Result<Vec<String>> {
        Ok(vec![
            "mock-gpu-small".to_string(),
            "mock-gpu-large".to_string(),
        ])
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        Ok(vec!["mock-zone-a".to_string(), "mock-zone-b".to_string()])
    }

    async fn pool_info(&self, pool_name: &str) -> Result<NodePoolInfo> {
        Ok(NodePoolInfo {
            name: pool_name.to_string(),
            current_size: self.pool_size(pool_name).await,
            min_size: 0,
            max_size: 100,
            instance_type: "mock-gpu-small".to_string(),
            capacity_class: "spot".to_string(),
            available_gpus: 8,
            hourly_cost: 1.05,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let provider = MockCloudProvider::new();
        let pool = NodePoolSpec {
            name: "spot-pool".into(),
            ..Default::default()
        };

        provider.scale_up(&pool, 2).await.unwrap();
        provider.scale_down("node-1").await.unwrap();

        let calls = provider.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            CloudCall::ScaleUp {
                pool: "spot-pool".into(),
                count: 2
            }
        );
        assert_eq!(provider.pool_size("spot-pool").await, 2);
    }

    #[tokio::test]
    async fn test_scripted_reclamation() {
        let provider = MockCloudProvider::new();
        assert!(provider
            .reclamation_notice("node-1")
            .await
            .unwrap()
            .is_none());

        let deadline = Utc::now() + chrono::Duration::seconds(120);
        provider.set_reclamation("node-1", deadline).await;

        let notice = provider.reclamation_notice("node-1").await.unwrap();
        assert_eq!(notice.unwrap().deadline, deadline);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let provider = MockCloudProvider::new();
        provider.fail_scaling(true, false).await;

        let pool = NodePoolSpec::default();
        assert!(provider.scale_up(&pool, 1).await.is_err());
        assert!(provider.scale_down("n").await.is_ok());
    }
}
