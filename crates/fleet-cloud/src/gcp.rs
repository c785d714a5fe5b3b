//! GCP capacity-control adapter
//!
//! Managed instance groups with preemptible VMs standing in for spot
//! capacity. Prices come from the built-in accelerator machine tables.

use crate::{CloudError, CloudProvider, NodePoolInfo, ReclamationNotice, Result};
use async_trait::async_trait;
use fleet_core::policy::NodePoolSpec;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// CloudProvider implementation for GCP managed instance groups
pub struct GcpProvider {
    region: String,
    desired_capacity: RwLock<HashMap<String, u32>>,
}

impl GcpProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            desired_capacity: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CloudProvider for GcpProvider {
    async fn scale_up(&self, pool: &NodePoolSpec, count: u32) -> Result<()> {
        let mut capacity = self.desired_capacity.write().await;
        let desired = capacity.entry(pool.name.clone()).or_insert(pool.min_size);
        let target = (*desired + count).min(pool.max_size);

        info!(
            pool = %pool.name,
            from = *desired,
            to = target,
            "GCP: resizing managed instance group"
        );

        *desired = target;
        Ok(())
    }

    async fn scale_down(&self, node_name: &str) -> Result<()> {
        info!(node = %node_name, "GCP: deleting instance from managed group");
        Ok(())
    }

    async fn reclamation_notice(&self, _node_name: &str) -> Result<Option<ReclamationNotice>> {
        // Preemption signals arrive on the node via ACPI G2 and the
        // metadata server; not observable from here.
        Ok(None)
    }

    async fn spot_price(&self, instance_type: &str) -> Result<f64> {
        preemptible_prices()
            .get(instance_type)
            .copied()
            .ok_or_else(|| CloudError::PriceNotFound(instance_type.to_string()))
    }

    async fn on_demand_price(&self, instance_type: &str) -> Result<f64> {
        on_demand_prices()
            .get(instance_type)
            .copied()
            .ok_or_else(|| CloudError::PriceNotFound(instance_type.to_string()))
    }

    async fn recommended_spot_instance_types(&self) -> Result<Vec<String>> {
        Ok(vec![
            "n1-standard-4-t4".to_string(),
            "a2-highgpu-1g".to_string(),
            "a2-highgpu-2g".to_string(),
            "g2-standard-4".to_string(),
        ])
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        Ok(vec![
            format!("{}-a", self.region),
            format!("{}-b", self.region),
            format!("{}-c", self.region),
        ])
    }

    async fn pool_info(&self, pool_name: &str) -> Result<NodePoolInfo> {
        let capacity = self.desired_capacity.read().await;
        let current = capacity.get(pool_name).copied().unwrap_or(0);
        Ok(NodePoolInfo {
            name: pool_name.to_string(),
            current_size: current,
            min_size: 0,
            max_size: 100,
            instance_type: String::new(),
            capacity_class: String::new(),
            available_gpus: 0,
            hourly_cost: 0.0,
        })
    }
}

fn on_demand_prices() -> HashMap<&'static str, f64> {
    HashMap::from([
        ("a2-highgpu-1g", 3.67),  // 1x A100
        ("a2-highgpu-2g", 7.34),  // 2x A100
        ("a2-highgpu-8g", 29.39), // 8x A100
        ("n1-standard-4-t4", 0.95),
        ("n1-standard-4-v100", 2.48),
        ("g2-standard-4", 0.85), // 1x L4
    ])
}

fn preemptible_prices() -> HashMap<&'static str, f64> {
    HashMap::from([
        ("a2-highgpu-1g", 1.10),
        ("a2-highgpu-2g", 2.20),
        ("a2-highgpu-8g", 8.82),
        ("n1-standard-4-t4", 0.29),
        ("n1-standard-4-v100", 0.74),
        ("g2-standard-4", 0.26),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preemptible_discount() {
        let provider = GcpProvider::new("us-central1");
        let od = provider.on_demand_price("a2-highgpu-1g").await.unwrap();
        let pre = provider.spot_price("a2-highgpu-1g").await.unwrap();
        assert!(pre < od * 0.4);
    }

    #[tokio::test]
    async fn test_scale_up_tracks_capacity() {
        let provider = GcpProvider::new("us-central1");
        let pool = NodePoolSpec {
            name: "a100-pool".into(),
            max_size: 10,
            ..Default::default()
        };
        provider.scale_up(&pool, 4).await.unwrap();
        let info = provider.pool_info("a100-pool").await.unwrap();
        assert_eq!(info.current_size, 4);
    }
}
