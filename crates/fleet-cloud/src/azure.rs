//! Azure capacity-control adapter
//!
//! Virtual machine scale sets with spot priority. Prices come from the
//! built-in GPU VM size tables.

use crate::{CloudError, CloudProvider, NodePoolInfo, ReclamationNotice, Result};
use async_trait::async_trait;
use fleet_core::policy::NodePoolSpec;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// CloudProvider implementation for Azure VM scale sets
pub struct AzureProvider {
    region: String,
    desired_capacity: RwLock<HashMap<String, u32>>,
}

impl AzureProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            desired_capacity: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CloudProvider for AzureProvider {
    async fn scale_up(&self, pool: &NodePoolSpec, count: u32) -> Result<()> {
        let mut capacity = self.desired_capacity.write().await;
        let desired = capacity.entry(pool.name.clone()).or_insert(pool.min_size);
        let target = (*desired + count).min(pool.max_size);

        info!(
            pool = %pool.name,
            from = *desired,
            to = target,
            "Azure: raising scale set capacity"
        );

        *desired = target;
        Ok(())
    }

    async fn scale_down(&self, node_name: &str) -> Result<()> {
        info!(node = %node_name, "Azure: deleting scale set instance");
        Ok(())
    }

    async fn reclamation_notice(&self, _node_name: &str) -> Result<Option<ReclamationNotice>> {
        // Scheduled Events are served to the VM itself; nothing visible
        // from the control plane.
        Ok(None)
    }

    async fn spot_price(&self, instance_type: &str) -> Result<f64> {
        spot_prices()
            .get(instance_type)
            .copied()
            .ok_or_else(|| CloudError::PriceNotFound(instance_type.to_string()))
    }

    async fn on_demand_price(&self, instance_type: &str) -> Result<f64> {
        regular_prices()
            .get(instance_type)
            .copied()
            .ok_or_else(|| CloudError::PriceNotFound(instance_type.to_string()))
    }

    async fn recommended_spot_instance_types(&self) -> Result<Vec<String>> {
        Ok(vec![
            "Standard_NC4as_T4_v3".to_string(),
            "Standard_NC6s_v3".to_string(),
            "Standard_NC24ads_A100_v4".to_string(),
        ])
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        Ok(vec!["1".to_string(), "2".to_string(), "3".to_string()])
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

fn regular_prices() -> HashMap<&'static str, f64> {
    HashMap::from([
        ("Standard_ND96asr_v4", 32.40), // 8x A100
        ("Standard_NC24ads_A100_v4", 4.35),
        ("Standard_NC6s_v3", 3.06), // 1x V100
        ("Standard_NC12s_v3", 6.12),
        ("Standard_NC4as_T4_v3", 0.526),
    ])
}

fn spot_prices() -> HashMap<&'static str, f64> {
    HashMap::from([
        ("Standard_ND96asr_v4", 11.34),
        ("Standard_NC24ads_A100_v4", 1.52),
        ("Standard_NC6s_v3", 1.07),
        ("Standard_NC4as_T4_v3", 0.184),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spot_discount() {
        let provider = AzureProvider::new("eastus");
        let regular = provider.on_demand_price("Standard_NC6s_v3").await.unwrap();
        let spot = provider.spot_price("Standard_NC6s_v3").await.unwrap();
        assert!(spot < regular * 0.5);
    }

    #[tokio::test]
    async fn test_unknown_vm_size() {
        let provider = AzureProvider::new("eastus");
        assert!(provider.spot_price("Standard_D2s_v3").await.is_err());
    }
}
