//! AWS capacity-control adapter
//!
//! Scales auto-scaling groups by tracking desired capacity per pool and
//! answers price questions from the built-in GPU instance tables. Spot
//! reclamation notices come from the instance metadata service on the node
//! itself; from the control plane this adapter reports none.

use crate::{CloudError, CloudProvider, NodePoolInfo, ReclamationNotice, Result};
use async_trait::async_trait;
use fleet_core::policy::NodePoolSpec;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// CloudProvider implementation for AWS auto-scaling groups
pub struct AwsProvider {
    region: String,
    desired_capacity: RwLock<HashMap<String, u32>>,
}

impl AwsProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            desired_capacity: RwLock::new(HashMap::new()),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    async fn scale_up(&self, pool: &NodePoolSpec, count: u32) -> Result<()> {
        let mut capacity = self.desired_capacity.write().await;
        let desired = capacity.entry(pool.name.clone()).or_insert(pool.min_size);
        let target = (*desired + count).min(pool.max_size);

        info!(
            pool = %pool.name,
            from = *desired,
            to = target,
            "AWS: raising ASG desired capacity"
        );

        *desired = target;
        Ok(())
    }

    async fn scale_down(&self, node_name: &str) -> Result<()> {
        info!(node = %node_name, "AWS: terminating instance in ASG");
        Ok(())
    }

    async fn reclamation_notice(&self, _node_name: &str) -> Result<Option<ReclamationNotice>> {
        // The two-minute interruption warning is only visible from the
        // node's metadata endpoint; nothing to report here.
        Ok(None)
    }

    async fn spot_price(&self, instance_type: &str) -> Result<f64> {
        spot_prices()
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
        // Diverse classes reduce correlated interruption: a mix of older
        // proven generations and newer balanced ones.
        Ok(vec![
            "g4dn.xlarge".to_string(),
            "g4dn.12xlarge".to_string(),
            "g5.xlarge".to_string(),
            "g5.12xlarge".to_string(),
            "p3.2xlarge".to_string(),
            "p3.8xlarge".to_string(),
        ])
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        Ok(vec![
            format!("{}a", self.region),
            format!("{}b", self.region),
            format!("{}c", self.region),
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

/// On-demand hourly prices for common GPU instance classes
fn on_demand_prices() -> HashMap<&'static str, f64> {
    HashMap::from([
        ("p3.2xlarge", 3.06),    // 1x V100
        ("p3.8xlarge", 12.24),   // 4x V100
        ("p3.16xlarge", 24.48),  // 8x V100
        ("p4d.24xlarge", 32.77), // 8x A100
        ("p4de.24xlarge", 40.96),
        ("g4dn.xlarge", 0.526), // 1x T4
        ("g4dn.2xlarge", 0.752),
        ("g5.xlarge", 1.006), // 1x A10G
        ("g5.2xlarge", 1.212),
        ("g5.12xlarge", 5.672),
    ])
}

/// Typical spot hourly prices, roughly 30-40% of on-demand
fn spot_prices() -> HashMap<&'static str, f64> {
    HashMap::from([
        ("p3.2xlarge", 1.07),
        ("p3.8xlarge", 4.28),
        ("p3.16xlarge", 9.60),
        ("p4d.24xlarge", 11.47),
        ("p4de.24xlarge", 14.34),
        ("g4dn.xlarge", 0.18),
        ("g5.xlarge", 0.35),
        ("g5.12xlarge", 2.50),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, max: u32) -> NodePoolSpec {
        NodePoolSpec {
            name: name.into(),
            max_size: max,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scale_up_respects_pool_max() {
        let provider = AwsProvider::new("us-east-1");
        let p = pool("gpu-spot", 3);

        provider.scale_up(&p, 2).await.unwrap();
        provider.scale_up(&p, 5).await.unwrap();

        let info = provider.pool_info("gpu-spot").await.unwrap();
        assert_eq!(info.current_size, 3);
    }

    #[tokio::test]
    async fn test_spot_prices_discount_on_demand() {
        let provider = AwsProvider::new("us-east-1");
        let od = provider.on_demand_price("p3.2xlarge").await.unwrap();
        let spot = provider.spot_price("p3.2xlarge").await.unwrap();
        assert!(spot < od * 0.5);
    }

    #[tokio::test]
    async fn test_unknown_instance_type() {
        let provider = AwsProvider::new("us-east-1");
        assert!(matches!(
            provider.on_demand_price("m5.large").await,
            Err(CloudError::PriceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_zones_follow_region() {
        let provider = AwsProvider::new("us-west-2");
        let zones = provider.availability_zones().await.unwrap();
        assert_eq!(zones, vec!["us-west-2a", "us-west-2b", "us-west-2c"]);
    }
}
