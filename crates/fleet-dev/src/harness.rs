//! Scenario builder for integration tests
//!
//! Bundles the mock capabilities behind one handle and offers fluent
//! seeding so scenario tests read as their setup descriptions.

use crate::{ManualClock, MockClusterRuntime, MockMetricsReader};
use chrono::Duration;
use fleet_core::policy::{AutoscalingPolicy, AutoscalingPolicySpec, NodePoolSpec};
use fleet_core::{CapacityClass, Clock, ClusterRuntime, MetricsReader};
use std::sync::Arc;

/// A mock cluster with a manual clock
pub struct Scenario {
    pub runtime: Arc<MockClusterRuntime>,
    pub metrics_reader: Arc<MockMetricsReader>,
    pub clock: Arc<ManualClock>,
}

impl Scenario {
    pub fn new() -> Self {
        Self {
            runtime: Arc::new(MockClusterRuntime::new()),
            metrics_reader: Arc::new(MockMetricsReader::new()),
            clock: Arc::new(ManualClock::new()),
        }
    }

    /// Seed `count` GPU nodes of one capacity class, named
    /// `<prefix>-<i>`, each with eight GPUs
    pub async fn with_gpu_nodes(self, prefix: &str, capacity_class: CapacityClass, count: u32) -> Self {
        for i in 0..count {
            self.runtime
                .put_gpu_node(&format!("{}-{}", prefix, i), capacity_class.as_str(), 8)
                .await;
        }
        self
    }

    /// Seed a pending GPU workload that has been waiting `age` already
    pub async fn with_stale_pending_workload(self, namespace: &str, name: &str, age: Duration) -> Self {
        let created = self.clock.now() - age;
        self.runtime
            .put_pending_gpu_workload(namespace, name, 1, created)
            .await;
        self
    }

    /// Report the same utilization for every seeded node
    pub async fn with_uniform_utilization(self, utilization: f64) -> Self {
        let nodes = self.runtime.list_nodes().await.unwrap();
        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        self.metrics_reader
            .set_uniform_utilization(&names, utilization)
            .await;
        self
    }

    /// Seed an autoscaling policy with one spot pool and one on-demand
    /// pool, both wide open
    pub async fn with_default_policy(self, name: &str) -> Self {
        let policy = AutoscalingPolicy {
            name: name.to_string(),
            spec: AutoscalingPolicySpec {
                node_pools: vec![
                    NodePoolSpec {
                        name: "gpu-spot".into(),
                        capacity_class: CapacityClass::Spot,
                        max_size: 50,
                        ..Default::default()
                    },
                    NodePoolSpec {
                        name: "gpu-on-demand".into(),
                        capacity_class: CapacityClass::OnDemand,
                        max_size: 50,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            status: Default::default(),
        };
        self.runtime.put_policy(policy).await;
        self
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scenario_seeding() {
        let scenario = Scenario::new()
            .with_gpu_nodes("spot", CapacityClass::Spot, 3)
            .await
            .with_uniform_utilization(0.4)
            .await
            .with_default_policy("default")
            .await;

        assert_eq!(scenario.runtime.list_gpu_nodes().await.unwrap().len(), 3);
        assert!(
            (scenario.metrics_reader.average_utilization().await.unwrap() - 0.4).abs() < 1e-9
        );
        assert!(scenario.runtime.policy("default").await.is_some());
    }
}
