//! In-memory cluster runtime for tests
//!
//! Holds nodes, workloads, and every declared object behind a single
//! lock, and records evictions and events with timestamps so tests can
//! assert drain ordering and pacing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::policy::{
    AdmissionGuardConfig, AutoscalingPolicy, CostAttribution, CostBudget, GpuNodeConfig,
    GpuSharingPolicy,
};
use fleet_core::types::Container;
use fleet_core::{
    labels, ClusterRuntime, Error, EventKind, Node, Result, Workload, WorkloadPhase, WorkloadRef,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// One recorded eviction
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionRecord {
    pub workload: WorkloadRef,
    pub grace: Duration,
    pub at: DateTime<Utc>,
}

/// One recorded event
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub object: String,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    workloads: BTreeMap<WorkloadRef, Workload>,
    autoscaling_policies: BTreeMap<String, AutoscalingPolicy>,
    sharing_policies: BTreeMap<String, GpuSharingPolicy>,
    node_configs: BTreeMap<String, GpuNodeConfig>,
    budgets: BTreeMap<String, CostBudget>,
    attributions: BTreeMap<String, CostAttribution>,
    admission_guard: AdmissionGuardConfig,
    evictions: Vec<EvictionRecord>,
    events: Vec<EventRecord>,
    fail_workload_list: bool,
}

/// Scriptable in-memory cluster runtime
#[derive(Debug, Clone, Default)]
pub struct MockClusterRuntime {
    state: Arc<RwLock<ClusterState>>,
}

impl MockClusterRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers

    pub async fn put_node(&self, node: Node) {
        self.state.write().await.nodes.insert(node.name.clone(), node);
    }

    /// Seed a GPU node with the given capacity class label and capacity
    pub async fn put_gpu_node(&self, name: &str, capacity_class: &str, gpus: i64) {
        let mut node = Node::new(name);
        node.capacity.insert(labels::RESOURCE_WHOLE_GPU.into(), gpus);
        node.labels
            .insert(labels::LABEL_CAPACITY_TYPE.into(), capacity_class.into());
        self.put_node(node).await;
    }

    pub async fn remove_node(&self, name: &str) {
        self.state.write().await.nodes.remove(name);
    }

    pub async fn put_workload(&self, workload: Workload) {
        self.state
            .write()
            .await
            .workloads
            .insert(workload.workload_ref(), workload);
    }

    /// Seed a pending GPU workload created at the given time
    pub async fn put_pending_gpu_workload(
        &self,
        namespace: &str,
        name: &str,
        gpus: i64,
        created_at: DateTime<Utc>,
    ) {
        self.put_workload(Workload {
            name: name.into(),
            namespace: namespace.into(),
            phase: Some(WorkloadPhase::Pending),
            containers: vec![Container {
                name: "main".into(),
                requests: [(labels::RESOURCE_WHOLE_GPU.to_string(), gpus)].into(),
                limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), gpus)].into(),
            }],
            created_at: Some(created_at),
            ..Default::default()
        })
        .await;
    }

    /// Seed a running GPU workload placed on a node
    pub async fn put_running_gpu_workload(
        &self,
        namespace: &str,
        name: &str,
        node: &str,
        gpus: i64,
    ) {
        let now = Utc::now();
        self.put_workload(Workload {
            name: name.into(),
            namespace: namespace.into(),
            phase: Some(WorkloadPhase::Running),
            node_name: Some(node.into()),
            containers: vec![Container {
                name: "main".into(),
                requests: [(labels::RESOURCE_WHOLE_GPU.to_string(), gpus)].into(),
                limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), gpus)].into(),
            }],
            created_at: Some(now),
            started_at: Some(now),
            ..Default::default()
        })
        .await;
    }

    pub async fn put_policy(&self, policy: AutoscalingPolicy) {
        self.state
            .write()
            .await
            .autoscaling_policies
            .insert(policy.name.clone(), policy);
    }

    pub async fn put_sharing_policy(&self, policy: GpuSharingPolicy) {
        self.state
            .write()
            .await
            .sharing_policies
            .insert(policy.name.clone(), policy);
    }

    pub async fn put_node_config(&self, config: GpuNodeConfig) {
        self.state
            .write()
            .await
            .node_configs
            .insert(config.name.clone(), config);
    }

    pub async fn put_budget(&self, budget: CostBudget) {
        self.state
            .write()
            .await
            .budgets
            .insert(budget.name.clone(), budget);
    }

    pub async fn put_attribution(&self, attribution: CostAttribution) {
        self.state
            .write()
            .await
            .attributions
            .insert(attribution.name.clone(), attribution);
    }

    /// Make workload listings fail, to exercise abort-and-requeue paths
    pub async fn fail_workload_list(&self, fail: bool) {
        self.state.write().await.fail_workload_list = fail;
    }

    // Observation helpers

    pub async fn policy(&self, name: &str) -> Option<AutoscalingPolicy> {
        self.state.read().await.autoscaling_policies.get(name).cloned()
    }

    pub async fn node_config(&self, name: &str) -> Option<GpuNodeConfig> {
        self.state.read().await.node_configs.get(name).cloned()
    }

    pub async fn budget(&self, name: &str) -> Option<CostBudget> {
        self.state.read().await.budgets.get(name).cloned()
    }

    pub async fn attribution(&self, name: &str) -> Option<CostAttribution> {
        self.state.read().await.attributions.get(name).cloned()
    }

    pub async fn evictions(&self) -> Vec<EvictionRecord> {
        self.state.read().await.evictions.clone()
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.state.read().await.events.clone()
    }

    pub async fn workload_count(&self) -> usize {
        self.state.read().await.workloads.len()
    }
}

#[async_trait]
impl ClusterRuntime for MockClusterRuntime {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.state
            .read()
            .await
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {}", name)))
    }

    async fn cordon_node(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("node {}", name)))?;
        node.unschedulable = true;
        debug!(node = name, "cordoned");
        Ok(())
    }

    async fn annotate_node(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("node {}", name)))?;
        node.annotations.extend(annotations);
        Ok(())
    }

    async fn label_node(&self, name: &str, node_labels: BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("node {}", name)))?;
        node.labels.extend(node_labels);
        Ok(())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        let state = self.state.read().await;
        if state.fail_workload_list {
            return Err(Error::cluster("scripted workload list failure"));
        }
        Ok(state.workloads.values().cloned().collect())
    }

    async fn list_workloads_on_node(&self, node: &str) -> Result<Vec<Workload>> {
        let state = self.state.read().await;
        if state.fail_workload_list {
            return Err(Error::cluster("scripted workload list failure"));
        }
        Ok(state
            .workloads
            .values()
            .filter(|w| w.node_name.as_deref() == Some(node))
            .cloned()
            .collect())
    }

    async fn evict_workload(&self, workload: &WorkloadRef, grace: Duration) -> Result<()> {
        let mut state = self.state.write().await;
        state.workloads.remove(workload);
        state.evictions.push(EvictionRecord {
            workload: workload.clone(),
            grace,
            at: Utc::now(),
        });
        debug!(workload = %workload, grace_seconds = grace.as_secs(), "evicted");
        Ok(())
    }

    async fn autoscaling_policies(&self) -> Result<Vec<AutoscalingPolicy>> {
        Ok(self
            .state
            .read()
            .await
            .autoscaling_policies
            .values()
            .cloned()
            .collect())
    }

    async fn update_autoscaling_policy(&self, policy: &AutoscalingPolicy) -> Result<()> {
        self.state
            .write()
            .await
            .autoscaling_policies
            .insert(policy.name.clone(), policy.clone());
        Ok(())
    }

    async fn sharing_policies(&self) -> Result<Vec<GpuSharingPolicy>> {
        Ok(self
            .state
            .read()
            .await
            .sharing_policies
            .values()
            .cloned()
            .collect())
    }

    async fn update_sharing_policy(&self, policy: &GpuSharingPolicy) -> Result<()> {
        self.state
            .write()
            .await
            .sharing_policies
            .insert(policy.name.clone(), policy.clone());
        Ok(())
    }

    async fn node_configs(&self) -> Result<Vec<GpuNodeConfig>> {
        Ok(self
            .state
            .read()
            .await
            .node_configs
            .values()
            .cloned()
            .collect())
    }

    async fn update_node_config(&self, config: &GpuNodeConfig) -> Result<()> {
        self.state
            .write()
            .await
            .node_configs
            .insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn cost_budgets(&self) -> Result<Vec<CostBudget>> {
        Ok(self.state.read().await.budgets.values().cloned().collect())
    }

    async fn update_cost_budget(&self, budget: &CostBudget) -> Result<()> {
        self.state
            .write()
            .await
            .budgets
            .insert(budget.name.clone(), budget.clone());
        Ok(())
    }

    async fn cost_attributions(&self) -> Result<Vec<CostAttribution>> {
        Ok(self
            .state
            .read()
            .await
            .attributions
            .values()
            .cloned()
            .collect())
    }

    async fn update_cost_attribution(&self, attribution: &CostAttribution) -> Result<()> {
        self.state
            .write()
            .await
            .attributions
            .insert(attribution.name.clone(), attribution.clone());
        Ok(())
    }

    async fn admission_guard(&self) -> Result<AdmissionGuardConfig> {
        Ok(self.state.read().await.admission_guard.clone())
    }

    async fn set_admission_guard(&self, config: &AdmissionGuardConfig) -> Result<()> {
        self.state.write().await.admission_guard = config.clone();
        Ok(())
    }

    async fn record_event(&self, object: &str, kind: EventKind, reason: &str, message: &str) {
        self.state.write().await.events.push(EventRecord {
            object: object.to_string(),
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gpu_node_and_workload_filters() {
        let runtime = MockClusterRuntime::new();
        runtime.put_gpu_node("gpu-1", "spot", 8).await;
        runtime.put_node(Node::new("cpu-1")).await;
        runtime
            .put_pending_gpu_workload("ml", "queued", 1, Utc::now())
            .await;
        runtime.put_running_gpu_workload("ml", "live", "gpu-1", 2).await;

        assert_eq!(runtime.list_gpu_nodes().await.unwrap().len(), 1);
        assert_eq!(runtime.pending_gpu_workloads().await.unwrap().len(), 1);
        assert_eq!(runtime.running_gpu_workloads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_removes_and_records() {
        let runtime = MockClusterRuntime::new();
        runtime.put_gpu_node("gpu-1", "spot", 8).await;
        runtime.put_running_gpu_workload("ml", "w", "gpu-1", 1).await;

        let target = WorkloadRef::new("ml", "w");
        runtime
            .evict_workload(&target, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(runtime.workload_count().await, 0);
        let evictions = runtime.evictions().await;
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].workload, target);
        assert_eq!(evictions[0].grace, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_cordon_flag() {
        let runtime = MockClusterRuntime::new();
        runtime.put_gpu_node("gpu-1", "spot", 8).await;
        runtime.cordon_node("gpu-1").await.unwrap();
        assert!(runtime.get_node("gpu-1").await.unwrap().unschedulable);
    }
}
