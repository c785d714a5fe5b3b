//! Capability traits for gpufleet components
//!
//! The control plane's external collaborators are narrow interfaces: the
//! cluster runtime (read nodes/workloads, mutate annotations and cordon
//! state, manage the declared objects), the metrics read model, the secret
//! store, and the wall clock. Concrete implementations live in adapter
//! crates; fleet-dev provides in-memory versions for tests.

use crate::policy::{
    AdmissionGuardConfig, AutoscalingPolicy, CostAttribution, CostBudget, GpuNodeConfig,
    GpuSharingPolicy,
};
use crate::types::{Node, Workload, WorkloadRef};
use crate::{labels, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Client to the hosting cluster runtime.
///
/// The controller mutates only node annotations/labels/cordon state,
/// workload eviction, and its own declared objects; node creation and
/// deletion go through the cloud capability instead.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    // Nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn get_node(&self, name: &str) -> Result<Node>;
    async fn cordon_node(&self, name: &str) -> Result<()>;
    async fn annotate_node(&self, name: &str, annotations: BTreeMap<String, String>)
        -> Result<()>;
    async fn label_node(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()>;

    // Workloads
    async fn list_workloads(&self) -> Result<Vec<Workload>>;
    async fn list_workloads_on_node(&self, node: &str) -> Result<Vec<Workload>>;
    async fn evict_workload(&self, workload: &WorkloadRef, grace: Duration) -> Result<()>;

    // Declared objects
    async fn autoscaling_policies(&self) -> Result<Vec<AutoscalingPolicy>>;
    async fn update_autoscaling_policy(&self, policy: &AutoscalingPolicy) -> Result<()>;
    async fn sharing_policies(&self) -> Result<Vec<GpuSharingPolicy>>;
    async fn update_sharing_policy(&self, policy: &GpuSharingPolicy) -> Result<()>;
    async fn node_configs(&self) -> Result<Vec<GpuNodeConfig>>;
    async fn update_node_config(&self, config: &GpuNodeConfig) -> Result<()>;
    async fn cost_budgets(&self) -> Result<Vec<CostBudget>>;
    async fn update_cost_budget(&self, budget: &CostBudget) -> Result<()>;
    async fn cost_attributions(&self) -> Result<Vec<CostAttribution>>;
    async fn update_cost_attribution(&self, attribution: &CostAttribution) -> Result<()>;

    // Admission guard config, written by budget block enforcement and
    // read by the admission webhook
    async fn admission_guard(&self) -> Result<AdmissionGuardConfig>;
    async fn set_admission_guard(&self, config: &AdmissionGuardConfig) -> Result<()>;

    /// Record an event against a cluster object, best effort
    async fn record_event(&self, object: &str, kind: EventKind, reason: &str, message: &str);

    /// All nodes exposing GPU capacity
    async fn list_gpu_nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.has_gpus())
            .collect())
    }

    /// Pending workloads that request GPUs (whole or partitioned)
    async fn pending_gpu_workloads(&self) -> Result<Vec<Workload>> {
        Ok(self
            .list_workloads()
            .await?
            .into_iter()
            .filter(|w| w.is_pending() && labels::is_gpu_workload(w))
            .collect())
    }

    /// Running workloads that request GPUs
    async fn running_gpu_workloads(&self) -> Result<Vec<Workload>> {
        Ok(self
            .list_workloads()
            .await?
            .into_iter()
            .filter(|w| w.is_running() && labels::is_gpu_workload(w))
            .collect())
    }
}

/// Event kinds mirrored from the cluster runtime's event API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Normal => "Normal",
            EventKind::Warning => "Warning",
        }
    }
}

/// One GPU utilization sample from the metrics read model.
/// Utilization values are fractions in [0, 1].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GpuSample {
    pub node: String,
    pub workload: Option<WorkloadRef>,
    pub gpu_index: u32,
    pub utilization: f64,
    pub memory_utilization: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub power_watts: f64,
    pub temperature_c: f64,
    pub timestamp: DateTime<Utc>,
}

/// Read model over the scrape pipeline. The controller never scrapes
/// devices itself; it queries this interface and degrades gracefully
/// when it fails.
#[async_trait]
pub trait MetricsReader: Send + Sync {
    /// Current per-GPU samples across the fleet
    async fn gpu_samples(&self) -> Result<Vec<GpuSample>>;

    /// Samples averaged over a lookback window, for waste analysis.
    /// Implementations without history may return current samples.
    async fn averaged_samples(&self, lookback_minutes: u32) -> Result<Vec<GpuSample>> {
        let _ = lookback_minutes;
        self.gpu_samples().await
    }

    /// Mean utilization across all sampled GPUs, 0 when none
    async fn average_utilization(&self) -> Result<f64> {
        let samples = self.gpu_samples().await?;
        if samples.is_empty() {
            return Ok(0.0);
        }
        Ok(samples.iter().map(|s| s.utilization).sum::<f64>() / samples.len() as f64)
    }

    /// Mean utilization of one node's GPUs, 0 when unsampled
    async fn node_utilization(&self, node: &str) -> Result<f64> {
        let samples = self.gpu_samples().await?;
        let node_samples: Vec<_> = samples.iter().filter(|s| s.node == node).collect();
        if node_samples.is_empty() {
            return Ok(0.0);
        }
        Ok(node_samples.iter().map(|s| s.utilization).sum::<f64>() / node_samples.len() as f64)
    }
}

/// Secret resolution by key from an external secret store
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;
}

/// Secret store backed by process environment variables; keys are
/// upper-cased with dashes and dots mapped to underscores.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, key: &str) -> Result<String> {
        let env_key = key.to_uppercase().replace(['-', '.'], "_");
        std::env::var(&env_key).map_err(|_| crate::Error::SecretNotFound(key.to_string()))
    }
}

/// Injected wall clock so reconcile decisions are deterministic in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn test_env_secret_store_key_mapping() {
        std::env::set_var("SLACK_WEBHOOK_URL", "https://hooks.example");
        let store = EnvSecretStore;
        assert_eq!(
            store.get("slack-webhook.url").await.unwrap(),
            "https://hooks.example"
        );
        assert!(store.get("missing-secret").await.is_err());
    }
}
