//! Per-node sharing configuration reconciler
//!
//! Applies GpuNodeConfig objects by writing enablement labels and
//! annotations onto the target node; a node-level device agent performs
//! the hardware programming in response. At most one sharing mode may be
//! active on a node at any instant, and switching modes requires the
//! node to be drained first.

use chrono::Utc;
use fleet_core::policy::{
    GpuNodeConfig, MigStatus, MpsPolicyConfig, MpsStatus, NodeConfigPhase, StatusCondition,
    TimeSlicingPolicyConfig, TimeSlicingStatus,
};
use fleet_core::{labels, Clock, ClusterRuntime, Error, Node, Result, SharingMode};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::{mig, mps, timeslicing};

/// Reconciles GpuNodeConfig objects
pub struct NodeConfigReconciler {
    runtime: Arc<dyn ClusterRuntime>,
    clock: Arc<dyn Clock>,
}

impl NodeConfigReconciler {
    pub fn new(runtime: Arc<dyn ClusterRuntime>, clock: Arc<dyn Clock>) -> Self {
        Self { runtime, clock }
    }

    /// Reconcile every declared node config
    pub async fn reconcile_all(&self) -> Result<()> {
        for config in self.runtime.node_configs().await? {
            if let Err(e) = self.reconcile(config).await {
                error!(error = %e, "node config reconcile failed");
            }
        }
        Ok(())
    }

    /// Apply one node's declared sharing configuration
    pub async fn reconcile(&self, mut config: GpuNodeConfig) -> Result<()> {
        let now = self.clock.now();
        config.status.last_update_time = Some(now);

        let enabled_modes = [
            config.spec.mig_enabled,
            config.spec.mps_enabled,
            config.spec.timeslicing_enabled,
        ]
        .iter()
        .filter(|enabled| **enabled)
        .count();

        // Only one sharing mode may be active per node
        if enabled_modes > 1 {
            config.status.phase = NodeConfigPhase::Failed;
            config.status.message =
                "at most one sharing mode may be enabled per node".to_string();
            self.push_condition(
                &mut config,
                "InvalidConfiguration",
                "MultipleModes",
                "mig, mps, and time-slicing are mutually exclusive on one node",
            );
            return self.runtime.update_node_config(&config).await;
        }

        let node = match self.runtime.get_node(&config.spec.node_name).await {
            Ok(node) => node,
            Err(e) if matches!(e, Error::NotFound(_)) => {
                let message = format!("node {} not found", config.spec.node_name);
                config.status.phase = NodeConfigPhase::Failed;
                config.status.message = message.clone();
                self.push_condition(&mut config, "InvalidConfiguration", "NodeNotFound", &message);
                return self.runtime.update_node_config(&config).await;
            }
            Err(e) => return Err(e),
        };

        // Mode switches require a drained node
        let target = target_mode(&config);
        if let Some(active) = active_mode(&node) {
            if Some(active) != target {
                let occupants = self
                    .runtime
                    .list_workloads_on_node(&node.name)
                    .await?
                    .into_iter()
                    .filter(labels::is_gpu_workload)
                    .count();
                if occupants > 0 {
                    debug!(
                        node = %node.name,
                        active = %active,
                        occupants,
                        "waiting for drain before switching sharing mode"
                    );
                    config.status.phase = NodeConfigPhase::Configuring;
                    config.status.message = format!(
                        "waiting for {} GPU workloads to drain before switching from {}",
                        occupants, active
                    );
                    return self.runtime.update_node_config(&config).await;
                }
            }
        }

        self.apply(&node, &mut config).await?;

        config.status.phase = NodeConfigPhase::Ready;
        config.status.message.clear();
        self.runtime.update_node_config(&config).await
    }

    /// Write the enablement labels/annotations and mirror observed state
    async fn apply(&self, node: &Node, config: &mut GpuNodeConfig) -> Result<()> {
        if config.spec.mig_enabled {
            let (node_labels, node_annotations) = mig::node_enablement(&config.spec.mig_profiles);
            self.runtime.label_node(&node.name, node_labels).await?;
            self.runtime
                .annotate_node(&node.name, node_annotations)
                .await?;

            let devices: u32 = config
                .spec
                .mig_profiles
                .iter()
                .filter_map(|p| mig::MigProfile::by_name(p))
                .map(|p| (7 / p.slice_count).max(1))
                .sum();
            config.status.mig = Some(MigStatus {
                enabled: true,
                configured_profiles: config.spec.mig_profiles.clone(),
                available_devices: devices,
            });
            info!(node = %node.name, profiles = ?config.spec.mig_profiles, "applied partition config");
        }

        if config.spec.mps_enabled {
            let mps_config = MpsPolicyConfig {
                max_clients: config.spec.mps_max_clients,
                ..Default::default()
            };
            let (node_labels, node_annotations) = mps::node_enablement(&mps_config);
            self.runtime.label_node(&node.name, node_labels).await?;
            self.runtime
                .annotate_node(&node.name, node_annotations)
                .await?;

            let active_clients = self
                .runtime
                .list_workloads_on_node(&node.name)
                .await?
                .iter()
                .filter(|w| {
                    w.is_running() && w.annotation(labels::ANNOTATION_NODE_MPS) == Some("enabled")
                })
                .count() as u32;
            config.status.mps = Some(MpsStatus {
                enabled: true,
                active_clients,
                max_clients: config.spec.mps_max_clients,
            });
            info!(node = %node.name, max_clients = config.spec.mps_max_clients, "applied multiplexing config");
        }

        if config.spec.timeslicing_enabled {
            let ts_config = TimeSlicingPolicyConfig {
                replicas_per_gpu: config.spec.timeslicing_replicas,
                ..Default::default()
            };
            let (node_labels, node_annotations) = timeslicing::node_enablement(&ts_config);
            self.runtime.label_node(&node.name, node_labels).await?;
            self.runtime
                .annotate_node(&node.name, node_annotations)
                .await?;

            let physical = node.gpu_capacity() as u32;
            config.status.timeslicing = Some(TimeSlicingStatus {
                enabled: true,
                physical_gpus: physical,
                virtual_gpus: physical * config.spec.timeslicing_replicas,
                replicas_per_gpu: config.spec.timeslicing_replicas,
            });
            info!(
                node = %node.name,
                replicas = config.spec.timeslicing_replicas,
                "applied time-slicing config"
            );
        }

        Ok(())
    }

    fn push_condition(&self, config: &mut GpuNodeConfig, kind: &str, reason: &str, message: &str) {
        config.status.conditions.push(StatusCondition {
            condition_type: kind.to_string(),
            status: true,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition: Utc::now(),
        });
    }
}

/// The single sharing mode a config declares, if any
fn target_mode(config: &GpuNodeConfig) -> Option<SharingMode> {
    if config.spec.mig_enabled {
        Some(SharingMode::Mig)
    } else if config.spec.mps_enabled {
        Some(SharingMode::Mps)
    } else if config.spec.timeslicing_enabled {
        Some(SharingMode::Timeslicing)
    } else {
        None
    }
}

/// The sharing mode currently active on a node, from its labels
fn active_mode(node: &Node) -> Option<SharingMode> {
    if node.annotation(labels::ANNOTATION_MIG_CONFIG).is_some() {
        Some(SharingMode::Mig)
    } else if node.label(labels::LABEL_MPS_ENABLED) == Some("true") {
        Some(SharingMode::Mps)
    } else if node.label(labels::LABEL_TS_ENABLED) == Some("true") {
        Some(SharingMode::Timeslicing)
    } else {
        None
    }
}
