//! Process multiplexing (MPS) configuration and mutations
//!
//! MPS lets several CUDA processes share one GPU concurrently with soft
//! compute and memory caps. The mutation preserves the GPU request shape
//! and steers the workload onto multiplexing-enabled nodes; the node
//! daemon enforces the actual sharing.

use fleet_core::policy::MpsPolicyConfig;
use fleet_core::{labels, Node, Workload, WorkloadClass};
use std::collections::BTreeMap;
use tracing::debug;

use crate::mig::SavingsEstimate;

/// Whether a node advertises multiplexing capability
pub fn is_capable(node: &Node) -> bool {
    node.label(labels::LABEL_MPS_CAPABLE) == Some("true")
}

/// Rewrite a workload for process-multiplexed sharing
pub fn convert_workload(workload: &mut Workload, config: &MpsPolicyConfig) {
    let original_gpus = labels::whole_gpu_request(workload);

    workload.annotations.insert(
        labels::ANNOTATION_ORIGINAL_GPU_REQUEST.to_string(),
        original_gpus.to_string(),
    );
    workload
        .annotations
        .insert(labels::ANNOTATION_MPS_ENABLED.to_string(), "true".to_string());
    workload
        .annotations
        .insert(labels::ANNOTATION_NODE_MPS.to_string(), "enabled".to_string());

    if config.default_active_threads > 0 {
        workload.annotations.insert(
            labels::ANNOTATION_NODE_MPS_ACTIVE_THREADS.to_string(),
            config.default_active_threads.to_string(),
        );
    }
    if config.memory_limit_mb > 0 {
        workload.annotations.insert(
            labels::ANNOTATION_NODE_MPS_MEMORY_LIMIT.to_string(),
            (config.memory_limit_mb * 1024 * 1024).to_string(),
        );
    }

    // Sub-whole-GPU requests are expressed through the synthetic shared
    // key; the daemon fans clients onto one device
    if original_gpus < 1 {
        if let Some(container) = workload.containers.first_mut() {
            container
                .requests
                .insert(labels::RESOURCE_SHARED_GPU.to_string(), 1);
            container
                .limits
                .insert(labels::RESOURCE_SHARED_GPU.to_string(), 1);
        }
    }

    workload.node_selector.insert(
        labels::LABEL_MPS_ENABLED.to_string(),
        "true".to_string(),
    );

    debug!(
        workload = %workload.workload_ref(),
        original_gpus,
        "converted workload to process multiplexing"
    );
}

/// Node labels and annotations enabling multiplexing
pub fn node_enablement(
    config: &MpsPolicyConfig,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut node_labels = BTreeMap::new();
    let mut node_annotations = BTreeMap::new();

    node_annotations.insert(labels::ANNOTATION_NODE_MPS.to_string(), "enabled".to_string());
    node_annotations.insert(
        labels::ANNOTATION_NODE_MPS_MAX_CLIENTS.to_string(),
        config.max_clients.to_string(),
    );
    node_annotations.insert(
        labels::ANNOTATION_NODE_MPS_ACTIVE_THREADS.to_string(),
        config.default_active_threads.to_string(),
    );
    if config.memory_limit_mb > 0 {
        node_annotations.insert(
            labels::ANNOTATION_NODE_MPS_MEMORY_LIMIT.to_string(),
            (config.memory_limit_mb * 1024 * 1024).to_string(),
        );
    }
    node_labels.insert(labels::LABEL_MPS_ENABLED.to_string(), "true".to_string());

    (node_labels, node_annotations)
}

/// Whether a workload would benefit from multiplexing: not training,
/// not already near GPU saturation, not opted out
pub fn is_workload_suitable(workload: &Workload, avg_utilization: f64) -> bool {
    if workload.workload_class() == WorkloadClass::Training {
        return false;
    }
    if avg_utilization > 0.5 {
        return false;
    }
    workload.annotation(labels::ANNOTATION_MPS_ENABLED) != Some("false")
}

/// Estimated savings from multiplexing eligible workloads. Several
/// small inference clients can share one device, conservatively saving
/// three quarters of a GPU per eligible workload.
pub fn estimate_savings(workloads: &[Workload]) -> SavingsEstimate {
    let mut estimate = SavingsEstimate::default();

    for workload in workloads {
        if labels::whole_gpu_request(workload) == 0 {
            continue;
        }
        estimate.total_workloads += 1;

        let class = workload.workload_class();
        let opted_in = workload.annotation(labels::ANNOTATION_SHARING) == Some("enabled");
        if matches!(class, WorkloadClass::Inference | WorkloadClass::Serving) || opted_in {
            estimate.eligible_workloads += 1;
            estimate.potential_saved_gpus += 0.75;
        }
    }

    if estimate.total_workloads > 0 {
        estimate.savings_percentage =
            estimate.potential_saved_gpus / estimate.total_workloads as f64 * 100.0;
    }
    estimate
}
