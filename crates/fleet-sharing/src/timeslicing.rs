//! Time-slicing configuration and mutations
//!
//! Time-slicing interleaves workloads on one GPU in short scheduler
//! quanta. The mutation keeps the GPU request shape, steers the workload
//! onto time-slicing-enabled nodes, and tolerates the taint those nodes
//! carry. The replica count per physical GPU comes from a utilization ×
//! burstiness table.

use fleet_core::policy::TimeSlicingPolicyConfig;
use fleet_core::types::Toleration;
use fleet_core::{labels, Node, Workload, WorkloadClass};
use std::collections::BTreeMap;
use tracing::debug;

use crate::mig::SavingsEstimate;

/// Whether a node supports time-slicing. Nodes without the explicit
/// capability label qualify whenever they expose whole GPUs; the device
/// plugin handles the virtual replica fan-out.
pub fn is_capable(node: &Node) -> bool {
    match node.label(labels::LABEL_TS_CAPABLE) {
        Some(v) => v == "true",
        None => node.gpu_capacity() > 0,
    }
}

/// Replicas per physical GPU by (mean utilization, burstiness) band.
/// Low-utilization bursty workloads pack eight to a device; sustained
/// high utilization gets no time-slicing at all.
pub fn optimal_replicas(avg_utilization: f64, burstiness: f64) -> u32 {
    if avg_utilization < 0.2 && burstiness > 0.7 {
        8
    } else if avg_utilization < 0.4 && burstiness > 0.5 {
        4
    } else if avg_utilization < 0.6 {
        2
    } else {
        1
    }
}

/// Rewrite a workload for time-sliced sharing
pub fn convert_workload(workload: &mut Workload, replicas_per_gpu: u32) {
    let original_gpus = labels::whole_gpu_request(workload);

    workload.annotations.insert(
        labels::ANNOTATION_ORIGINAL_GPU_REQUEST.to_string(),
        original_gpus.to_string(),
    );
    workload.annotations.insert(
        labels::ANNOTATION_TIMESLICING_ENABLED.to_string(),
        "true".to_string(),
    );
    workload.annotations.insert(
        labels::ANNOTATION_NODE_TS.to_string(),
        "enabled".to_string(),
    );
    workload.annotations.insert(
        labels::ANNOTATION_TIMESLICE_REPLICAS.to_string(),
        replicas_per_gpu.to_string(),
    );

    workload
        .node_selector
        .insert(labels::LABEL_TS_ENABLED.to_string(), "true".to_string());

    let has_toleration = workload
        .tolerations
        .iter()
        .any(|t| t.key == labels::TAINT_TIMESLICING);
    if !has_toleration {
        workload
            .tolerations
            .push(Toleration::exists(labels::TAINT_TIMESLICING, "NoSchedule"));
    }

    debug!(
        workload = %workload.workload_ref(),
        original_gpus,
        replicas_per_gpu,
        "converted workload to time-slicing"
    );
}

/// Node labels and annotations enabling time-slicing
pub fn node_enablement(
    config: &TimeSlicingPolicyConfig,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut node_labels = BTreeMap::new();
    let mut node_annotations = BTreeMap::new();

    node_annotations.insert(labels::ANNOTATION_NODE_TS.to_string(), "enabled".to_string());
    node_annotations.insert(
        labels::ANNOTATION_NODE_TS_REPLICAS.to_string(),
        config.replicas_per_gpu.to_string(),
    );
    node_annotations.insert(
        labels::ANNOTATION_NODE_TS_SLICE_MS.to_string(),
        config.slice_ms.to_string(),
    );
    node_annotations.insert(
        labels::ANNOTATION_NODE_TS_FAIRNESS.to_string(),
        config.fairness_mode.as_str().to_string(),
    );
    node_labels.insert(labels::LABEL_TS_ENABLED.to_string(), "true".to_string());
    node_labels.insert(
        labels::LABEL_TS_REPLICAS.to_string(),
        config.replicas_per_gpu.to_string(),
    );

    (node_labels, node_annotations)
}

/// Whether a workload suits time-slicing: bursty development and batch
/// work below sustained-saturation utilization
pub fn is_workload_suitable(workload: &Workload, avg_utilization: f64) -> bool {
    if workload.workload_class() == WorkloadClass::Training {
        return false;
    }
    if avg_utilization > 0.6 {
        return false;
    }
    workload.annotation(labels::ANNOTATION_TIMESLICING_ENABLED) != Some("false")
}

/// Estimated savings from time-slicing eligible workloads: each shares a
/// device with `replicas - 1` others
pub fn estimate_savings(workloads: &[Workload], replicas_per_gpu: u32) -> SavingsEstimate {
    let mut estimate = SavingsEstimate::default();
    let savings_per_workload = if replicas_per_gpu > 0 {
        (replicas_per_gpu - 1) as f64 / replicas_per_gpu as f64
    } else {
        0.0
    };

    for workload in workloads {
        if labels::whole_gpu_request(workload) == 0 {
            continue;
        }
        estimate.total_workloads += 1;

        let class = workload.workload_class();
        let opted_in = workload.annotation(labels::ANNOTATION_SHARING) == Some("enabled");
        if matches!(class, WorkloadClass::Development | WorkloadClass::Batch) || opted_in {
            estimate.eligible_workloads += 1;
            estimate.potential_saved_gpus += savings_per_workload;
        }
    }

    if estimate.total_workloads > 0 {
        estimate.savings_percentage =
            estimate.potential_saved_gpus / estimate.total_workloads as f64 * 100.0;
    }
    estimate
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::types::Container;

    fn gpu_workload(class: &str) -> Workload {
        Workload {
            name: "w".into(),
            namespace: "ns".into(),
            labels: [(labels::LABEL_WORKLOAD_TYPE.to_string(), class.to_string())].into(),
            containers: vec![Container {
                name: "main".into(),
                requests: [(labels::RESOURCE_WHOLE_GPU.to_string(), 1)].into(),
                limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), 1)].into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_replica_table() {
        assert_eq!(optimal_replicas(0.1, 0.8), 8);
        assert_eq!(optimal_replicas(0.3, 0.6), 4);
        assert_eq!(optimal_replicas(0.5, 0.2), 2);
        assert_eq!(optimal_replicas(0.7, 0.9), 1);
    }

    #[test]
    fn test_convert_adds_selector_and_toleration() {
        let mut workload = gpu_workload("development");
        convert_workload(&mut workload, 4);

        assert_eq!(
            workload.containers[0].requests.get(labels::RESOURCE_WHOLE_GPU),
            Some(&1)
        );
        assert_eq!(
            workload.node_selector.get(labels::LABEL_TS_ENABLED),
            Some(&"true".to_string())
        );
        assert_eq!(
            workload.annotation(labels::ANNOTATION_TIMESLICE_REPLICAS),
            Some("4")
        );
        assert_eq!(workload.tolerations.len(), 1);
        assert_eq!(workload.tolerations[0].key, labels::TAINT_TIMESLICING);

        // Converting again must not duplicate the toleration
        convert_workload(&mut workload, 4);
        assert_eq!(workload.tolerations.len(), 1);
    }

    #[test]
    fn test_capability_defaults_to_gpu_presence() {
        let mut node = Node::new("n");
        assert!(!is_capable(&node));

        node.capacity.insert(labels::RESOURCE_WHOLE_GPU.into(), 4);
        assert!(is_capable(&node));

        node.labels
            .insert(labels::LABEL_TS_CAPABLE.into(), "false".into());
        assert!(!is_capable(&node));
    }

    #[test]
    fn test_savings_scale_with_replicas() {
        let estimate = estimate_savings(&[gpu_workload("batch")], 4);
        assert_eq!(estimate.eligible_workloads, 1);
        assert!((estimate.potential_saved_gpus - 0.75).abs() < 1e-9);

        let estimate = estimate_savings(&[gpu_workload("batch")], 2);
        assert!((estimate.potential_saved_gpus - 0.5).abs() < 1e-9);
    }
}
