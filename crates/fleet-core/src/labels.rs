//! Label, annotation, and resource-key schema for gpufleet
//!
//! Every string the controller reads from or writes onto cluster objects
//! is declared here, together with the helpers that interpret them. The
//! schema has three families: the controller's own `gpufleet.io/` keys,
//! the NVIDIA device-plugin keys it cooperates with, and the well-known
//! topology labels used to resolve region and zone.

use crate::types::{CapacityClass, EvictionPriority, SharingMode, Workload};
use std::collections::BTreeMap;

// Controller-owned node labels
pub const LABEL_NODE_POOL: &str = "gpufleet.io/node-pool";
pub const LABEL_INSTANCE_TYPE: &str = "gpufleet.io/instance-type";
pub const LABEL_CAPACITY_TYPE: &str = "gpufleet.io/capacity-type";
pub const LABEL_GPU_TYPE: &str = "gpufleet.io/gpu-type";

// Controller-owned workload labels (attribution)
pub const LABEL_WORKLOAD_TYPE: &str = "gpufleet.io/workload-type";
pub const LABEL_TEAM: &str = "team";
pub const LABEL_PROJECT: &str = "project";
pub const LABEL_EXPERIMENT_ID: &str = "experiment-id";
pub const LABEL_COST_CENTER: &str = "cost-center";

// Controller-owned workload annotations
pub const ANNOTATION_SHARING: &str = "gpufleet.io/sharing";
pub const ANNOTATION_SHARING_MODE: &str = "gpufleet.io/sharing-mode";
pub const ANNOTATION_EVICTION_PRIORITY: &str = "gpufleet.io/eviction-priority";
pub const ANNOTATION_OPTIMIZE: &str = "gpufleet.io/optimize";
pub const ANNOTATION_OPTIMIZED: &str = "gpufleet.io/optimized";
pub const ANNOTATION_OPTIMIZATION_STRATEGY: &str = "gpufleet.io/optimization-strategy";
pub const ANNOTATION_OPTIMIZATION_TIMESTAMP: &str = "gpufleet.io/optimization-timestamp";
pub const ANNOTATION_ORIGINAL_GPU_REQUEST: &str = "gpufleet.io/original-gpu-request";
pub const ANNOTATION_MIG_PROFILE: &str = "gpufleet.io/mig-profile";
pub const ANNOTATION_MPS_ENABLED: &str = "gpufleet.io/mps-enabled";
pub const ANNOTATION_MPS_CLIENTS: &str = "gpufleet.io/mps-clients";
pub const ANNOTATION_TIMESLICING_ENABLED: &str = "gpufleet.io/time-slicing-enabled";
pub const ANNOTATION_TIMESLICE_REPLICAS: &str = "gpufleet.io/timeslice-replicas";

// Controller-owned node annotations (spot reclamation)
pub const ANNOTATION_RECLAMATION_PENDING: &str = "gpufleet.io/reclamation-pending";
pub const ANNOTATION_RECLAMATION_DEADLINE: &str = "gpufleet.io/reclamation-deadline";

// NVIDIA device-plugin cooperation points
pub const RESOURCE_WHOLE_GPU: &str = "nvidia.com/gpu";
pub const RESOURCE_SHARED_GPU: &str = "nvidia.com/gpu.shared";
pub const RESOURCE_MIG_PREFIX: &str = "nvidia.com/mig-";
pub const RESOURCE_MEMORY: &str = "memory";

pub const LABEL_MIG_CAPABLE: &str = "nvidia.com/mig.capable";
pub const LABEL_MPS_CAPABLE: &str = "nvidia.com/mps.capable";
pub const LABEL_TS_CAPABLE: &str = "nvidia.com/time-slicing.capable";
pub const LABEL_MPS_ENABLED: &str = "nvidia.com/mps.enabled";
pub const LABEL_TS_ENABLED: &str = "nvidia.com/time-slicing.enabled";
pub const LABEL_TS_REPLICAS: &str = "nvidia.com/time-slicing.replicas";
pub const LABEL_GPU_PRODUCT: &str = "nvidia.com/gpu.product";

pub const ANNOTATION_MIG_CONFIG: &str = "nvidia.com/mig.config";
pub const ANNOTATION_MIG_CONFIG_STATE: &str = "nvidia.com/mig.config.state";
pub const ANNOTATION_NODE_MPS: &str = "nvidia.com/mps";
pub const ANNOTATION_NODE_MPS_MAX_CLIENTS: &str = "nvidia.com/mps.max-clients";
pub const ANNOTATION_NODE_MPS_ACTIVE_THREADS: &str = "nvidia.com/mps.active-threads";
pub const ANNOTATION_NODE_MPS_MEMORY_LIMIT: &str = "nvidia.com/mps.memory-limit";
pub const ANNOTATION_NODE_TS: &str = "nvidia.com/time-slicing";
pub const ANNOTATION_NODE_TS_REPLICAS: &str = "nvidia.com/time-slicing.replicas";
pub const ANNOTATION_NODE_TS_SLICE_MS: &str = "nvidia.com/time-slicing.slice-ms";
pub const ANNOTATION_NODE_TS_FAIRNESS: &str = "nvidia.com/time-slicing.fairness";
pub const TAINT_TIMESLICING: &str = "nvidia.com/time-slicing";

// Well-known topology and capacity labels on nodes, checked as fallbacks
pub const LABEL_TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";
pub const LABEL_TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_INSTANCE_TYPE_WELL_KNOWN: &str = "node.kubernetes.io/instance-type";
pub const LABEL_KARPENTER_CAPACITY: &str = "karpenter.sh/capacity-type";
pub const LABEL_GKE_PREEMPTIBLE: &str = "cloud.google.com/gke-preemptible";
pub const LABEL_AKS_PRIORITY: &str = "kubernetes.azure.com/scalesetpriority";
pub const LABEL_NODE_LIFECYCLE: &str = "node-lifecycle";
pub const LABEL_ACCELERATOR: &str = "accelerator";

/// Check whether a resource key names a hardware partition profile.
/// Valid keys look like `nvidia.com/mig-3g.20gb`: one to seven compute
/// slices and a memory size from the fixed profile table.
pub fn is_partition_resource_key(key: &str) -> bool {
    let Some(profile) = key.strip_prefix(RESOURCE_MIG_PREFIX) else {
        return false;
    };
    is_partition_profile(profile)
}

/// Check whether a string is a valid partition profile name
/// (`<slices>g.<mem>gb` with slices in 1..=7 and mem in the known sizes)
pub fn is_partition_profile(profile: &str) -> bool {
    let Some((slices, mem)) = profile.split_once("g.") else {
        return false;
    };
    let Some(mem_gb) = mem.strip_suffix("gb") else {
        return false;
    };
    matches!(slices, "1" | "2" | "3" | "4" | "5" | "6" | "7")
        && matches!(mem_gb, "5" | "10" | "20" | "40" | "80")
}

/// Resource key for a partition profile
pub fn partition_resource_key(profile: &str) -> String {
    format!("{}{}", RESOURCE_MIG_PREFIX, profile)
}

/// A workload counts as a GPU workload when any container requests the
/// whole-GPU key or any hardware-partition key.
pub fn is_gpu_workload(workload: &Workload) -> bool {
    workload.containers.iter().any(|c| {
        c.requests.contains_key(RESOURCE_WHOLE_GPU)
            || c.limits.contains_key(RESOURCE_WHOLE_GPU)
            || c.requests.keys().any(|k| is_partition_resource_key(k))
    })
}

/// Sum of whole-GPU requests across containers
pub fn whole_gpu_request(workload: &Workload) -> i64 {
    workload
        .containers
        .iter()
        .filter_map(|c| c.requests.get(RESOURCE_WHOLE_GPU))
        .sum()
}

/// GPU units for cost accounting: whole GPUs plus every recognized
/// partition and shared-GPU request.
pub fn billable_gpu_count(workload: &Workload) -> i64 {
    workload
        .containers
        .iter()
        .flat_map(|c| c.requests.iter())
        .filter(|(k, _)| {
            k.as_str() == RESOURCE_WHOLE_GPU
                || k.as_str() == RESOURCE_SHARED_GPU
                || is_partition_resource_key(k)
        })
        .map(|(_, v)| *v)
        .sum()
}

/// Sum of memory requests across containers, in bytes
pub fn total_memory_request(workload: &Workload) -> i64 {
    workload
        .containers
        .iter()
        .filter_map(|c| c.requests.get(RESOURCE_MEMORY))
        .sum()
}

/// Resolve the GPU type from node labels, falling through the known
/// conventions and defaulting to "unknown".
pub fn gpu_type_of(labels: &BTreeMap<String, String>) -> String {
    for key in [
        LABEL_GPU_PRODUCT,
        LABEL_GPU_TYPE,
        LABEL_ACCELERATOR,
        LABEL_INSTANCE_TYPE_WELL_KNOWN,
    ] {
        if let Some(v) = labels.get(key) {
            return v.clone();
        }
    }
    "unknown".to_string()
}

/// Resolve the capacity class from node labels across the provider
/// conventions. Unlabeled nodes are treated as guaranteed on-demand
/// capacity.
pub fn capacity_class_of(labels: &BTreeMap<String, String>) -> CapacityClass {
    if let Some(v) = labels.get(LABEL_CAPACITY_TYPE) {
        if let Ok(class) = v.parse() {
            return class;
        }
    }
    if let Some(v) = labels.get(LABEL_KARPENTER_CAPACITY) {
        if let Ok(class) = v.parse() {
            return class;
        }
    }
    if labels.get(LABEL_GKE_PREEMPTIBLE).map(String::as_str) == Some("true") {
        return CapacityClass::Spot;
    }
    if labels.get(LABEL_AKS_PRIORITY).map(String::as_str) == Some("spot") {
        return CapacityClass::Spot;
    }
    if labels.get(LABEL_NODE_LIFECYCLE).map(String::as_str) == Some("spot") {
        return CapacityClass::Spot;
    }
    CapacityClass::OnDemand
}

/// Resolve the region from node labels, defaulting to us-east-1
pub fn region_of(labels: &BTreeMap<String, String>) -> String {
    labels
        .get(LABEL_TOPOLOGY_REGION)
        .cloned()
        .unwrap_or_else(|| "us-east-1".to_string())
}

/// Resolve the zone from node labels, if present
pub fn zone_of(labels: &BTreeMap<String, String>) -> String {
    labels.get(LABEL_TOPOLOGY_ZONE).cloned().unwrap_or_default()
}

/// Resolve a workload's sharing mode: explicit annotation first, then the
/// shape of its resource requests, then the time-slicing annotation.
pub fn sharing_mode_of(workload: &Workload) -> SharingMode {
    if let Some(mode) = workload
        .annotation(ANNOTATION_SHARING_MODE)
        .and_then(|v| v.parse().ok())
    {
        return mode;
    }

    for container in &workload.containers {
        if container.requests.keys().any(|k| is_partition_resource_key(k)) {
            return SharingMode::Mig;
        }
        if container.requests.contains_key(RESOURCE_SHARED_GPU) {
            return SharingMode::Mps;
        }
    }

    if workload.annotation(ANNOTATION_TIMESLICING_ENABLED) == Some("true") {
        return SharingMode::Timeslicing;
    }

    SharingMode::Exclusive
}

/// Resolve a workload's eviction priority for spot drains. Resolution
/// order: explicit annotation, workload-class heuristic, scheduler
/// priority scalar, then medium.
pub fn eviction_priority_of(workload: &Workload) -> EvictionPriority {
    if let Some(p) = workload
        .annotation(ANNOTATION_EVICTION_PRIORITY)
        .and_then(|v| v.parse().ok())
    {
        return p;
    }

    use crate::types::WorkloadClass::*;
    match workload.workload_class() {
        Training => return EvictionPriority::High,
        Inference | Serving => return EvictionPriority::Medium,
        Development | Batch => return EvictionPriority::Low,
        Unknown => {}
    }

    if workload.priority.unwrap_or(0) > 1000 {
        return EvictionPriority::High;
    }

    EvictionPriority::Medium
}

/// Attribution labels copied verbatim onto cost records
pub fn attribution_labels(workload: &Workload) -> BTreeMap<String, String> {
    workload.labels.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Container, WorkloadClass};

    fn gpu_workload(gpus: i64) -> Workload {
        Workload {
            name: "w".into(),
            namespace: "ns".into(),
            containers: vec![Container {
                name: "main".into(),
                requests: [(RESOURCE_WHOLE_GPU.to_string(), gpus)].into(),
                limits: [(RESOURCE_WHOLE_GPU.to_string(), gpus)].into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_key_pattern() {
        assert!(is_partition_resource_key("nvidia.com/mig-1g.5gb"));
        assert!(is_partition_resource_key("nvidia.com/mig-7g.80gb"));
        assert!(is_partition_resource_key("nvidia.com/mig-3g.20gb"));
        assert!(!is_partition_resource_key("nvidia.com/gpu"));
        assert!(!is_partition_resource_key("nvidia.com/mig-8g.5gb"));
        assert!(!is_partition_resource_key("nvidia.com/mig-1g.7gb"));
        assert!(!is_partition_resource_key("nvidia.com/mig-1g5gb"));
    }

    #[test]
    fn test_gpu_workload_detection() {
        assert!(is_gpu_workload(&gpu_workload(1)));

        let mut mig = gpu_workload(0);
        mig.containers[0].requests.clear();
        mig.containers[0].limits.clear();
        mig.containers[0]
            .requests
            .insert("nvidia.com/mig-2g.10gb".into(), 1);
        assert!(is_gpu_workload(&mig));

        let mut plain = gpu_workload(0);
        plain.containers[0].requests.clear();
        plain.containers[0].limits.clear();
        assert!(!is_gpu_workload(&plain));
    }

    #[test]
    fn test_billable_gpu_count_includes_partitions() {
        let mut w = gpu_workload(2);
        w.containers[0]
            .requests
            .insert("nvidia.com/mig-1g.5gb".into(), 1);
        w.containers[0].requests.insert(RESOURCE_SHARED_GPU.into(), 1);
        assert_eq!(billable_gpu_count(&w), 4);
    }

    #[test]
    fn test_capacity_class_fallback_chain() {
        let mut labels = BTreeMap::new();
        assert_eq!(capacity_class_of(&labels), CapacityClass::OnDemand);

        labels.insert(LABEL_GKE_PREEMPTIBLE.into(), "true".into());
        assert_eq!(capacity_class_of(&labels), CapacityClass::Spot);

        labels.insert(LABEL_CAPACITY_TYPE.into(), "reserved".into());
        assert_eq!(capacity_class_of(&labels), CapacityClass::Reserved);
    }

    #[test]
    fn test_gpu_type_fallback_chain() {
        let mut labels = BTreeMap::new();
        assert_eq!(gpu_type_of(&labels), "unknown");

        labels.insert(LABEL_INSTANCE_TYPE_WELL_KNOWN.into(), "p3.2xlarge".into());
        assert_eq!(gpu_type_of(&labels), "p3.2xlarge");

        labels.insert(LABEL_GPU_PRODUCT.into(), "nvidia-tesla-v100".into());
        assert_eq!(gpu_type_of(&labels), "nvidia-tesla-v100");
    }

    #[test]
    fn test_sharing_mode_detection() {
        let mut w = gpu_workload(1);
        assert_eq!(sharing_mode_of(&w), SharingMode::Exclusive);

        w.annotations
            .insert(ANNOTATION_TIMESLICING_ENABLED.into(), "true".into());
        assert_eq!(sharing_mode_of(&w), SharingMode::Timeslicing);

        w.annotations
            .insert(ANNOTATION_SHARING_MODE.into(), "mps".into());
        assert_eq!(sharing_mode_of(&w), SharingMode::Mps);
    }

    #[test]
    fn test_eviction_priority_resolution_order() {
        let mut w = gpu_workload(1);
        assert_eq!(eviction_priority_of(&w), EvictionPriority::Medium);

        w.priority = Some(2000);
        assert_eq!(eviction_priority_of(&w), EvictionPriority::High);

        w.labels
            .insert(LABEL_WORKLOAD_TYPE.into(), "development".into());
        assert_eq!(w.workload_class(), WorkloadClass::Development);
        assert_eq!(eviction_priority_of(&w), EvictionPriority::Low);

        w.annotations
            .insert(ANNOTATION_EVICTION_PRIORITY.into(), "high".into());
        assert_eq!(eviction_priority_of(&w), EvictionPriority::High);
    }
}
