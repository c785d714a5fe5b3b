//! Hardware partition (MIG) profiles and mutations
//!
//! Profiles cover the 40 GiB and 80 GiB device classes with compute unit
//! counts in {1, 2, 3, 4, 7}. Selection picks the smallest profile whose
//! compute units and memory both satisfy the request.

use fleet_core::{labels, Error, Node, Result, Workload};
use std::collections::BTreeMap;
use tracing::debug;

/// One hardware partition profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigProfile {
    pub name: &'static str,
    /// GPU slices this profile occupies
    pub slice_count: u32,
    /// Partition memory in MB
    pub memory_mb: i64,
    /// Compute units (fraction of the device's 7)
    pub compute_units: i64,
}

/// The supported profile table: 40 GiB device class first, then 80 GiB
pub const SUPPORTED_PROFILES: [MigProfile; 10] = [
    MigProfile { name: "1g.5gb", slice_count: 1, memory_mb: 5_120, compute_units: 1 },
    MigProfile { name: "2g.10gb", slice_count: 2, memory_mb: 10_240, compute_units: 2 },
    MigProfile { name: "3g.20gb", slice_count: 3, memory_mb: 20_480, compute_units: 3 },
    MigProfile { name: "4g.20gb", slice_count: 4, memory_mb: 20_480, compute_units: 4 },
    MigProfile { name: "7g.40gb", slice_count: 7, memory_mb: 40_960, compute_units: 7 },
    MigProfile { name: "1g.10gb", slice_count: 1, memory_mb: 10_240, compute_units: 1 },
    MigProfile { name: "2g.20gb", slice_count: 2, memory_mb: 20_480, compute_units: 2 },
    MigProfile { name: "3g.40gb", slice_count: 3, memory_mb: 40_960, compute_units: 3 },
    MigProfile { name: "4g.40gb", slice_count: 4, memory_mb: 40_960, compute_units: 4 },
    MigProfile { name: "7g.80gb", slice_count: 7, memory_mb: 81_920, compute_units: 7 },
];

impl MigProfile {
    /// The resource key the device plugin exposes for this profile
    pub fn resource_key(&self) -> String {
        labels::partition_resource_key(self.name)
    }

    /// Look up a profile by name
    pub fn by_name(name: &str) -> Option<&'static MigProfile> {
        SUPPORTED_PROFILES.iter().find(|p| p.name == name)
    }
}

/// Select the smallest profile satisfying a GPU count and memory request
/// (memory in bytes)
pub fn select_profile(gpu_request: i64, memory_request: i64) -> Result<&'static MigProfile> {
    let memory_mb = memory_request / (1024 * 1024);
    SUPPORTED_PROFILES
        .iter()
        .find(|p| p.compute_units >= gpu_request && p.memory_mb >= memory_mb)
        .ok_or_else(|| {
            Error::admission(format!(
                "no suitable partition profile for GPUs={}, memory={}MB",
                gpu_request, memory_mb
            ))
        })
}

/// Whether a node advertises hardware partitioning capability
pub fn is_capable(node: &Node) -> bool {
    node.label(labels::LABEL_MIG_CAPABLE) == Some("true")
}

/// Rewrite a workload's containers to request a partition instead of
/// whole GPUs. The original whole-GPU count is preserved in an
/// annotation for auditing.
pub fn convert_workload(workload: &mut Workload, profile: &MigProfile) {
    let original_gpus = labels::whole_gpu_request(workload);

    workload.annotations.insert(
        labels::ANNOTATION_ORIGINAL_GPU_REQUEST.to_string(),
        original_gpus.to_string(),
    );
    workload.annotations.insert(
        labels::ANNOTATION_MIG_PROFILE.to_string(),
        profile.name.to_string(),
    );

    let key = profile.resource_key();
    for container in workload.containers.iter_mut() {
        if container.requests.remove(labels::RESOURCE_WHOLE_GPU).is_some() {
            container.limits.remove(labels::RESOURCE_WHOLE_GPU);
            container.requests.insert(key.clone(), 1);
            container.limits.insert(key.clone(), 1);
        }
    }

    debug!(
        workload = %workload.workload_ref(),
        profile = profile.name,
        original_gpus,
        "converted workload to hardware partition"
    );
}

/// Node labels and annotations that ask the device agent to program the
/// given profiles
pub fn node_enablement(profiles: &[String]) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut node_labels = BTreeMap::new();
    let mut node_annotations = BTreeMap::new();

    let config = profiles.join(",");
    node_annotations.insert(labels::ANNOTATION_MIG_CONFIG.to_string(), config.clone());
    node_annotations.insert(
        labels::ANNOTATION_MIG_CONFIG_STATE.to_string(),
        "pending".to_string(),
    );
    node_labels.insert(
        labels::ANNOTATION_MIG_CONFIG.to_string(),
        config.replace('.', "-"),
    );

    (node_labels, node_annotations)
}

/// Estimated savings from partitioning eligible workloads.
/// Seven single-slice partitions share one physical device, so each
/// eligible workload frees 6/7 of a GPU.
pub fn estimate_savings(workloads: &[Workload]) -> SavingsEstimate {
    let mut estimate = SavingsEstimate::default();

    for workload in workloads {
        let gpus = labels::whole_gpu_request(workload);
        if gpus == 0 {
            continue;
        }
        estimate.total_workloads += 1;

        let memory = labels::total_memory_request(workload);
        if gpus == 1 && memory < 20 * 1024 * 1024 * 1024 {
            estimate.eligible_workloads += 1;
            estimate.potential_saved_gpus += 6.0 / 7.0;
        }
    }

    if estimate.total_workloads > 0 {
        estimate.savings_percentage =
            estimate.potential_saved_gpus / estimate.total_workloads as f64 * 100.0;
    }
    estimate
}

/// Savings analysis shared by the three strategy estimators
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavingsEstimate {
    pub total_workloads: u32,
    pub eligible_workloads: u32,
    pub potential_saved_gpus: f64,
    pub savings_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::types::Container;

    const GIB: i64 = 1024 * 1024 * 1024;

    #[test]
    fn test_profile_table_is_complete() {
        assert_eq!(SUPPORTED_PROFILES.len(), 10);
        for profile in &SUPPORTED_PROFILES {
            assert!(labels::is_partition_profile(profile.name));
        }
    }

    #[test]
    fn test_smallest_fit_selection() {
        // 1 GPU, 8 GiB: 1g.5gb is too small on memory, 2g.10gb fits
        let profile = select_profile(1, 8 * GIB).unwrap();
        assert_eq!(profile.name, "2g.10gb");

        // 1 GPU, 4 GiB: smallest profile fits
        assert_eq!(select_profile(1, 4 * GIB).unwrap().name, "1g.5gb");

        // 3 compute units, 16 GiB
        assert_eq!(select_profile(3, 16 * GIB).unwrap().name, "3g.20gb");

        // Memory beyond the 40 GiB class lands in the 80 GiB class
        assert_eq!(select_profile(1, 60 * GIB).unwrap().name, "7g.80gb");
    }

    #[test]
    fn test_oversized_request_has_no_profile() {
        assert!(select_profile(8, 100 * GIB).is_err());
    }

    #[test]
    fn test_convert_workload_swaps_resource_keys() {
        let mut workload = Workload {
            name: "infer".into(),
            namespace: "ml".into(),
            containers: vec![Container {
                name: "main".into(),
                requests: [
                    (labels::RESOURCE_WHOLE_GPU.to_string(), 1),
                    (labels::RESOURCE_MEMORY.to_string(), 8 * GIB),
                ]
                .into(),
                limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), 1)].into(),
            }],
            ..Default::default()
        };

        let profile = select_profile(1, 8 * GIB).unwrap();
        convert_workload(&mut workload, profile);

        let container = &workload.containers[0];
        assert!(!container.requests.contains_key(labels::RESOURCE_WHOLE_GPU));
        assert!(!container.limits.contains_key(labels::RESOURCE_WHOLE_GPU));
        assert_eq!(container.requests.get("nvidia.com/mig-2g.10gb"), Some(&1));
        assert_eq!(container.limits.get("nvidia.com/mig-2g.10gb"), Some(&1));
        assert_eq!(
            workload.annotation(labels::ANNOTATION_ORIGINAL_GPU_REQUEST),
            Some("1")
        );
        assert_eq!(workload.annotation(labels::ANNOTATION_MIG_PROFILE), Some("2g.10gb"));
    }

    #[test]
    fn test_savings_estimate() {
        let small = Workload {
            name: "small".into(),
            namespace: "ml".into(),
            containers: vec![Container {
                name: "main".into(),
                requests: [
                    (labels::RESOURCE_WHOLE_GPU.to_string(), 1),
                    (labels::RESOURCE_MEMORY.to_string(), 8 * GIB),
                ]
                .into(),
                limits: BTreeMap::new(),
            }],
            ..Default::default()
        };
        let big = Workload {
            name: "big".into(),
            namespace: "ml".into(),
            containers: vec![Container {
                name: "main".into(),
                requests: [
                    (labels::RESOURCE_WHOLE_GPU.to_string(), 4),
                    (labels::RESOURCE_MEMORY.to_string(), 64 * GIB),
                ]
                .into(),
                limits: BTreeMap::new(),
            }],
            ..Default::default()
        };

        let estimate = estimate_savings(&[small, big]);
        assert_eq!(estimate.total_workloads, 2);
        assert_eq!(estimate.eligible_workloads, 1);
        assert!((estimate.potential_saved_gpus - 6.0 / 7.0).abs() < 1e-9);
    }
}
