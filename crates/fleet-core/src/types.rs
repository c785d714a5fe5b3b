//! Core type definitions for gpufleet
//!
//! Observed cluster entities (nodes, workloads) and the enums shared by
//! every reconciler. The controller never owns these objects: nodes and
//! workloads are read through the cluster runtime and only their
//! annotations, labels, cordon flag, and (at admission) resource requests
//! are mutated.

use crate::labels;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource requests/limits by resource key. GPU counts are whole units,
/// memory is in bytes.
pub type ResourceMap = BTreeMap<String, i64>;

/// Capacity class of a node, in cloud vocabulary: spot capacity is cheap
/// but reclaimable, on-demand is guaranteed, reserved is long-term
/// committed baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityClass {
    Spot,
    OnDemand,
    Reserved,
}

impl CapacityClass {
    /// Scheduling preference when selecting capacity for new nodes.
    /// Reserved is accepted but ranks below on-demand unless a pool
    /// explicitly requests it.
    pub fn selection_rank(&self) -> u8 {
        match self {
            CapacityClass::Spot => 0,
            CapacityClass::OnDemand => 1,
            CapacityClass::Reserved => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityClass::Spot => "spot",
            CapacityClass::OnDemand => "on-demand",
            CapacityClass::Reserved => "reserved",
        }
    }
}

impl std::str::FromStr for CapacityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spot" | "preemptible" => Ok(CapacityClass::Spot),
            "on-demand" | "ondemand" | "regular" => Ok(CapacityClass::OnDemand),
            "reserved" | "committed" => Ok(CapacityClass::Reserved),
            _ => Err(format!("Unknown capacity class: {}", s)),
        }
    }
}

impl fmt::Display for CapacityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a workload shares (or does not share) a physical GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// Hardware partitioning into isolated MIG slices
    Mig,
    /// Process multiplexing via the CUDA multi-process service
    Mps,
    /// Temporal multiplexing in short scheduler quanta
    Timeslicing,
    /// The workload owns its whole GPUs
    Exclusive,
}

impl SharingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharingMode::Mig => "mig",
            SharingMode::Mps => "mps",
            SharingMode::Timeslicing => "timeslicing",
            SharingMode::Exclusive => "exclusive",
        }
    }

    /// Cost-rate multiplier for this mode. MIG slices are isolated and
    /// billed at their full fraction; MPS and time-slicing conservatively
    /// split a GPU four ways unless an explicit client/replica count is
    /// known.
    pub fn default_sharing_factor(&self) -> f64 {
        match self {
            SharingMode::Mig | SharingMode::Exclusive => 1.0,
            SharingMode::Mps | SharingMode::Timeslicing => 0.25,
        }
    }
}

impl std::str::FromStr for SharingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mig" => Ok(SharingMode::Mig),
            "mps" => Ok(SharingMode::Mps),
            "timeslicing" | "time-slicing" => Ok(SharingMode::Timeslicing),
            "exclusive" => Ok(SharingMode::Exclusive),
            _ => Err(format!("Unknown sharing mode: {}", s)),
        }
    }
}

impl fmt::Display for SharingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload class declared via the `workload-type` label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadClass {
    Training,
    Inference,
    Serving,
    Batch,
    Development,
    Unknown,
}

impl std::str::FromStr for WorkloadClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "training" => Ok(WorkloadClass::Training),
            "inference" => Ok(WorkloadClass::Inference),
            "serving" => Ok(WorkloadClass::Serving),
            "batch" => Ok(WorkloadClass::Batch),
            "development" => Ok(WorkloadClass::Development),
            _ => Ok(WorkloadClass::Unknown),
        }
    }
}

impl fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadClass::Training => "training",
            WorkloadClass::Inference => "inference",
            WorkloadClass::Serving => "serving",
            WorkloadClass::Batch => "batch",
            WorkloadClass::Development => "development",
            WorkloadClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Eviction priority used when draining reclaimed spot nodes. High
/// priority workloads are evicted last and with the longest grace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPriority {
    Low,
    Medium,
    High,
}

impl EvictionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPriority::Low => "low",
            EvictionPriority::Medium => "medium",
            EvictionPriority::High => "high",
        }
    }
}

impl std::str::FromStr for EvictionPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(EvictionPriority::Low),
            "medium" => Ok(EvictionPriority::Medium),
            "high" => Ok(EvictionPriority::High),
            _ => Err(format!("Unknown eviction priority: {}", s)),
        }
    }
}

/// Observed lifecycle phase of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadPhase {
    Pending,
    Running,
    Terminal,
}

/// Namespaced identity of a workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A single container's resource shape within a workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,

    /// Requested resources by key (GPUs as counts, memory in bytes)
    #[serde(default)]
    pub requests: ResourceMap,

    /// Resource limits by key
    #[serde(default)]
    pub limits: ResourceMap,
}

/// Toleration allowing a workload onto tainted nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    pub operator: String,
    pub effect: String,
}

impl Toleration {
    /// A toleration matching any value of `key` via the Exists operator
    pub fn exists(key: impl Into<String>, effect: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: "Exists".to_string(),
            effect: effect.into(),
        }
    }
}

/// An observed workload (pod) in the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    pub phase: Option<WorkloadPhase>,

    /// Node placement; only valid while running or terminal
    pub node_name: Option<String>,

    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Scheduler priority scalar, if set
    pub priority: Option<i32>,

    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Workload {
    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_pending(&self) -> bool {
        self.phase == Some(WorkloadPhase::Pending)
    }

    pub fn is_running(&self) -> bool {
        self.phase == Some(WorkloadPhase::Running)
    }

    /// Workload class from the `workload-type` label, defaulting to unknown
    pub fn workload_class(&self) -> WorkloadClass {
        self.labels
            .get(labels::LABEL_WORKLOAD_TYPE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(WorkloadClass::Unknown)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

impl Default for WorkloadPhase {
    fn default() -> Self {
        WorkloadPhase::Pending
    }
}

/// An observed node in the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Whole-GPU and partition capacity by resource key
    #[serde(default)]
    pub capacity: ResourceMap,

    /// Cordoned nodes receive no new workloads
    #[serde(default)]
    pub unschedulable: bool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whole-GPU capacity of this node
    pub fn gpu_capacity(&self) -> i64 {
        self.capacity
            .get(labels::RESOURCE_WHOLE_GPU)
            .copied()
            .unwrap_or(0)
    }

    /// Whether the node exposes GPU capacity (whole or partitioned)
    pub fn has_gpus(&self) -> bool {
        self.gpu_capacity() > 0
            || self
                .capacity
                .keys()
                .any(|k| labels::is_partition_resource_key(k))
    }

    /// Capacity class from node labels, across the known conventions.
    /// Unlabeled GPU nodes are treated as guaranteed capacity.
    pub fn capacity_class(&self) -> CapacityClass {
        labels::capacity_class_of(&self.labels)
    }

    /// Node pool from the pool label, if any
    pub fn node_pool(&self) -> Option<&str> {
        self.labels.get(labels::LABEL_NODE_POOL).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A scaling operation the decision engine can take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    NoAction,
}

impl ScalingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale-up",
            ScalingAction::ScaleDown => "scale-down",
            ScalingAction::NoAction => "no-action",
        }
    }
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_class_parsing() {
        assert_eq!("spot".parse::<CapacityClass>().unwrap(), CapacityClass::Spot);
        assert_eq!(
            "preemptible".parse::<CapacityClass>().unwrap(),
            CapacityClass::Spot
        );
        assert_eq!(
            "on-demand".parse::<CapacityClass>().unwrap(),
            CapacityClass::OnDemand
        );
        assert_eq!(
            "committed".parse::<CapacityClass>().unwrap(),
            CapacityClass::Reserved
        );
        assert!("premium".parse::<CapacityClass>().is_err());
    }

    #[test]
    fn test_capacity_class_selection_rank() {
        assert!(CapacityClass::Spot.selection_rank() < CapacityClass::OnDemand.selection_rank());
        assert!(
            CapacityClass::OnDemand.selection_rank() < CapacityClass::Reserved.selection_rank()
        );
    }

    #[test]
    fn test_sharing_factor_defaults() {
        assert_eq!(SharingMode::Exclusive.default_sharing_factor(), 1.0);
        assert_eq!(SharingMode::Mig.default_sharing_factor(), 1.0);
        assert_eq!(SharingMode::Mps.default_sharing_factor(), 0.25);
        assert_eq!(SharingMode::Timeslicing.default_sharing_factor(), 0.25);
    }

    #[test]
    fn test_workload_class_falls_back_to_unknown() {
        assert_eq!(
            "genomics".parse::<WorkloadClass>().unwrap(),
            WorkloadClass::Unknown
        );
        assert_eq!(
            "training".parse::<WorkloadClass>().unwrap(),
            WorkloadClass::Training
        );
    }

    #[test]
    fn test_eviction_priority_ordering() {
        assert!(EvictionPriority::Low < EvictionPriority::Medium);
        assert!(EvictionPriority::Medium < EvictionPriority::High);
    }

    #[test]
    fn test_workload_ref_display() {
        let r = WorkloadRef::new("ml-team", "trainer-0");
        assert_eq!(r.to_string(), "ml-team/trainer-0");
    }

    #[test]
    fn test_node_gpu_capacity() {
        let mut node = Node::new("gpu-node-1");
        assert!(!node.has_gpus());

        node.capacity
            .insert(labels::RESOURCE_WHOLE_GPU.to_string(), 8);
        assert_eq!(node.gpu_capacity(), 8);
        assert!(node.has_gpus());
    }
}
