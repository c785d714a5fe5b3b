//! Declared configuration objects for gpufleet
//!
//! These are the cluster-scoped objects operators write and the controller
//! reconciles: autoscaling policies with their node pools, GPU sharing
//! policies, per-node sharing configuration, cost attributions, and cost
//! budgets. Each carries a spec (desired) and a status (observed) and
//! round-trips through serde using the same field names as its JSON shape.

use crate::types::{CapacityClass, SharingMode, Workload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// AutoscalingPolicy drives the decision engine for a set of GPU nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingPolicy {
    pub name: String,
    pub spec: AutoscalingPolicySpec,
    #[serde(default)]
    pub status: AutoscalingPolicyStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalingPolicySpec {
    pub enabled: bool,

    /// Cloud provider backing this policy's pools (aws, gcp, azure)
    pub provider: String,

    /// GPU utilization above which the cluster scales up (0-1)
    pub scale_up_threshold: f64,

    /// GPU utilization below which the cluster may scale down (0-1)
    pub scale_down_threshold: f64,

    /// Minimum interval between consecutive scale-ups, seconds
    pub scale_up_cooldown_seconds: u64,

    /// Minimum interval between consecutive scale-downs, seconds
    pub scale_down_cooldown_seconds: u64,

    /// Age a pending GPU workload must reach before it alone triggers a
    /// scale-up, seconds
    pub pending_workload_timeout_seconds: u64,

    pub min_nodes: u32,
    pub max_nodes: u32,

    /// Target share of spot capacity across in-scope nodes (0-1)
    pub spot_percentage: f64,

    pub enable_spot_instances: bool,
    pub enable_multi_tier_scaling: bool,
    pub enable_predictive_scaling: bool,

    /// Node pools in declared order; the first pool matching a chosen
    /// capacity class wins
    pub node_pools: Vec<NodePoolSpec>,

    /// Restricts which nodes this policy covers (empty = all GPU nodes)
    pub node_selector: BTreeMap<String, String>,
}

impl Default for AutoscalingPolicySpec {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "aws".to_string(),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_cooldown_seconds: 180,
            scale_down_cooldown_seconds: 600,
            pending_workload_timeout_seconds: 120,
            min_nodes: 0,
            max_nodes: 100,
            spot_percentage: 0.6,
            enable_spot_instances: true,
            enable_multi_tier_scaling: true,
            enable_predictive_scaling: false,
            node_pools: Vec::new(),
            node_selector: BTreeMap::new(),
        }
    }
}

impl AutoscalingPolicySpec {
    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_up_cooldown_seconds)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_down_cooldown_seconds)
    }

    pub fn pending_workload_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_workload_timeout_seconds)
    }

    pub fn pool(&self, name: &str) -> Option<&NodePoolSpec> {
        self.node_pools.iter().find(|p| p.name == name)
    }

    /// First declared pool with the given capacity class. Falls back to
    /// the first pool, then to "default" when none are declared.
    pub fn preferred_pool(&self, class: CapacityClass) -> String {
        self.node_pools
            .iter()
            .find(|p| p.capacity_class == class)
            .or_else(|| self.node_pools.first())
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "default".to_string())
    }
}

/// A node pool declaration embedded in an autoscaling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodePoolSpec {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub gpu_type: String,

    /// Instance classes in preference order, for spot diversification
    pub instance_types: Vec<String>,

    pub capacity_class: CapacityClass,

    /// Target spot share within this pool (0-1)
    pub spot_percentage: f64,

    /// Higher priority pools are preferred
    pub priority: i32,

    pub labels: BTreeMap<String, String>,
    pub taints: Vec<TaintSpec>,
    pub availability_zones: Vec<String>,
}

impl Default for NodePoolSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            min_size: 0,
            max_size: 100,
            gpu_type: String::new(),
            instance_types: Vec::new(),
            capacity_class: CapacityClass::OnDemand,
            spot_percentage: 0.6,
            priority: 0,
            labels: BTreeMap::new(),
            taints: Vec::new(),
            availability_zones: Vec::new(),
        }
    }
}

/// A taint applied to nodes of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintSpec {
    pub key: String,
    pub value: String,
    pub effect: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalingPolicyStatus {
    pub current_nodes: u32,
    pub desired_nodes: u32,
    pub spot_nodes: u32,
    pub on_demand_nodes: u32,
    pub reserved_nodes: u32,
    pub average_gpu_utilization: f64,
    pub pending_workloads: u32,
    pub last_scale_up_time: Option<DateTime<Utc>>,
    pub last_scale_down_time: Option<DateTime<Utc>>,
    pub last_scaling_action: Option<String>,
    pub last_scaling_reason: Option<String>,
    pub spot_interruptions: u32,
    pub estimated_monthly_cost: f64,
    pub estimated_monthly_savings: f64,
    pub predictive: Option<PredictiveStatus>,
    pub conditions: Vec<StatusCondition>,
}

/// Predictive scaling observations surfaced on the policy status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictiveStatus {
    pub enabled: bool,
    pub predicted_utilization: f64,
    pub recommended_nodes: u32,
    pub confidence: f64,
    pub next_busy_period: Option<DateTime<Utc>>,
}

/// A status condition, used to surface configuration errors on objects
/// instead of retrying them silently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCondition {
    pub condition_type: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// GpuSharingPolicy selects workloads and declares a sharing strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSharingPolicy {
    pub name: String,
    pub spec: GpuSharingPolicySpec,
    #[serde(default)]
    pub status: GpuSharingPolicyStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSharingPolicySpec {
    pub strategy: SharingStrategy,

    /// Restricts which nodes the policy covers
    pub node_selector: BTreeMap<String, String>,

    /// Restricts which namespaces the policy covers (empty = all)
    pub namespaces: Vec<String>,

    /// Restricts which workloads the policy covers by label
    pub workload_selector: BTreeMap<String, String>,

    /// Higher priority policies are evaluated first
    pub priority: i32,

    pub mig: Option<MigPolicyConfig>,
    pub mps: Option<MpsPolicyConfig>,
    pub timeslicing: Option<TimeSlicingPolicyConfig>,
}

impl Default for GpuSharingPolicySpec {
    fn default() -> Self {
        Self {
            strategy: SharingStrategy::Auto,
            node_selector: BTreeMap::new(),
            namespaces: Vec::new(),
            workload_selector: BTreeMap::new(),
            priority: 0,
            mig: None,
            mps: None,
            timeslicing: None,
        }
    }
}

impl GpuSharingPolicySpec {
    /// Whether this policy covers the given workload
    pub fn matches(&self, workload: &Workload) -> bool {
        if !self.namespaces.is_empty() && !self.namespaces.contains(&workload.namespace) {
            return false;
        }
        self.workload_selector
            .iter()
            .all(|(k, v)| workload.labels.get(k) == Some(v))
    }
}

/// Declared sharing strategy; `Auto` defers to the rewriter's heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingStrategy {
    Mig,
    Mps,
    Timeslicing,
    Exclusive,
    Auto,
}

impl SharingStrategy {
    pub fn as_mode(&self) -> Option<SharingMode> {
        match self {
            SharingStrategy::Mig => Some(SharingMode::Mig),
            SharingStrategy::Mps => Some(SharingMode::Mps),
            SharingStrategy::Timeslicing => Some(SharingMode::Timeslicing),
            SharingStrategy::Exclusive => Some(SharingMode::Exclusive),
            SharingStrategy::Auto => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigPolicyConfig {
    /// Explicit profile; empty means auto-select the smallest fit
    pub profile: String,
    pub auto_select_profile: bool,
}

impl Default for MigPolicyConfig {
    fn default() -> Self {
        Self {
            profile: String::new(),
            auto_select_profile: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpsPolicyConfig {
    pub max_clients: u32,
    pub default_active_threads: u32,
    pub memory_limit_mb: u64,
}

impl Default for MpsPolicyConfig {
    fn default() -> Self {
        Self {
            max_clients: 16,
            default_active_threads: 100,
            memory_limit_mb: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSlicingPolicyConfig {
    pub replicas_per_gpu: u32,
    pub slice_ms: u32,
    pub fairness_mode: FairnessMode,
}

impl Default for TimeSlicingPolicyConfig {
    fn default() -> Self {
        Self {
            replicas_per_gpu: 4,
            slice_ms: 100,
            fairness_mode: FairnessMode::RoundRobin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FairnessMode {
    #[serde(rename = "roundrobin")]
    RoundRobin,
    Priority,
    Weighted,
}

impl FairnessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FairnessMode::RoundRobin => "roundrobin",
            FairnessMode::Priority => "priority",
            FairnessMode::Weighted => "weighted",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSharingPolicyStatus {
    pub applied_workloads: u64,
    pub last_update_time: Option<DateTime<Utc>>,
}

/// GpuNodeConfig declares the target sharing-mode setup for one node.
/// The controller writes enablement labels and annotations; a node-level
/// device agent performs the actual hardware programming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuNodeConfig {
    pub name: String,
    pub spec: GpuNodeConfigSpec,
    #[serde(default)]
    pub status: GpuNodeConfigStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuNodeConfigSpec {
    pub node_name: String,
    pub mig_enabled: bool,
    pub mig_profiles: Vec<String>,
    pub mps_enabled: bool,
    pub mps_max_clients: u32,
    pub timeslicing_enabled: bool,
    pub timeslicing_replicas: u32,
}

impl Default for GpuNodeConfigSpec {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            mig_enabled: false,
            mig_profiles: Vec::new(),
            mps_enabled: false,
            mps_max_clients: 16,
            timeslicing_enabled: false,
            timeslicing_replicas: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuNodeConfigStatus {
    pub phase: NodeConfigPhase,
    pub message: String,
    pub last_update_time: Option<DateTime<Utc>>,
    pub mig: Option<MigStatus>,
    pub mps: Option<MpsStatus>,
    pub timeslicing: Option<TimeSlicingStatus>,
    pub conditions: Vec<StatusCondition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeConfigPhase {
    #[default]
    Pending,
    Configuring,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigStatus {
    pub enabled: bool,
    pub configured_profiles: Vec<String>,
    pub available_devices: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MpsStatus {
    pub enabled: bool,
    pub active_clients: u32,
    pub max_clients: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSlicingStatus {
    pub enabled: bool,
    pub physical_gpus: u32,
    pub virtual_gpus: u32,
    pub replicas_per_gpu: u32,
}

/// CostAttribution tracks spend for a slice of the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAttribution {
    pub name: String,
    pub spec: CostAttributionSpec,
    #[serde(default)]
    pub status: CostAttributionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostAttributionSpec {
    pub namespace: String,
    pub team: String,
    pub project: String,
    pub experiment_id: String,
    pub cost_center: String,
    pub labels: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,

    /// Days of history retained in status time series
    pub retention_days: u32,
}

impl Default for CostAttributionSpec {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            team: String::new(),
            project: String::new(),
            experiment_id: String::new(),
            cost_center: String::new(),
            labels: BTreeMap::new(),
            tags: BTreeMap::new(),
            retention_days: 30,
        }
    }
}

impl CostAttributionSpec {
    /// Whether this attribution covers the given workload
    pub fn matches(&self, workload: &Workload) -> bool {
        use crate::labels as schema;

        if !self.namespace.is_empty() && workload.namespace != self.namespace {
            return false;
        }
        if !self.team.is_empty() && workload.label(schema::LABEL_TEAM) != Some(&self.team) {
            return false;
        }
        if !self.project.is_empty() && workload.label(schema::LABEL_PROJECT) != Some(&self.project)
        {
            return false;
        }
        if !self.experiment_id.is_empty()
            && workload.label(schema::LABEL_EXPERIMENT_ID) != Some(&self.experiment_id)
        {
            return false;
        }
        if !self.cost_center.is_empty()
            && workload.label(schema::LABEL_COST_CENTER) != Some(&self.cost_center)
        {
            return false;
        }
        for (k, v) in self.labels.iter().chain(self.tags.iter()) {
            if workload.labels.get(k) != Some(v) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostAttributionStatus {
    pub total_cost: f64,
    pub daily_cost: f64,
    pub monthly_cost: f64,
    pub hourly_cost: f64,
    pub active_workloads: u32,
    pub active_gpus: u32,
    pub gpu_hours: f64,
    pub cost_per_gpu_hour: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub breakdown: DetailedBreakdown,
    pub savings: SavingsData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailedBreakdown {
    pub by_workload: BTreeMap<String, WorkloadCostInfo>,
    pub by_gpu_type: BTreeMap<String, f64>,
    pub by_capacity_class: BTreeMap<String, f64>,
    pub by_node: BTreeMap<String, f64>,
    pub by_hour: Vec<TimeBucketCost>,
    pub by_day: Vec<TimeBucketCost>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadCostInfo {
    pub name: String,
    pub gpu_type: String,
    pub gpu_count: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub cost: f64,
    pub hourly_rate: f64,
    pub capacity_class: String,
    pub sharing_mode: String,
    pub node: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeBucketCost {
    pub bucket: Option<DateTime<Utc>>,
    pub cost: f64,
    pub gpu_hours: f64,
}

/// Itemized savings attributed to each optimization lever
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingsData {
    pub total_savings: f64,
    pub spot_savings: f64,
    pub sharing_savings: f64,
    pub autoscaling_savings: f64,
    pub waste_eliminated: f64,
    pub baseline_cost: f64,
    pub savings_percentage: f64,
}

/// CostBudget caps monthly spend for a scope, with alerting and
/// enforcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBudget {
    pub name: String,
    pub spec: CostBudgetSpec,
    #[serde(default)]
    pub status: CostBudgetStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostBudgetSpec {
    /// Maximum spend per month in currency units
    pub monthly_limit: f64,

    pub scope: BudgetScope,

    /// Threshold alerts in declared order
    pub alerts: Vec<BudgetAlert>,

    pub enforcement: Option<BudgetEnforcement>,

    /// Budget period start; defaults to the start of the current month
    pub start_date: Option<DateTime<Utc>>,

    pub enabled: bool,
}

impl Default for CostBudgetSpec {
    fn default() -> Self {
        Self {
            monthly_limit: 0.0,
            scope: BudgetScope::default(),
            alerts: Vec::new(),
            enforcement: None,
            start_date: None,
            enabled: true,
        }
    }
}

/// Predicate over workloads defining what counts against a budget
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetScope {
    pub namespaces: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub experiment_id: String,
    pub teams: Vec<String>,
}

impl BudgetScope {
    /// Whether this scope covers the given workload
    pub fn matches(&self, workload: &Workload) -> bool {
        use crate::labels as schema;

        if !self.namespaces.is_empty() && !self.namespaces.contains(&workload.namespace) {
            return false;
        }
        for (k, v) in &self.labels {
            if workload.labels.get(k) != Some(v) {
                return false;
            }
        }
        if !self.experiment_id.is_empty()
            && workload.label(schema::LABEL_EXPERIMENT_ID) != Some(&self.experiment_id)
        {
            return false;
        }
        if !self.teams.is_empty() {
            let team = workload.label(schema::LABEL_TEAM).unwrap_or_default();
            if !self.teams.iter().any(|t| t == team) {
                return false;
            }
        }
        true
    }

    /// A scope with no criteria covers everything
    pub fn is_unbounded(&self) -> bool {
        self.namespaces.is_empty()
            && self.labels.is_empty()
            && self.experiment_id.is_empty()
            && self.teams.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub name: String,

    /// Fires when percentage used reaches this value (e.g. 80)
    pub threshold_percent: f64,

    pub channels: Vec<AlertChannelSpec>,

    #[serde(default)]
    pub severity: AlertSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertChannelSpec {
    pub kind: AlertChannelKind,

    /// Channel configuration (webhook url, email address, ...)
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    /// Sensitive config values resolved by key from the secret store;
    /// maps a config key to the secret key holding its value
    #[serde(default)]
    pub secret_refs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertChannelKind {
    Webhook,
    Slack,
    Pagerduty,
    Email,
}

impl AlertChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertChannelKind::Webhook => "webhook",
            AlertChannelKind::Slack => "slack",
            AlertChannelKind::Pagerduty => "pagerduty",
            AlertChannelKind::Email => "email",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetEnforcement {
    pub action: EnforcementAction,

    /// How long a budget may stay exceeded before enforcement applies
    pub grace_period_minutes: u64,

    pub throttle: Option<ThrottleSpec>,
}

impl Default for BudgetEnforcement {
    fn default() -> Self {
        Self {
            action: EnforcementAction::Alert,
            grace_period_minutes: 60,
            throttle: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    #[default]
    Alert,
    Throttle,
    Block,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSpec {
    /// Cap on spot GPU nodes while throttling
    pub max_spot_instances: Option<u32>,

    /// Zero out spot pools entirely while throttling
    pub block_spot_creation: bool,

    /// Prefer on-demand over spot while throttling
    pub prefer_on_demand: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostBudgetStatus {
    pub current_spend: f64,
    pub percentage_used: f64,
    pub state: BudgetState,
    pub projected_monthly_spend: f64,
    pub days_remaining: u32,
    pub alerts_fired: Vec<AlertFired>,
    pub enforcement_active: bool,

    /// Wall-clock time the budget first crossed 100%; cleared when it
    /// returns below
    pub exceeded_since: Option<DateTime<Utc>>,

    pub last_updated: Option<DateTime<Utc>>,
    pub breakdown: CostBreakdown,

    /// Declared pool bounds saved before throttling, restored on revert
    pub throttled_pools: Vec<PoolBoundsSnapshot>,

    pub conditions: Vec<StatusCondition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetState {
    #[default]
    Ok,
    Warning,
    Exceeded,
}

impl BudgetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetState::Ok => "ok",
            BudgetState::Warning => "warning",
            BudgetState::Exceeded => "exceeded",
        }
    }

    /// Classify a percentage of the monthly limit
    pub fn classify(percentage: f64) -> Self {
        if percentage >= 100.0 {
            BudgetState::Exceeded
        } else if percentage >= 80.0 {
            BudgetState::Warning
        } else {
            BudgetState::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertFired {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub threshold: f64,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostBreakdown {
    pub by_namespace: BTreeMap<String, f64>,
    pub by_team: BTreeMap<String, f64>,
    pub by_gpu_type: BTreeMap<String, f64>,
    pub by_capacity_class: BTreeMap<String, f64>,
}

/// Declared pool bounds captured before a throttle mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolBoundsSnapshot {
    pub policy: String,
    pub pool: String,
    pub min_size: u32,
    pub max_size: u32,
}

/// Config object written by budget `block` enforcement and read by the
/// admission guard; the rewriter itself never rejects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionGuardConfig {
    /// Scopes whose new GPU workloads are rejected
    pub blocked_scopes: Vec<BlockedScope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedScope {
    pub budget: String,
    pub scope: BudgetScope,
}

impl AdmissionGuardConfig {
    /// The budget blocking this workload, if any
    pub fn blocking_budget(&self, workload: &Workload) -> Option<&str> {
        self.blocked_scopes
            .iter()
            .find(|b| b.scope.matches(workload))
            .map(|b| b.budget.as_str())
    }
}
