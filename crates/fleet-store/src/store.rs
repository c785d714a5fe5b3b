//! The cost persistence contract

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{PodCost, WorkloadRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// One persisted cost observation. Rows are keyed by
/// (minute bucket, workload namespace, workload name); writing a second
/// row into the same bucket updates `cumulative_cost` and `hourly_rate`
/// instead of duplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRow {
    pub time: DateTime<Utc>,
    pub workload: WorkloadRef,
    pub node: String,
    pub gpu_type: String,
    pub gpu_count: i64,
    pub capacity_class: String,
    pub sharing_mode: String,
    pub hourly_rate: f64,
    pub cumulative_cost: f64,
    pub team: String,
    pub project: String,
    pub experiment_id: String,
    pub cost_center: String,
    pub labels: BTreeMap<String, String>,
}

impl CostRow {
    /// Build a row from a live cost record
    pub fn from_pod_cost(cost: &PodCost) -> Self {
        Self {
            time: cost.last_updated,
            workload: cost.workload.clone(),
            node: cost.node.clone(),
            gpu_type: cost.gpu_type.clone(),
            gpu_count: cost.gpu_count,
            capacity_class: cost.capacity_class.to_string(),
            sharing_mode: cost.sharing_mode.to_string(),
            hourly_rate: cost.hourly_rate,
            cumulative_cost: cost.total_cost,
            team: cost.team.clone(),
            project: cost.project.clone(),
            experiment_id: cost.experiment_id.clone(),
            cost_center: cost.cost_center.clone(),
            labels: cost.labels.clone(),
        }
    }

    /// The row's minute bucket (seconds truncated)
    pub fn minute_bucket(&self) -> i64 {
        self.time.timestamp() / 60
    }
}

/// Scope of a cost query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CostScope {
    /// All rows in a namespace
    Namespace(String),
    /// All rows carrying a team label
    Team(String),
    /// One workload's rows (used to resume accrual after restart)
    Workload(WorkloadRef),
}

/// A point in an hourly cost series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub bucket: DateTime<Utc>,
    pub avg_hourly_rate: f64,
    pub max_cumulative_cost: f64,
}

/// A point in a per-day cost series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPoint {
    pub day: DateTime<Utc>,
    pub cost: f64,
    pub avg_gpus: f64,
}

/// A recorded savings observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavingsRow {
    pub time: DateTime<Utc>,
    pub namespace: String,
    /// Which lever produced the savings: spot, sharing, autoscaling, waste
    pub optimization_type: String,
    pub savings_amount: f64,
    pub baseline_cost: f64,
    pub actual_cost: f64,
}

/// A recorded budget state observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatePoint {
    pub time: DateTime<Utc>,
    pub budget: String,
    pub namespace: String,
    pub team: String,
    pub monthly_limit: f64,
    pub current_spend: f64,
    pub percentage_used: f64,
    pub state: String,
}

/// Write-and-aggregate interface to the time-series cost store
#[async_trait]
pub trait CostStore: Send + Sync {
    /// Upsert one cost row (deduped by minute-bucket composite key)
    async fn insert_pod_cost(&self, row: CostRow) -> Result<()>;

    /// Total spend for a scope over [start, end]: the sum over covered
    /// workloads of each workload's latest cumulative cost in range
    async fn query_cost(
        &self,
        scope: &CostScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64>;

    /// Hourly series for a namespace over the trailing `hours`
    async fn hourly_series(&self, namespace: &str, hours: u32) -> Result<Vec<SeriesPoint>>;

    /// Per-namespace daily series over the trailing `days`
    async fn daily_series(&self, days: u32) -> Result<HashMap<String, Vec<DailyPoint>>>;

    /// Record a savings observation
    async fn record_savings(&self, row: SavingsRow) -> Result<()>;

    /// Total savings by optimization type over [start, end]
    async fn total_savings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>>;

    /// Append a budget state observation
    async fn upsert_budget_state(&self, point: BudgetStatePoint) -> Result<()>;

    /// Budget state history over the trailing `days`
    async fn budget_history(&self, budget: &str, days: u32) -> Result<Vec<BudgetStatePoint>>;
}
