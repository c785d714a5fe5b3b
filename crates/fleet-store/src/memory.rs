//! In-memory reference implementation of the cost store
//!
//! An append-only table partitioned by minute bucket, with the same upsert
//! key as the durable store: (minute bucket, namespace, workload name).
//! Hourly aggregates are materialized lazily and reused for up to fifteen
//! minutes; a retention sweep prunes rows past the configured window.

use crate::store::{
    BudgetStatePoint, CostRow, CostScope, CostStore, DailyPoint, SavingsRow, SeriesPoint,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use fleet_core::WorkloadRef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const AGGREGATE_REFRESH_MINUTES: i64 = 15;

/// Store statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    pub rows_written: AtomicU64,
    pub rows_updated: AtomicU64,
    pub queries: AtomicU64,
    pub rows_pruned: AtomicU64,
}

type RowKey = (i64, WorkloadRef);

#[derive(Debug, Clone)]
struct HourlyAggregates {
    refreshed_at: DateTime<Utc>,
    /// (namespace, hour bucket) -> (rate sum, row count, max cumulative)
    cells: HashMap<(String, i64), (f64, u64, f64)>,
}

/// In-memory time-partitioned cost store
#[derive(Clone)]
pub struct MemoryStore {
    rows: Arc<DashMap<RowKey, CostRow>>,
    savings: Arc<RwLock<Vec<SavingsRow>>>,
    budget_states: Arc<RwLock<Vec<BudgetStatePoint>>>,
    aggregates: Arc<RwLock<Option<HourlyAggregates>>>,
    retention: Duration,
    stats: Arc<StoreStats>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_retention_days(90)
    }

    pub fn with_retention_days(days: u32) -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            savings: Arc::new(RwLock::new(Vec::new())),
            budget_states: Arc::new(RwLock::new(Vec::new())),
            aggregates: Arc::new(RwLock::new(None)),
            retention: Duration::days(days as i64),
            stats: Arc::new(StoreStats::default()),
        }
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Drop rows older than the retention window
    pub async fn prune(&self, now: DateTime<Utc>) {
        let cutoff = (now - self.retention).timestamp() / 60;
        let before = self.rows.len();
        self.rows.retain(|(bucket, _), _| *bucket >= cutoff);
        let pruned = before.saturating_sub(self.rows.len());
        if pruned > 0 {
            self.stats
                .rows_pruned
                .fetch_add(pruned as u64, Ordering::Relaxed);
            debug!(pruned, "pruned expired cost rows");
        }
    }

    fn in_scope(row: &CostRow, scope: &CostScope) -> bool {
        match scope {
            CostScope::Namespace(ns) => &row.workload.namespace == ns,
            CostScope::Team(team) => &row.team == team,
            CostScope::Workload(w) => &row.workload == w,
        }
    }

    /// Latest cumulative cost per workload among in-range rows, summed
    fn latest_per_workload_sum(
        &self,
        scope: &CostScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> f64 {
        let mut latest: HashMap<WorkloadRef, (DateTime<Utc>, f64)> = HashMap::new();
        for entry in self.rows.iter() {
            let row = entry.value();
            if row.time < start || row.time > end || !Self::in_scope(row, scope) {
                continue;
            }
            let slot = latest
                .entry(row.workload.clone())
                .or_insert((row.time, row.cumulative_cost));
            if row.time >= slot.0 {
                *slot = (row.time, row.cumulative_cost);
            }
        }
        latest.values().map(|(_, cost)| *cost).sum()
    }

    async fn refreshed_aggregates(&self, now: DateTime<Utc>) -> HourlyAggregates {
        {
            let cached = self.aggregates.read().await;
            if let Some(agg) = cached.as_ref() {
                if now - agg.refreshed_at < Duration::minutes(AGGREGATE_REFRESH_MINUTES) {
                    return agg.clone();
                }
            }
        }

        let mut cells: HashMap<(String, i64), (f64, u64, f64)> = HashMap::new();
        for entry in self.rows.iter() {
            let row = entry.value();
            let hour = row.time.timestamp() / 3600;
            let cell = cells
                .entry((row.workload.namespace.clone(), hour))
                .or_insert((0.0, 0, 0.0));
            cell.0 += row.hourly_rate;
            cell.1 += 1;
            cell.2 = cell.2.max(row.cumulative_cost);
        }

        let agg = HourlyAggregates {
            refreshed_at: now,
            cells,
        };
        *self.aggregates.write().await = Some(agg.clone());
        agg
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CostStore for MemoryStore {
    async fn insert_pod_cost(&self, row: CostRow) -> Result<()> {
        let key = (row.minute_bucket(), row.workload.clone());
        match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                // Same minute bucket: update rather than duplicate
                let stored = existing.get_mut();
                stored.cumulative_cost = row.cumulative_cost;
                stored.hourly_rate = row.hourly_rate;
                stored.time = row.time;
                self.stats.rows_updated.fetch_add(1, Ordering::Relaxed);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(row);
                self.stats.rows_written.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn query_cost(
        &self,
        scope: &CostScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.latest_per_workload_sum(scope, start, end))
    }

    async fn hourly_series(&self, namespace: &str, hours: u32) -> Result<Vec<SeriesPoint>> {
        let now = Utc::now();
        let aggregates = self.refreshed_aggregates(now).await;
        let first_hour = (now - Duration::hours(hours as i64)).timestamp() / 3600;

        let mut points: Vec<SeriesPoint> = aggregates
            .cells
            .iter()
            .filter(|((ns, hour), _)| ns == namespace && *hour >= first_hour)
            .map(|((_, hour), (rate_sum, count, max_cost))| SeriesPoint {
                bucket: Utc.timestamp_opt(hour * 3600, 0).unwrap(),
                avg_hourly_rate: if *count > 0 {
                    rate_sum / *count as f64
                } else {
                    0.0
                },
                max_cumulative_cost: *max_cost,
            })
            .collect();
        points.sort_by_key(|p| p.bucket);
        Ok(points)
    }

    async fn daily_series(&self, days: u32) -> Result<HashMap<String, Vec<DailyPoint>>> {
        let now = Utc::now();
        let first_day = (now - Duration::days(days as i64)).timestamp() / 86_400;

        // (namespace, day) -> (max cumulative, gpu sum, row count)
        let mut cells: HashMap<(String, i64), (f64, i64, u64)> = HashMap::new();
        for entry in self.rows.iter() {
            let row = entry.value();
            let day = row.time.timestamp() / 86_400;
            if day < first_day {
                continue;
            }
            let cell = cells
                .entry((row.workload.namespace.clone(), day))
                .or_insert((0.0, 0, 0));
            cell.0 = cell.0.max(row.cumulative_cost);
            cell.1 += row.gpu_count;
            cell.2 += 1;
        }

        let mut result: HashMap<String, Vec<DailyPoint>> = HashMap::new();
        for ((ns, day), (cost, gpu_sum, count)) in cells {
            result.entry(ns).or_default().push(DailyPoint {
                day: Utc.timestamp_opt(day * 86_400, 0).unwrap(),
                cost,
                avg_gpus: if count > 0 {
                    gpu_sum as f64 / count as f64
                } else {
                    0.0
                },
            });
        }
        for series in result.values_mut() {
            series.sort_by_key(|p| p.day);
        }
        Ok(result)
    }

    async fn record_savings(&self, row: SavingsRow) -> Result<()> {
        self.savings.write().await.push(row);
        Ok(())
    }

    async fn total_savings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        let savings = self.savings.read().await;
        let mut totals: HashMap<String, f64> = HashMap::new();
        for row in savings.iter() {
            if row.time >= start && row.time <= end {
                *totals.entry(row.optimization_type.clone()).or_default() += row.savings_amount;
            }
        }
        Ok(totals)
    }

    async fn upsert_budget_state(&self, point: BudgetStatePoint) -> Result<()> {
        self.budget_states.write().await.push(point);
        Ok(())
    }

    async fn budget_history(&self, budget: &str, days: u32) -> Result<Vec<BudgetStatePoint>> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let states = self.budget_states.read().await;
        Ok(states
            .iter()
            .filter(|p| p.budget == budget && p.time >= cutoff)
            .cloned()
            .collect())
    }
}
