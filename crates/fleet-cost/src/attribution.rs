//! Cost attribution rollups
//!
//! Reconciles CostAttribution objects: matches running GPU workloads
//! against the attribution's selector, aggregates live cost records into
//! totals and breakdowns, pulls daily/monthly figures and time series
//! from the store, and itemizes savings by optimization lever.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use fleet_core::policy::{
    CostAttribution, DetailedBreakdown, SavingsData, TimeBucketCost, WorkloadCostInfo,
};
use fleet_core::{Clock, ClusterRuntime, Result, Workload};
use fleet_store::{CostScope, CostStore};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::tracker::CostTracker;

/// Reconciles CostAttribution objects
pub struct AttributionController {
    runtime: Arc<dyn ClusterRuntime>,
    tracker: Arc<CostTracker>,
    store: Option<Arc<dyn CostStore>>,
    clock: Arc<dyn Clock>,
}

impl AttributionController {
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        tracker: Arc<CostTracker>,
        store: Option<Arc<dyn CostStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runtime,
            tracker,
            store,
            clock,
        }
    }

    /// Reconcile every declared attribution
    pub async fn reconcile_all(&self) -> Result<()> {
        for attribution in self.runtime.cost_attributions().await? {
            if let Err(e) = self.reconcile(attribution).await {
                error!(error = %e, "attribution reconcile failed");
            }
        }
        Ok(())
    }

    /// Recompute one attribution's status
    pub async fn reconcile(&self, mut attribution: CostAttribution) -> Result<()> {
        let now = self.clock.now();

        let workloads: Vec<Workload> = self
            .runtime
            .running_gpu_workloads()
            .await?
            .into_iter()
            .filter(|w| attribution.spec.matches(w))
            .collect();

        let mut total_cost = 0.0;
        let mut hourly_rate = 0.0;
        let mut active_gpus: u32 = 0;
        let mut gpu_hours = 0.0;
        let mut breakdown = DetailedBreakdown::default();

        for workload in &workloads {
            let Some(cost) = self.tracker.pod_cost(&workload.workload_ref()) else {
                debug!(workload = %workload.workload_ref(), "no cost record yet");
                continue;
            };

            total_cost += cost.total_cost;
            hourly_rate += cost.hourly_rate;
            active_gpus += cost.gpu_count as u32;
            let elapsed = (now - cost.start_time).num_seconds().max(0) as f64 / 3600.0;
            gpu_hours += elapsed * cost.gpu_count as f64;

            breakdown.by_workload.insert(
                cost.workload.name.clone(),
                WorkloadCostInfo {
                    name: cost.workload.name.clone(),
                    gpu_type: cost.gpu_type.clone(),
                    gpu_count: cost.gpu_count,
                    start_time: Some(cost.start_time),
                    cost: cost.total_cost,
                    hourly_rate: cost.hourly_rate,
                    capacity_class: cost.capacity_class.to_string(),
                    sharing_mode: cost.sharing_mode.to_string(),
                    node: cost.node.clone(),
                },
            );
            *breakdown
                .by_gpu_type
                .entry(cost.gpu_type.clone())
                .or_default() += cost.total_cost;
            *breakdown
                .by_capacity_class
                .entry(cost.capacity_class.to_string())
                .or_default() += cost.total_cost;
            *breakdown.by_node.entry(cost.node.clone()).or_default() += cost.total_cost;
        }

        let (daily_cost, monthly_cost) = self.period_costs(&attribution, total_cost, now).await;
        self.fill_time_series(&attribution, &mut breakdown).await;

        let savings = self.savings(&attribution, total_cost, now).await;

        let status = &mut attribution.status;
        status.total_cost = total_cost;
        status.daily_cost = daily_cost;
        status.monthly_cost = monthly_cost;
        status.hourly_cost = hourly_rate;
        status.active_workloads = workloads.len() as u32;
        status.active_gpus = active_gpus;
        status.gpu_hours = gpu_hours;
        status.cost_per_gpu_hour = if gpu_hours > 0.0 {
            total_cost / gpu_hours
        } else {
            0.0
        };
        status.last_updated = Some(now);
        status.breakdown = breakdown;
        status.savings = savings;

        debug!(
            attribution = %attribution.name,
            total_cost,
            active_workloads = attribution.status.active_workloads,
            active_gpus,
            "updated attribution status"
        );

        self.runtime.update_cost_attribution(&attribution).await
    }

    /// Daily and monthly spend from the store, falling back to the live
    /// total when no store is configured
    async fn period_costs(
        &self,
        attribution: &CostAttribution,
        live_total: f64,
        now: DateTime<Utc>,
    ) -> (f64, f64) {
        let Some(store) = &self.store else {
            return (live_total, live_total);
        };

        let scope = if !attribution.spec.namespace.is_empty() {
            CostScope::Namespace(attribution.spec.namespace.clone())
        } else if !attribution.spec.team.is_empty() {
            CostScope::Team(attribution.spec.team.clone())
        } else {
            return (live_total, live_total);
        };

        let start_of_day = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now);
        let start_of_month = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);

        let daily = store
            .query_cost(&scope, start_of_day, now)
            .await
            .unwrap_or(live_total);
        let monthly = store
            .query_cost(&scope, start_of_month, now)
            .await
            .unwrap_or(live_total);
        (daily, monthly)
    }

    /// Hourly (24h) and daily (retention window) series from the store
    async fn fill_time_series(
        &self,
        attribution: &CostAttribution,
        breakdown: &mut DetailedBreakdown,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        if attribution.spec.namespace.is_empty() {
            return;
        }

        match store.hourly_series(&attribution.spec.namespace, 24).await {
            Ok(series) => {
                breakdown.by_hour = series
                    .into_iter()
                    .map(|point| TimeBucketCost {
                        bucket: Some(point.bucket),
                        cost: point.max_cumulative_cost,
                        gpu_hours: point.avg_hourly_rate,
                    })
                    .collect();
            }
            Err(e) => warn!(error = %e, "hourly series query failed"),
        }

        match store.daily_series(attribution.spec.retention_days).await {
            Ok(mut by_namespace) => {
                if let Some(series) = by_namespace.remove(&attribution.spec.namespace) {
                    breakdown.by_day = series
                        .into_iter()
                        .map(|point| TimeBucketCost {
                            bucket: Some(point.day),
                            cost: point.cost,
                            gpu_hours: point.avg_gpus,
                        })
                        .collect();
                }
            }
            Err(e) => warn!(error = %e, "daily series query failed"),
        }
    }

    /// Itemized savings over the trailing 30 days
    async fn savings(
        &self,
        _attribution: &CostAttribution,
        total_cost: f64,
        now: DateTime<Utc>,
    ) -> SavingsData {
        let mut savings = SavingsData::default();
        let Some(store) = &self.store else {
            return savings;
        };

        let totals = match store
            .total_savings(now - ChronoDuration::days(30), now)
            .await
        {
            Ok(totals) => totals,
            Err(e) => {
                warn!(error = %e, "savings query failed");
                return savings;
            }
        };

        for (lever, amount) in totals {
            savings.total_savings += amount;
            match lever.as_str() {
                "spot" => savings.spot_savings = amount,
                "sharing" => savings.sharing_savings = amount,
                "autoscaling" => savings.autoscaling_savings = amount,
                "waste" => savings.waste_eliminated = amount,
                other => debug!(lever = other, "unrecognized savings lever"),
            }
        }

        // Baseline is what the scope would have cost without any levers
        savings.baseline_cost = total_cost + savings.total_savings;
        if savings.baseline_cost > 0.0 {
            savings.savings_percentage = savings.total_savings / savings.baseline_cost * 100.0;
        }
        savings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_store::{MemoryStore, SavingsRow};

    async fn store_with_savings(now: DateTime<Utc>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (lever, amount) in [("spot", 70.0), ("sharing", 20.0), ("waste", 10.0)] {
            store
                .record_savings(SavingsRow {
                    time: now,
                    namespace: "ml".into(),
                    optimization_type: lever.into(),
                    savings_amount: amount,
                    baseline_cost: 0.0,
                    actual_cost: 0.0,
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_savings_itemization() {
        let now = Utc::now();
        let store = store_with_savings(now).await;

        let totals = store
            .total_savings(now - ChronoDuration::days(1), now + ChronoDuration::days(1))
            .await
            .unwrap();

        let mut savings = SavingsData::default();
        for (lever, amount) in totals {
            savings.total_savings += amount;
            match lever.as_str() {
                "spot" => savings.spot_savings = amount,
                "sharing" => savings.sharing_savings = amount,
                "waste" => savings.waste_eliminated = amount,
                _ => {}
            }
        }
        savings.baseline_cost = 100.0 + savings.total_savings;
        savings.savings_percentage = savings.total_savings / savings.baseline_cost * 100.0;

        assert!((savings.total_savings - 100.0).abs() < 1e-9);
        assert!((savings.spot_savings - 70.0).abs() < 1e-9);
        assert!((savings.savings_percentage - 50.0).abs() < 1e-9);
    }
}
