//! Second-resolution cost accrual for running GPU workloads
//!
//! Each tick lists the running GPU workloads, extends every known cost
//! record by `hourly_rate * Δt`, constructs records for newcomers, evicts
//! records (and their gauges) for departed workloads, exports the live
//! gauges, and upserts one row per workload into the time-series store.
//!
//! The cache is read concurrently by the metrics exporter and budget
//! queries while the accrual tick writes. Entries are `Arc<PodCost>` and
//! updates are copy-on-write: clone the record, extend the clone, swap
//! the pointer. Readers snapshot the pointer and never observe a torn
//! record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_core::{
    labels, Clock, ClusterRuntime, Error, PodCost, Result, SharingMode, Workload, WorkloadRef,
};
use fleet_metrics::ControllerMetrics;
use fleet_store::{CostRow, CostScope, CostStore, SavingsRow};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::pricing::{PricingClient, PricingRequest};

/// Billing hours in a month, the industry planning figure
const HOURS_PER_MONTH: f64 = 730.0;

/// Spot prices hover around this fraction of on-demand; used to size the
/// savings a spot workload realizes against its on-demand equivalent
const SPOT_DISCOUNT_FACTOR: f64 = 0.35;

/// Live cost accountant
pub struct CostTracker {
    runtime: Arc<dyn ClusterRuntime>,
    pricing: Arc<PricingClient>,
    store: Option<Arc<dyn CostStore>>,
    metrics: ControllerMetrics,
    clock: Arc<dyn Clock>,
    cache: DashMap<WorkloadRef, Arc<PodCost>>,
}

impl CostTracker {
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        pricing: Arc<PricingClient>,
        store: Option<Arc<dyn CostStore>>,
        metrics: ControllerMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runtime,
            pricing,
            store,
            metrics,
            clock,
            cache: DashMap::new(),
        }
    }

    /// One accrual pass over all running GPU workloads
    pub async fn tick(&self) -> Result<()> {
        let workloads = self.runtime.running_gpu_workloads().await?;
        let now = self.clock.now();

        let mut total_hourly_rate = 0.0;
        let mut total_cost = 0.0;
        let mut rate_by_class: HashMap<&'static str, f64> = HashMap::new();
        let mut savings_rate = 0.0;
        // (namespace, lever) -> (dollars saved, dollars billed) this tick
        let mut savings_by_ns: HashMap<(String, &'static str), (f64, f64)> = HashMap::new();
        let mut active: HashMap<WorkloadRef, ()> = HashMap::new();

        for workload in &workloads {
            let key = workload.workload_ref();
            active.insert(key.clone(), ());

            let (cost, delta_hours) = match self.update_or_create(workload, now).await {
                Ok(updated) => updated,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(workload = %key, error = %e, "failed to calculate workload cost");
                    continue;
                }
            };

            self.metrics.set_pod_cost(
                &cost.workload.namespace,
                &cost.workload.name,
                &cost.gpu_type,
                cost.capacity_class.as_str(),
                cost.total_cost,
            );

            total_hourly_rate += cost.hourly_rate;
            total_cost += cost.total_cost;
            *rate_by_class
                .entry(cost.capacity_class.as_str())
                .or_default() += cost.hourly_rate;

            // Savings versus the unoptimized baseline: sharing bills a
            // fraction of the exclusive rate, spot a fraction of the
            // on-demand rate
            let factor = sharing_factor(workload, cost.sharing_mode);
            if factor < 1.0 {
                let saved = cost.hourly_rate / factor - cost.hourly_rate;
                savings_rate += saved;
                let cell = savings_by_ns
                    .entry((cost.workload.namespace.clone(), "sharing"))
                    .or_default();
                cell.0 += saved * delta_hours;
                cell.1 += cost.hourly_rate * delta_hours;
            }
            if cost.capacity_class == fleet_core::CapacityClass::Spot {
                let on_demand_equivalent = cost.hourly_rate / SPOT_DISCOUNT_FACTOR;
                let saved = on_demand_equivalent - cost.hourly_rate;
                savings_rate += saved;
                let cell = savings_by_ns
                    .entry((cost.workload.namespace.clone(), "spot"))
                    .or_default();
                cell.0 += saved * delta_hours;
                cell.1 += cost.hourly_rate * delta_hours;
            }

            if let Some(store) = &self.store {
                if let Err(e) = store.insert_pod_cost(CostRow::from_pod_cost(&cost)).await {
                    error!(workload = %key, error = %e, "failed to persist cost row");
                }
            }
        }

        if let Some(store) = &self.store {
            for ((namespace, lever), (saved, billed)) in savings_by_ns {
                if saved <= 0.0 {
                    continue;
                }
                let row = SavingsRow {
                    time: now,
                    namespace,
                    optimization_type: lever.to_string(),
                    savings_amount: saved,
                    baseline_cost: billed + saved,
                    actual_cost: billed,
                };
                if let Err(e) = store.record_savings(row).await {
                    error!(error = %e, "failed to persist savings row");
                }
            }
        }

        // Evict departed workloads and their gauges
        let departed: Vec<(WorkloadRef, Arc<PodCost>)> = self
            .cache
            .iter()
            .filter(|entry| !active.contains_key(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (key, cost) in departed {
            self.cache.remove(&key);
            self.metrics.remove_pod_cost(
                &key.namespace,
                &key.name,
                &cost.gpu_type,
                cost.capacity_class.as_str(),
            );
        }

        self.metrics.hourly_cost_rate_usd.set(total_hourly_rate);
        self.metrics.total_cost_usd.set(total_cost);
        for (class, rate) in rate_by_class {
            self.metrics
                .estimated_monthly_cost
                .with_label_values(&[class])
                .set(rate * HOURS_PER_MONTH);
        }
        self.metrics
            .estimated_monthly_savings
            .set(savings_rate * HOURS_PER_MONTH);

        debug!(
            active = active.len(),
            hourly_rate = total_hourly_rate,
            total_cost,
            "updated workload costs"
        );

        Ok(())
    }

    /// Extend an existing record or construct a fresh one. Returns the
    /// updated record and the hours covered by this update.
    async fn update_or_create(
        &self,
        workload: &Workload,
        now: DateTime<Utc>,
    ) -> Result<(Arc<PodCost>, f64)> {
        let key = workload.workload_ref();

        if let Some(existing) = self.cache.get(&key).map(|e| e.value().clone()) {
            let delta_hours =
                (now - existing.last_updated).num_milliseconds().max(0) as f64 / 3_600_000.0;
            let next = existing.accrued(now);
            if next.total_cost < existing.total_cost {
                return Err(Error::invariant(format!(
                    "cost for {} decreased from {} to {}",
                    key, existing.total_cost, next.total_cost
                )));
            }
            let next = Arc::new(next);
            self.cache.insert(key, next.clone());
            return Ok((next, delta_hours));
        }

        let cost = Arc::new(self.build_cost(workload, now).await?);
        let delta_hours = (now - cost.start_time).num_milliseconds().max(0) as f64 / 3_600_000.0;
        self.cache.insert(key, cost.clone());
        Ok((cost, delta_hours))
    }

    async fn build_cost(&self, workload: &Workload, now: DateTime<Utc>) -> Result<PodCost> {
        let gpu_count = labels::billable_gpu_count(workload);
        if gpu_count == 0 {
            return Err(Error::invalid_request(format!(
                "{} requests no GPUs",
                workload.workload_ref()
            )));
        }

        let node_name = workload
            .node_name
            .clone()
            .ok_or_else(|| Error::invalid_request("running workload has no node placement"))?;
        let node = self.runtime.get_node(&node_name).await?;

        let gpu_type = labels::gpu_type_of(&node.labels);
        if gpu_type == "unknown" {
            debug!(node = %node_name, "could not determine GPU type");
        }
        let capacity_class = node.capacity_class();
        let sharing_mode = labels::sharing_mode_of(workload);
        let sharing_factor = sharing_factor(workload, sharing_mode);

        let pricing = self
            .pricing
            .gpu_pricing(&PricingRequest {
                gpu_type: gpu_type.clone(),
                capacity_class,
                region: labels::region_of(&node.labels),
                zone: labels::zone_of(&node.labels),
            })
            .await;

        let hourly_rate = pricing.price_per_gpu_hour * gpu_count as f64 * sharing_factor;

        let start_time = workload.started_at.unwrap_or(now);
        let elapsed_hours = (now - start_time).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let mut total_cost = hourly_rate * elapsed_hours;

        // Resume from persisted history so totals stay monotonic across
        // controller restarts
        if let Some(store) = &self.store {
            let scope = CostScope::Workload(workload.workload_ref());
            match store.query_cost(&scope, start_time, now).await {
                Ok(persisted) if persisted > total_cost => total_cost = persisted,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        workload = %workload.workload_ref(),
                        error = %e,
                        "could not replay persisted cost, accruing from start time"
                    );
                }
            }
        }

        Ok(PodCost {
            workload: workload.workload_ref(),
            node: node_name,
            gpu_type,
            gpu_count,
            capacity_class,
            sharing_mode,
            start_time,
            hourly_rate,
            total_cost,
            last_updated: now,
            labels: labels::attribution_labels(workload),
            team: workload.label(labels::LABEL_TEAM).unwrap_or_default().to_string(),
            project: workload
                .label(labels::LABEL_PROJECT)
                .unwrap_or_default()
                .to_string(),
            experiment_id: workload
                .label(labels::LABEL_EXPERIMENT_ID)
                .unwrap_or_default()
                .to_string(),
            cost_center: workload
                .label(labels::LABEL_COST_CENTER)
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Snapshot of one workload's cost record
    pub fn pod_cost(&self, workload: &WorkloadRef) -> Option<Arc<PodCost>> {
        self.cache.get(workload).map(|e| e.value().clone())
    }

    /// Total accrued cost across cached workloads
    pub fn total_cost(&self) -> f64 {
        self.cache.iter().map(|e| e.value().total_cost).sum()
    }

    /// Current cluster hourly rate across cached workloads
    pub fn hourly_rate(&self) -> f64 {
        self.cache.iter().map(|e| e.value().hourly_rate).sum()
    }

    /// Accrued cost grouped by namespace
    pub fn cost_by_namespace(&self) -> HashMap<String, f64> {
        let mut costs = HashMap::new();
        for entry in self.cache.iter() {
            *costs
                .entry(entry.value().workload.namespace.clone())
                .or_default() += entry.value().total_cost;
        }
        costs
    }

    /// Accrued cost grouped by a label's values
    pub fn cost_by_label(&self, label: &str) -> HashMap<String, f64> {
        let mut costs = HashMap::new();
        for entry in self.cache.iter() {
            if let Some(value) = entry.value().labels.get(label) {
                *costs.entry(value.clone()).or_default() += entry.value().total_cost;
            }
        }
        costs
    }

    /// All cached cost records
    pub fn snapshot(&self) -> Vec<Arc<PodCost>> {
        self.cache.iter().map(|e| e.value().clone()).collect()
    }

    pub fn cached_workloads(&self) -> usize {
        self.cache.len()
    }
}

/// Sharing factor for a workload: fixed per mode unless an explicit
/// client/replica count annotation is present
fn sharing_factor(workload: &Workload, mode: SharingMode) -> f64 {
    let count_annotation = match mode {
        SharingMode::Mps => workload.annotation(labels::ANNOTATION_MPS_CLIENTS),
        SharingMode::Timeslicing => workload.annotation(labels::ANNOTATION_TIMESLICE_REPLICAS),
        SharingMode::Mig | SharingMode::Exclusive => None,
    };

    if let Some(count) = count_annotation.and_then(|v| v.parse::<u32>().ok()) {
        if count > 0 {
            return 1.0 / count as f64;
        }
    }

    mode.default_sharing_factor()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::types::Container;

    fn workload(mode: Option<&str>) -> Workload {
        let mut w = Workload {
            name: "w".into(),
            namespace: "ns".into(),
            containers: vec![Container {
                name: "main".into(),
                requests: [(labels::RESOURCE_WHOLE_GPU.to_string(), 1)].into(),
                limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), 1)].into(),
            }],
            ..Default::default()
        };
        if let Some(mode) = mode {
            w.annotations
                .insert(labels::ANNOTATION_SHARING_MODE.into(), mode.into());
        }
        w
    }

    #[test]
    fn test_sharing_factor_defaults() {
        assert_eq!(
            sharing_factor(&workload(None), SharingMode::Exclusive),
            1.0
        );
        assert_eq!(sharing_factor(&workload(Some("mig")), SharingMode::Mig), 1.0);
        assert_eq!(sharing_factor(&workload(Some("mps")), SharingMode::Mps), 0.25);
        assert_eq!(
            sharing_factor(&workload(Some("timeslicing")), SharingMode::Timeslicing),
            0.25
        );
    }

    #[test]
    fn test_sharing_factor_explicit_client_count() {
        let mut w = workload(Some("mps"));
        w.annotations
            .insert(labels::ANNOTATION_MPS_CLIENTS.into(), "8".into());
        assert_eq!(sharing_factor(&w, SharingMode::Mps), 0.125);

        // A zero count falls back to the fixed factor
        w.annotations
            .insert(labels::ANNOTATION_MPS_CLIENTS.into(), "0".into());
        assert_eq!(sharing_factor(&w, SharingMode::Mps), 0.25);
    }
}
