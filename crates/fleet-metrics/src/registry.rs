//! Controller metric set
//!
//! All metrics the controller exports, registered against one Prometheus
//! registry and shared by every reconcile loop. Recording methods take
//! plain values so callers never touch prometheus types directly.

use crate::Result;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

/// Shared handle to the controller's metric set
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Arc<Registry>,

    // Scaling
    pub scaling_actions_total: CounterVec,
    pub scaling_duration_seconds: HistogramVec,

    // Fleet shape
    pub node_count: GaugeVec,
    pub desired_node_count: Gauge,
    pub cluster_utilization: Gauge,
    pub pending_pods: Gauge,
    pub underutilized_nodes: Gauge,

    // Spot
    pub spot_interruptions_total: Counter,
    pub spot_termination_warnings: Gauge,

    // Cost
    pub estimated_monthly_cost: GaugeVec,
    pub estimated_monthly_savings: Gauge,
    pub total_cost_usd: Gauge,
    pub hourly_cost_rate_usd: Gauge,
    pub pod_cost_usd: GaugeVec,
    pub budget_percentage: GaugeVec,

    // Prediction
    pub predicted_utilization: Gauge,
    pub prediction_confidence: Gauge,

    // Cooldowns
    pub scale_up_cooldown_remaining_seconds: Gauge,
    pub scale_down_cooldown_remaining_seconds: Gauge,

    // Controller health
    pub reconcile_errors_total: Counter,
    pub reconcile_duration_seconds: Histogram,

    // Admission
    pub admission_total: CounterVec,
}

impl ControllerMetrics {
    /// Create the metric set on a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let scaling_actions_total = CounterVec::new(
            Opts::new(
                "gpufleet_scaling_actions_total",
                "Total number of scaling actions performed",
            ),
            &["action", "capacity_class", "success"],
        )?;

        let scaling_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gpufleet_scaling_duration_seconds",
                "Time taken to complete scaling actions",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 10)?),
            &["action"],
        )?;

        let node_count = GaugeVec::new(
            Opts::new("gpufleet_node_count", "Current number of GPU nodes"),
            &["capacity_class"],
        )?;

        let desired_node_count = Gauge::new(
            "gpufleet_desired_node_count",
            "Desired number of GPU nodes",
        )?;

        let cluster_utilization = Gauge::new(
            "gpufleet_cluster_utilization",
            "Average GPU utilization across the cluster (0-1)",
        )?;

        let pending_pods = Gauge::new("gpufleet_pending_pods", "Number of pending GPU workloads")?;

        let underutilized_nodes = Gauge::new(
            "gpufleet_underutilized_nodes",
            "Number of underutilized GPU nodes",
        )?;

        let spot_interruptions_total = Counter::new(
            "gpufleet_spot_interruptions_total",
            "Total number of spot capacity interruptions",
        )?;

        let spot_termination_warnings = Gauge::new(
            "gpufleet_spot_termination_warnings",
            "Number of active spot termination warnings",
        )?;

        let estimated_monthly_cost = GaugeVec::new(
            Opts::new(
                "gpufleet_estimated_monthly_cost_usd",
                "Estimated monthly cost in USD",
            ),
            &["capacity_class"],
        )?;

        let estimated_monthly_savings = Gauge::new(
            "gpufleet_estimated_monthly_savings_usd",
            "Estimated monthly savings from optimization",
        )?;

        let total_cost_usd = Gauge::new(
            "gpufleet_total_cost_usd",
            "Total accumulated GPU cost in USD",
        )?;

        let hourly_cost_rate_usd = Gauge::new(
            "gpufleet_hourly_cost_rate_usd",
            "Current GPU cost rate in USD per hour",
        )?;

        let pod_cost_usd = GaugeVec::new(
            Opts::new("gpufleet_pod_cost_usd", "Cost per workload in USD"),
            &["namespace", "pod", "gpu_type", "capacity_type"],
        )?;

        let budget_percentage = GaugeVec::new(
            Opts::new(
                "gpufleet_budget_percentage",
                "Budget consumption as a percentage of the monthly limit",
            ),
            &["budget"],
        )?;

        let predicted_utilization = Gauge::new(
            "gpufleet_predicted_utilization",
            "Predicted future GPU utilization (0-1)",
        )?;

        let prediction_confidence = Gauge::new(
            "gpufleet_prediction_confidence",
            "Confidence level of the utilization prediction (0-1)",
        )?;

        let scale_up_cooldown_remaining_seconds = Gauge::new(
            "gpufleet_scale_up_cooldown_remaining_seconds",
            "Seconds remaining in the scale-up cooldown period",
        )?;

        let scale_down_cooldown_remaining_seconds = Gauge::new(
            "gpufleet_scale_down_cooldown_remaining_seconds",
            "Seconds remaining in the scale-down cooldown period",
        )?;

        let reconcile_errors_total = Counter::new(
            "gpufleet_reconcile_errors_total",
            "Total number of reconciliation errors",
        )?;

        let reconcile_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "gpufleet_reconcile_duration_seconds",
                "Time taken to run one reconcile pass",
            )
            .buckets(prometheus::exponential_buckets(0.01, 2.0, 10)?),
        )?;

        let admission_total = CounterVec::new(
            Opts::new(
                "gpufleet_admission_total",
                "Admission rewrite outcomes by strategy",
            ),
            &["strategy", "outcome"],
        )?;

        registry.register(Box::new(scaling_actions_total.clone()))?;
        registry.register(Box::new(scaling_duration_seconds.clone()))?;
        registry.register(Box::new(node_count.clone()))?;
        registry.register(Box::new(desired_node_count.clone()))?;
        registry.register(Box::new(cluster_utilization.clone()))?;
        registry.register(Box::new(pending_pods.clone()))?;
        registry.register(Box::new(underutilized_nodes.clone()))?;
        registry.register(Box::new(spot_interruptions_total.clone()))?;
        registry.register(Box::new(spot_termination_warnings.clone()))?;
        registry.register(Box::new(estimated_monthly_cost.clone()))?;
        registry.register(Box::new(estimated_monthly_savings.clone()))?;
        registry.register(Box::new(total_cost_usd.clone()))?;
        registry.register(Box::new(hourly_cost_rate_usd.clone()))?;
        registry.register(Box::new(pod_cost_usd.clone()))?;
        registry.register(Box::new(budget_percentage.clone()))?;
        registry.register(Box::new(predicted_utilization.clone()))?;
        registry.register(Box::new(prediction_confidence.clone()))?;
        registry.register(Box::new(scale_up_cooldown_remaining_seconds.clone()))?;
        registry.register(Box::new(scale_down_cooldown_remaining_seconds.clone()))?;
        registry.register(Box::new(reconcile_errors_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(admission_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            scaling_actions_total,
            scaling_duration_seconds,
            node_count,
            desired_node_count,
            cluster_utilization,
            pending_pods,
            underutilized_nodes,
            spot_interruptions_total,
            spot_termination_warnings,
            estimated_monthly_cost,
            estimated_monthly_savings,
            total_cost_usd,
            hourly_cost_rate_usd,
            pod_cost_usd,
            budget_percentage,
            predicted_utilization,
            prediction_confidence,
            scale_up_cooldown_remaining_seconds,
            scale_down_cooldown_remaining_seconds,
            reconcile_errors_total,
            reconcile_duration_seconds,
            admission_total,
        })
    }

    /// The underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a scaling action outcome
    pub fn record_scaling_action(&self, action: &str, capacity_class: &str, success: bool) {
        let success = if success { "true" } else { "false" };
        self.scaling_actions_total
            .with_label_values(&[action, capacity_class, success])
            .inc();
    }

    /// Record how long a scaling action took
    pub fn record_scaling_duration(&self, action: &str, seconds: f64) {
        self.scaling_duration_seconds
            .with_label_values(&[action])
            .observe(seconds);
    }

    /// Record an admission rewrite outcome
    pub fn record_admission(&self, strategy: &str, outcome: &str) {
        self.admission_total
            .with_label_values(&[strategy, outcome])
            .inc();
    }

    /// Set the per-workload cost gauge
    pub fn set_pod_cost(
        &self,
        namespace: &str,
        pod: &str,
        gpu_type: &str,
        capacity_class: &str,
        cost: f64,
    ) {
        self.pod_cost_usd
            .with_label_values(&[namespace, pod, gpu_type, capacity_class])
            .set(cost);
    }

    /// Drop the per-workload cost gauge for a departed workload
    pub fn remove_pod_cost(&self, namespace: &str, pod: &str, gpu_type: &str, capacity_class: &str) {
        let _ = self
            .pod_cost_usd
            .remove_label_values(&[namespace, pod, gpu_type, capacity_class]);
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| crate::MetricsError::Export(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| crate::MetricsError::Export(format!("metrics are not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_registration() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.record_scaling_action("scale-up", "spot", true);
        metrics.cluster_utilization.set(0.42);

        let exported = metrics.export().unwrap();
        assert!(exported.contains("gpufleet_scaling_actions_total"));
        assert!(exported.contains("gpufleet_cluster_utilization 0.42"));
    }

    #[test]
    fn test_pod_cost_gauge_lifecycle() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.set_pod_cost("ml", "trainer-0", "nvidia-tesla-a100", "spot", 1.25);
        assert!(metrics.export().unwrap().contains("trainer-0"));

        metrics.remove_pod_cost("ml", "trainer-0", "nvidia-tesla-a100", "spot");
        assert!(!metrics.export().unwrap().contains("trainer-0"));
    }

    #[test]
    fn test_admission_counter() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.record_admission("mig", "optimized");
        metrics.record_admission("mig", "optimized");
        metrics.record_admission("exclusive", "unchanged");

        let exported = metrics.export().unwrap();
        assert!(exported.contains("gpufleet_admission_total"));
    }
}
