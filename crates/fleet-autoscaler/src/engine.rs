//! The scaling decision engine
//!
//! One reconcile pass per policy: snapshot the in-scope nodes, the
//! pending GPU queue, and cluster utilization; evaluate the scale-up and
//! scale-down gates under their cooldowns and bounds; pick a capacity
//! class and pool for new nodes; let the predictive scaler raise the
//! target; then act through the cloud capability. Cooldown timers only
//! advance on success, so a failed cloud call is retried on the next
//! tick.

use chrono::{DateTime, Utc};
use fleet_cloud::CloudProvider;
use fleet_core::policy::{AutoscalingPolicy, PredictiveStatus, StatusCondition};
use fleet_core::{
    CapacityClass, Clock, ClusterRuntime, Error, MetricsReader, Node, Result, ScalingAction,
    Workload,
};
use fleet_metrics::ControllerMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::drain;
use crate::history::ScalingHistory;
use crate::predictive::PredictiveScaler;

/// Rough GPU workloads absorbed per new node when sizing a scale-up;
/// deliberately conservative, and a candidate for per-pool tuning.
const PENDING_WORKLOADS_PER_NODE: f64 = 4.0;

/// Largest share of the fleet removable in one scale-down tick
const MAX_SCALE_DOWN_FRACTION: f64 = 0.2;

/// The outcome of one reconcile pass for a policy
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDecision {
    pub action: ScalingAction,
    pub reason: String,
    pub desired_node_count: u32,
    pub capacity_class: CapacityClass,
    pub node_pool: String,
    pub priority: i32,
    pub gpu_utilization: f64,
    pub pending_workloads: u32,
    pub underutilized_nodes: u32,
}

#[derive(Debug, Clone, Copy)]
struct PolicyState {
    last_scale_up: DateTime<Utc>,
    last_scale_down: DateTime<Utc>,
}

/// Per-policy scaling reconciler
pub struct DecisionEngine {
    runtime: Arc<dyn ClusterRuntime>,
    metrics_reader: Arc<dyn MetricsReader>,
    cloud: Arc<dyn CloudProvider>,
    metrics: ControllerMetrics,
    clock: Arc<dyn Clock>,
    predictive: Option<Arc<PredictiveScaler>>,
    history: Arc<ScalingHistory>,
    // Cooldown anchors per policy; reset so a fresh controller may act
    // on its first tick
    state: Mutex<HashMap<String, PolicyState>>,
}

impl DecisionEngine {
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        metrics_reader: Arc<dyn MetricsReader>,
        cloud: Arc<dyn CloudProvider>,
        metrics: ControllerMetrics,
        clock: Arc<dyn Clock>,
        predictive: Option<Arc<PredictiveScaler>>,
    ) -> Self {
        Self {
            runtime,
            metrics_reader,
            cloud,
            metrics,
            clock,
            predictive,
            history: Arc::new(ScalingHistory::new()),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn history(&self) -> Arc<ScalingHistory> {
        self.history.clone()
    }

    /// Reconcile every enabled policy
    pub async fn reconcile_all(&self) -> Result<()> {
        for policy in self.runtime.autoscaling_policies().await? {
            if !policy.spec.enabled {
                debug!(policy = %policy.name, "policy disabled, skipping");
                continue;
            }
            if let Err(e) = self.reconcile(policy).await {
                error!(error = %e, "autoscaling reconcile failed");
                self.metrics.reconcile_errors_total.inc();
            }
        }
        Ok(())
    }

    /// One reconcile pass: analyze, decide, act, publish status
    pub async fn reconcile(&self, mut policy: AutoscalingPolicy) -> Result<ScaleDecision> {
        let started = std::time::Instant::now();
        let now = self.clock.now();

        let nodes = self.in_scope_nodes(&policy).await?;
        // A failed pending listing aborts the tick; scaling on a partial
        // queue view would be wrong in both directions
        let pending = self.runtime.pending_gpu_workloads().await?;

        // Metric failures fail open to zero utilization: scale-down also
        // requires underutilized nodes, so zero never forces a removal
        let utilization = match self.metrics_reader.average_utilization().await {
            Ok(utilization) => utilization,
            Err(e) => {
                warn!(error = %e, "failed to read GPU utilization, using 0");
                0.0
            }
        };
        let underutilized = self
            .count_underutilized(&nodes, policy.spec.scale_down_threshold)
            .await;

        let state = self.policy_state(&policy, now).await;
        let decision = self.decide(&policy, &nodes, &pending, utilization, underutilized, state, now);

        info!(
            policy = %policy.name,
            action = %decision.action,
            reason = %decision.reason,
            desired_nodes = decision.desired_node_count,
            capacity_class = %decision.capacity_class,
            utilization = decision.gpu_utilization,
            pending = decision.pending_workloads,
            "scaling decision"
        );

        if decision.action != ScalingAction::NoAction {
            let action_started = std::time::Instant::now();
            let result = self.execute(&policy, &nodes, &decision, now).await;
            self.metrics.record_scaling_duration(
                decision.action.as_str(),
                action_started.elapsed().as_secs_f64(),
            );

            match result {
                Ok(()) => {
                    self.history.record(
                        now,
                        decision.action,
                        decision.reason.clone(),
                        decision.desired_node_count,
                        decision.capacity_class,
                        true,
                    );
                    self.metrics.record_scaling_action(
                        decision.action.as_str(),
                        decision.capacity_class.as_str(),
                        true,
                    );
                }
                Err(e) => {
                    self.history.record(
                        now,
                        decision.action,
                        decision.reason.clone(),
                        0,
                        decision.capacity_class,
                        false,
                    );
                    self.metrics.record_scaling_action(
                        decision.action.as_str(),
                        decision.capacity_class.as_str(),
                        false,
                    );
                    // Configuration mistakes surface on the object, not
                    // in a silent retry loop
                    if e.is_configuration() {
                        policy.status.conditions.push(StatusCondition {
                            condition_type: "ScalingDegraded".to_string(),
                            status: true,
                            reason: "InvalidConfiguration".to_string(),
                            message: e.to_string(),
                            last_transition: now,
                        });
                    }
                    self.publish(&mut policy, &nodes, &decision, now).await;
                    self.metrics
                        .reconcile_duration_seconds
                        .observe(started.elapsed().as_secs_f64());
                    return Err(e);
                }
            }
        }

        self.publish(&mut policy, &nodes, &decision, now).await;
        self.metrics
            .reconcile_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        Ok(decision)
    }

    /// Nodes covered by this policy's selector
    async fn in_scope_nodes(&self, policy: &AutoscalingPolicy) -> Result<Vec<Node>> {
        let nodes = self.runtime.list_gpu_nodes().await?;
        if policy.spec.node_selector.is_empty() {
            return Ok(nodes);
        }
        Ok(nodes
            .into_iter()
            .filter(|n| {
                policy
                    .spec
                    .node_selector
                    .iter()
                    .all(|(k, v)| n.labels.get(k) == Some(v))
            })
            .collect())
    }

    async fn count_underutilized(&self, nodes: &[Node], threshold: f64) -> u32 {
        let mut count = 0;
        for node in nodes {
            match self.metrics_reader.node_utilization(&node.name).await {
                Ok(utilization) if utilization < threshold => count += 1,
                Ok(_) => {}
                Err(_) => continue,
            }
        }
        count
    }

    async fn policy_state(&self, policy: &AutoscalingPolicy, now: DateTime<Utc>) -> PolicyState {
        let mut state = self.state.lock().await;
        *state.entry(policy.name.clone()).or_insert_with(|| {
            // First boot: anchor the cooldowns exactly one interval back
            // so a justified first decision is not delayed
            let up = chrono::Duration::seconds(policy.spec.scale_up_cooldown_seconds as i64);
            let down = chrono::Duration::seconds(policy.spec.scale_down_cooldown_seconds as i64);
            PolicyState {
                last_scale_up: now - up,
                last_scale_down: now - down,
            }
        })
    }

    /// Pure decision from one coherent snapshot
    fn decide(
        &self,
        policy: &AutoscalingPolicy,
        nodes: &[Node],
        pending: &[Workload],
        utilization: f64,
        underutilized: u32,
        state: PolicyState,
        now: DateTime<Utc>,
    ) -> ScaleDecision {
        let spec = &policy.spec;
        let node_count = nodes.len() as u32;

        let mut decision = ScaleDecision {
            action: ScalingAction::NoAction,
            reason: "cluster stable".to_string(),
            desired_node_count: node_count,
            capacity_class: CapacityClass::OnDemand,
            node_pool: String::new(),
            priority: 0,
            gpu_utilization: utilization,
            pending_workloads: pending.len() as u32,
            underutilized_nodes: underutilized,
        };

        if self.should_scale_up(spec, node_count, pending, utilization, state, now) {
            decision.action = ScalingAction::ScaleUp;
            decision.reason = scale_up_reason(pending, utilization, spec.scale_up_threshold);
            decision.desired_node_count = scale_up_target(node_count, pending.len() as u32, spec.max_nodes);
            let (class, pool) = self.select_capacity(spec, nodes);
            decision.capacity_class = class;
            decision.node_pool = pool;
            decision.priority = pending
                .iter()
                .filter_map(|w| w.priority)
                .max()
                .unwrap_or(0);
        } else if self.should_scale_down(spec, node_count, utilization, underutilized, state, now) {
            decision.action = ScalingAction::ScaleDown;
            decision.reason = format!(
                "GPU utilization {:.1}% below threshold {:.1}%, {} underutilized nodes",
                utilization * 100.0,
                spec.scale_down_threshold * 100.0,
                underutilized
            );
            decision.desired_node_count =
                scale_down_target(node_count, underutilized, spec.min_nodes);
            decision.capacity_class = preferred_removal_class(nodes);
        }

        if spec.enable_predictive_scaling {
            if let Some(predictive) = &self.predictive {
                let prediction = predictive.predict();
                self.metrics
                    .predicted_utilization
                    .set(prediction.predicted_utilization);
                self.metrics.prediction_confidence.set(prediction.confidence);

                if prediction.should_pre_warm
                    && prediction.recommended_nodes > decision.desired_node_count
                {
                    info!(
                        predicted = prediction.predicted_utilization,
                        recommended_nodes = prediction.recommended_nodes,
                        "predictive pre-warm overrides decision"
                    );
                    decision.action = ScalingAction::ScaleUp;
                    decision.reason = format!(
                        "predictive scaling: expected load increase to {:.1}%",
                        prediction.predicted_utilization * 100.0
                    );
                    decision.desired_node_count =
                        prediction.recommended_nodes.min(spec.max_nodes);
                    if decision.node_pool.is_empty() {
                        let (class, pool) = self.select_capacity(spec, nodes);
                        decision.capacity_class = class;
                        decision.node_pool = pool;
                    }
                }
            }
        }

        decision
    }

    fn should_scale_up(
        &self,
        spec: &fleet_core::policy::AutoscalingPolicySpec,
        node_count: u32,
        pending: &[Workload],
        utilization: f64,
        state: PolicyState,
        now: DateTime<Utc>,
    ) -> bool {
        if now - state.last_scale_up
            < chrono::Duration::seconds(spec.scale_up_cooldown_seconds as i64)
        {
            return false;
        }
        if node_count >= spec.max_nodes {
            return false;
        }

        if let Some(oldest) = oldest_pending(pending) {
            if now - oldest
                >= chrono::Duration::seconds(spec.pending_workload_timeout_seconds as i64)
            {
                return true;
            }
        }

        // The utilization trigger needs at least one node: with zero
        // nodes there is nothing the average could describe
        utilization > spec.scale_up_threshold && node_count > 0
    }

    fn should_scale_down(
        &self,
        spec: &fleet_core::policy::AutoscalingPolicySpec,
        node_count: u32,
        utilization: f64,
        underutilized: u32,
        state: PolicyState,
        now: DateTime<Utc>,
    ) -> bool {
        if now - state.last_scale_down
            < chrono::Duration::seconds(spec.scale_down_cooldown_seconds as i64)
        {
            return false;
        }
        if node_count <= spec.min_nodes {
            return false;
        }
        underutilized > 0 && utilization < spec.scale_down_threshold
    }

    /// Pick the capacity class for new nodes by comparing the spot share
    /// against its target, then the first declared pool of that class.
    /// Reserved capacity is only chosen when a reserved pool outranks
    /// every on-demand pool.
    fn select_capacity(
        &self,
        spec: &fleet_core::policy::AutoscalingPolicySpec,
        nodes: &[Node],
    ) -> (CapacityClass, String) {
        let spot_nodes = nodes
            .iter()
            .filter(|n| n.capacity_class() == CapacityClass::Spot)
            .count();
        let spot_fraction = if nodes.is_empty() {
            0.0
        } else {
            spot_nodes as f64 / nodes.len() as f64
        };

        if spec.enable_spot_instances && spot_fraction < spec.spot_percentage {
            return (CapacityClass::Spot, spec.preferred_pool(CapacityClass::Spot));
        }

        let steady = spec
            .node_pools
            .iter()
            .filter(|p| p.capacity_class != CapacityClass::Spot)
            .max_by_key(|p| {
                (
                    p.priority,
                    // Tie-break toward on-demand over reserved
                    std::cmp::Reverse(p.capacity_class.selection_rank()),
                )
            });
        match steady {
            Some(pool) => (pool.capacity_class, pool.name.clone()),
            None => (
                CapacityClass::OnDemand,
                spec.preferred_pool(CapacityClass::OnDemand),
            ),
        }
    }

    /// Act on a decision through the cloud capability
    async fn execute(
        &self,
        policy: &AutoscalingPolicy,
        nodes: &[Node],
        decision: &ScaleDecision,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match decision.action {
            ScalingAction::ScaleUp => {
                let pool = policy
                    .spec
                    .pool(&decision.node_pool)
                    .ok_or_else(|| {
                        Error::config(format!("node pool {} not found", decision.node_pool))
                    })?
                    .clone();

                let delta = decision
                    .desired_node_count
                    .saturating_sub(nodes.len() as u32);
                if delta == 0 {
                    return Ok(());
                }

                self.cloud
                    .scale_up(&pool, delta)
                    .await
                    .map_err(fleet_core::Error::from)?;

                let mut state = self.state.lock().await;
                if let Some(entry) = state.get_mut(&policy.name) {
                    entry.last_scale_up = now;
                }
                Ok(())
            }
            ScalingAction::ScaleDown => {
                let remove_count = nodes.len().saturating_sub(decision.desired_node_count as usize);
                let victims = select_victims(nodes, remove_count);

                let mut removed = 0;
                for victim in victims {
                    if let Err(e) = drain::drain_node(&self.runtime, &victim.name).await {
                        // A stuck drain abandons this victim only
                        warn!(node = %victim.name, error = %e, "drain failed, skipping node");
                        continue;
                    }
                    match self.cloud.scale_down(&victim.name).await {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            error!(node = %victim.name, error = %e, "failed to remove node");
                        }
                    }
                }

                if removed == 0 {
                    return Err(Error::cloud("scale-down removed no nodes"));
                }

                let mut state = self.state.lock().await;
                if let Some(entry) = state.get_mut(&policy.name) {
                    entry.last_scale_down = now;
                }
                Ok(())
            }
            ScalingAction::NoAction => Ok(()),
        }
    }

    /// Publish the policy status and fleet gauges
    async fn publish(
        &self,
        policy: &mut AutoscalingPolicy,
        nodes: &[Node],
        decision: &ScaleDecision,
        now: DateTime<Utc>,
    ) {
        let count_class = |class: CapacityClass| {
            nodes.iter().filter(|n| n.capacity_class() == class).count() as u32
        };
        let spot = count_class(CapacityClass::Spot);
        let on_demand = count_class(CapacityClass::OnDemand);
        let reserved = count_class(CapacityClass::Reserved);

        let state = self.policy_state(policy, now).await;

        policy.status.current_nodes = nodes.len() as u32;
        policy.status.desired_nodes = decision.desired_node_count;
        policy.status.spot_nodes = spot;
        policy.status.on_demand_nodes = on_demand;
        policy.status.reserved_nodes = reserved;
        policy.status.average_gpu_utilization = decision.gpu_utilization;
        policy.status.pending_workloads = decision.pending_workloads;
        policy.status.last_scaling_action = Some(decision.action.as_str().to_string());
        policy.status.last_scaling_reason = Some(decision.reason.clone());
        policy.status.last_scale_up_time = Some(state.last_scale_up);
        policy.status.last_scale_down_time = Some(state.last_scale_down);

        if policy.spec.enable_predictive_scaling {
            if let Some(predictive) = &self.predictive {
                let prediction = predictive.predict();
                let next_busy_period = prediction
                    .should_pre_warm
                    .then(|| now + chrono::Duration::hours(prediction.hours_until_peak as i64));
                policy.status.predictive = Some(PredictiveStatus {
                    enabled: true,
                    predicted_utilization: prediction.predicted_utilization,
                    recommended_nodes: prediction.recommended_nodes,
                    confidence: prediction.confidence,
                    next_busy_period,
                });
            }
        }

        if let Err(e) = self.runtime.update_autoscaling_policy(policy).await {
            warn!(policy = %policy.name, error = %e, "failed to update policy status");
        }

        // Fleet gauges
        for (class, count) in [
            (CapacityClass::Spot, spot),
            (CapacityClass::OnDemand, on_demand),
            (CapacityClass::Reserved, reserved),
        ] {
            self.metrics
                .node_count
                .with_label_values(&[class.as_str()])
                .set(count as f64);
        }
        self.metrics
            .desired_node_count
            .set(decision.desired_node_count as f64);
        self.metrics.cluster_utilization.set(decision.gpu_utilization);
        self.metrics.pending_pods.set(decision.pending_workloads as f64);
        self.metrics
            .underutilized_nodes
            .set(decision.underutilized_nodes as f64);

        let up_cooldown = policy.spec.scale_up_cooldown_seconds as i64
            - (now - state.last_scale_up).num_seconds();
        let down_cooldown = policy.spec.scale_down_cooldown_seconds as i64
            - (now - state.last_scale_down).num_seconds();
        self.metrics
            .scale_up_cooldown_remaining_seconds
            .set(up_cooldown.max(0) as f64);
        self.metrics
            .scale_down_cooldown_remaining_seconds
            .set(down_cooldown.max(0) as f64);

        // Feed the predictive history from this tick's snapshot
        if let Some(predictive) = &self.predictive {
            if let Ok(running) = self.runtime.running_gpu_workloads().await {
                predictive.observe(decision.gpu_utilization, running.len() as u32);
            }
        }
    }
}

fn oldest_pending(pending: &[Workload]) -> Option<DateTime<Utc>> {
    pending.iter().filter_map(|w| w.created_at).min()
}

fn scale_up_reason(pending: &[Workload], utilization: f64, threshold: f64) -> String {
    if !pending.is_empty() {
        format!("{} pending GPU workloads waiting", pending.len())
    } else {
        format!(
            "GPU utilization {:.1}% exceeds threshold {:.1}%",
            utilization * 100.0,
            threshold * 100.0
        )
    }
}

/// Target for a scale-up: one new node per four pending workloads,
/// capped at the policy maximum
fn scale_up_target(node_count: u32, pending: u32, max_nodes: u32) -> u32 {
    let needed = (pending as f64 / PENDING_WORKLOADS_PER_NODE).ceil() as u32;
    (node_count + needed).min(max_nodes)
}

/// Target for a scale-down: remove the underutilized nodes, but never
/// more than a fifth of the fleet in one tick, and never below the
/// policy minimum
fn scale_down_target(node_count: u32, underutilized: u32, min_nodes: u32) -> u32 {
    let cap = (node_count as f64 * MAX_SCALE_DOWN_FRACTION).ceil() as u32;
    let to_remove = underutilized.min(cap);
    node_count.saturating_sub(to_remove).max(min_nodes)
}

/// The capacity class the removal pass prefers: spot first
fn preferred_removal_class(nodes: &[Node]) -> CapacityClass {
    if nodes
        .iter()
        .any(|n| n.capacity_class() == CapacityClass::Spot)
    {
        CapacityClass::Spot
    } else {
        CapacityClass::OnDemand
    }
}

/// Removal candidates: spot victims first, then on-demand, reserved last
fn select_victims(nodes: &[Node], remove_count: usize) -> Vec<Node> {
    let mut candidates: Vec<&Node> = nodes.iter().collect();
    candidates.sort_by_key(|n| n.capacity_class().selection_rank());
    candidates
        .into_iter()
        .take(remove_count)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::labels as schema;
    use std::collections::BTreeMap;

    fn node(name: &str, class: &str) -> Node {
        let mut node = Node::new(name);
        node.capacity.insert(schema::RESOURCE_WHOLE_GPU.into(), 8);
        node.labels
            .insert(schema::LABEL_CAPACITY_TYPE.into(), class.into());
        node
    }

    #[test]
    fn test_scale_up_target_math() {
        // ceil(5/4) = 2 new nodes
        assert_eq!(scale_up_target(3, 5, 100), 5);
        // One pending still adds a node
        assert_eq!(scale_up_target(0, 1, 10), 1);
        // Clamped at the maximum
        assert_eq!(scale_up_target(9, 20, 10), 10);
    }

    #[test]
    fn test_scale_down_target_math() {
        // 9 underutilized of 10, but the 20% cap removes only 2
        assert_eq!(scale_down_target(10, 9, 0), 8);
        // Fewer underutilized than the cap
        assert_eq!(scale_down_target(10, 1, 0), 9);
        // Clamped at the minimum
        assert_eq!(scale_down_target(4, 4, 3), 3);
    }

    #[test]
    fn test_victim_selection_prefers_spot() {
        let nodes = vec![
            node("od-1", "on-demand"),
            node("spot-1", "spot"),
            node("reserved-1", "reserved"),
            node("spot-2", "spot"),
        ];

        let victims = select_victims(&nodes, 3);
        let names: Vec<&str> = victims.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(&names[..2], &["spot-1", "spot-2"]);
        assert_eq!(names[2], "od-1");
    }

    #[test]
    fn test_preferred_removal_class() {
        assert_eq!(
            preferred_removal_class(&[node("a", "on-demand"), node("b", "spot")]),
            CapacityClass::Spot
        );
        assert_eq!(
            preferred_removal_class(&[node("a", "on-demand")]),
            CapacityClass::OnDemand
        );
    }

    #[test]
    fn test_oldest_pending() {
        let mut w1 = Workload::default();
        w1.created_at = Some(Utc::now() - chrono::Duration::minutes(5));
        let mut w2 = Workload::default();
        w2.created_at = Some(Utc::now() - chrono::Duration::minutes(10));

        assert_eq!(oldest_pending(&[w1.clone(), w2.clone()]), w2.created_at);
        assert_eq!(oldest_pending(&[]), None);
    }

    #[test]
    fn test_selector_matching_shapes() {
        // Sanity on the label matching used by in_scope_nodes
        let mut selector = BTreeMap::new();
        selector.insert("pool".to_string(), "research".to_string());

        let mut matching = node("a", "spot");
        matching.labels.insert("pool".into(), "research".into());
        let other = node("b", "spot");

        assert!(selector.iter().all(|(k, v)| matching.labels.get(k) == Some(v)));
        assert!(!selector.iter().all(|(k, v)| other.labels.get(k) == Some(v)));
    }
}
