//! Budget reconciliation and enforcement
//!
//! Each reconcile recomputes a budget's spend over its scope, fires any
//! newly crossed threshold alerts, and applies or lifts enforcement.
//! Spend prefers the time-series store for historical accuracy; when a
//! scope lists both namespaces and teams, the namespace query is
//! canonical and the team list only refines workload matching, which
//! avoids double-counting workloads that match both dimensions. The
//! in-memory fallback only reflects accruals since controller start.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, TimeZone, Utc};
use fleet_core::policy::{
    BudgetScope, BudgetState, BlockedScope, CostBreakdown, CostBudget, EnforcementAction,
    AlertFired, PoolBoundsSnapshot,
};
use fleet_core::{CapacityClass, Clock, ClusterRuntime, EventKind, PodCost, Result};
use fleet_metrics::ControllerMetrics;
use fleet_store::{BudgetStatePoint, CostScope, CostStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::alerter::{AlertDispatch, AlertMessage};
use crate::tracker::CostTracker;

/// Deadline applied to each outbound alert call, derived from the
/// reconcile cadence
const ALERT_DEADLINE: Duration = Duration::from_secs(10);

/// Reconciles CostBudget objects
pub struct BudgetController {
    runtime: Arc<dyn ClusterRuntime>,
    tracker: Arc<CostTracker>,
    store: Option<Arc<dyn CostStore>>,
    alerter: Arc<dyn AlertDispatch>,
    metrics: ControllerMetrics,
    clock: Arc<dyn Clock>,
}

impl BudgetController {
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        tracker: Arc<CostTracker>,
        store: Option<Arc<dyn CostStore>>,
        alerter: Arc<dyn AlertDispatch>,
        metrics: ControllerMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runtime,
            tracker,
            store,
            alerter,
            metrics,
            clock,
        }
    }

    /// Reconcile every declared budget
    pub async fn reconcile_all(&self) -> Result<()> {
        for budget in self.runtime.cost_budgets().await? {
            if !budget.spec.enabled {
                debug!(budget = %budget.name, "budget disabled, skipping");
                continue;
            }
            if let Err(e) = self.reconcile(budget).await {
                error!(error = %e, "budget reconcile failed");
                self.metrics.reconcile_errors_total.inc();
            }
        }
        Ok(())
    }

    /// One budget reconcile: status, alerts, enforcement, persistence
    pub async fn reconcile(&self, mut budget: CostBudget) -> Result<()> {
        let now = self.clock.now();
        let (period_start, period_end) = budget_period(budget.spec.start_date, now);

        let current_spend = self.scope_spend(&budget, period_start, now).await?;

        let percentage = if budget.spec.monthly_limit > 0.0 {
            current_spend / budget.spec.monthly_limit * 100.0
        } else {
            0.0
        };
        let state = BudgetState::classify(percentage);

        budget.status.current_spend = current_spend;
        budget.status.percentage_used = percentage;
        budget.status.projected_monthly_spend =
            project_monthly_spend(current_spend, period_start, period_end, now);
        budget.status.days_remaining =
            ((period_end - now).num_days().max(0)) as u32;
        budget.status.breakdown = self.breakdown(&budget.spec.scope);
        budget.status.last_updated = Some(now);

        // exceeded_since is set on the first transition into exceeded and
        // cleared the moment the budget drops back below the limit
        match (state, budget.status.exceeded_since) {
            (BudgetState::Exceeded, None) => budget.status.exceeded_since = Some(now),
            (BudgetState::Exceeded, Some(_)) => {}
            (_, Some(_)) => budget.status.exceeded_since = None,
            (_, None) => {}
        }
        budget.status.state = state;

        debug!(
            budget = %budget.name,
            current_spend,
            percentage,
            state = state.as_str(),
            "updated budget status"
        );

        self.check_alerts(&mut budget, now).await;

        if let Err(e) = self.enforce(&mut budget, now).await {
            // Enforcement failures never fail the budget reconcile
            error!(budget = %budget.name, error = %e, "budget enforcement failed");
        }

        self.runtime.update_cost_budget(&budget).await?;

        if let Some(store) = &self.store {
            let point = BudgetStatePoint {
                time: now,
                budget: budget.name.clone(),
                namespace: budget
                    .spec
                    .scope
                    .namespaces
                    .first()
                    .cloned()
                    .unwrap_or_default(),
                team: budget.spec.scope.teams.first().cloned().unwrap_or_default(),
                monthly_limit: budget.spec.monthly_limit,
                current_spend,
                percentage_used: percentage,
                state: state.as_str().to_string(),
            };
            if let Err(e) = store.upsert_budget_state(point).await {
                warn!(budget = %budget.name, error = %e, "failed to persist budget state");
            }
        }

        self.metrics
            .budget_percentage
            .with_label_values(&[&budget.name])
            .set(percentage);

        Ok(())
    }

    /// Total spend for a budget's scope over [start, end]
    async fn scope_spend(
        &self,
        budget: &CostBudget,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64> {
        let scope = &budget.spec.scope;

        if let Some(store) = &self.store {
            // Namespace queries are canonical when both namespaces and
            // teams are present; summing both would double-count
            // workloads matching both dimensions.
            if !scope.namespaces.is_empty() {
                let mut total = 0.0;
                for ns in &scope.namespaces {
                    match store
                        .query_cost(&CostScope::Namespace(ns.clone()), start, end)
                        .await
                    {
                        Ok(cost) => total += cost,
                        Err(e) => {
                            warn!(namespace = %ns, error = %e, "namespace cost query failed");
                        }
                    }
                }
                return Ok(total);
            }

            if !scope.teams.is_empty() {
                let mut total = 0.0;
                for team in &scope.teams {
                    match store
                        .query_cost(&CostScope::Team(team.clone()), start, end)
                        .await
                    {
                        Ok(cost) => total += cost,
                        Err(e) => {
                            warn!(team = %team, error = %e, "team cost query failed");
                        }
                    }
                }
                return Ok(total);
            }
        }

        // In-memory fallback: undercounts because it only reflects
        // accruals since controller start
        Ok(self
            .tracker
            .snapshot()
            .iter()
            .filter(|cost| scope_covers_cost(scope, cost))
            .map(|cost| cost.total_cost)
            .sum())
    }

    /// Spend breakdown over the scope from the live cache
    fn breakdown(&self, scope: &BudgetScope) -> CostBreakdown {
        let mut breakdown = CostBreakdown::default();
        for cost in self.tracker.snapshot() {
            if !scope_covers_cost(scope, &cost) {
                continue;
            }
            *breakdown
                .by_namespace
                .entry(cost.workload.namespace.clone())
                .or_default() += cost.total_cost;
            if !cost.team.is_empty() {
                *breakdown.by_team.entry(cost.team.clone()).or_default() += cost.total_cost;
            }
            *breakdown
                .by_gpu_type
                .entry(cost.gpu_type.clone())
                .or_default() += cost.total_cost;
            *breakdown
                .by_capacity_class
                .entry(cost.capacity_class.to_string())
                .or_default() += cost.total_cost;
        }
        breakdown
    }

    /// Fire any crossed thresholds that have no unacknowledged alert yet
    async fn check_alerts(&self, budget: &mut CostBudget, now: DateTime<Utc>) {
        let alerts = budget.spec.alerts.clone();
        for alert in &alerts {
            if budget.status.percentage_used < alert.threshold_percent {
                continue;
            }
            let already_fired = budget
                .status
                .alerts_fired
                .iter()
                .any(|fired| fired.name == alert.name && !fired.acknowledged);
            if already_fired {
                continue;
            }

            info!(
                budget = %budget.name,
                alert = %alert.name,
                threshold = alert.threshold_percent,
                current = budget.status.percentage_used,
                "firing budget alert"
            );

            let message = AlertMessage {
                budget: budget.name.clone(),
                alert: alert.name.clone(),
                severity: alert.severity,
                current_spend: budget.status.current_spend,
                monthly_limit: budget.spec.monthly_limit,
                percentage_used: budget.status.percentage_used,
                threshold: alert.threshold_percent,
                timestamp: now,
            };

            // Channel errors are isolated so one bad channel cannot
            // block the others
            for channel in &alert.channels {
                if let Err(e) = self
                    .alerter
                    .send_alert(channel, &message, ALERT_DEADLINE)
                    .await
                {
                    error!(
                        budget = %budget.name,
                        channel = channel.kind.as_str(),
                        error = %e,
                        "failed to send alert"
                    );
                }
            }

            self.runtime
                .record_event(
                    &budget.name,
                    EventKind::Warning,
                    "BudgetAlert",
                    &format!(
                        "Budget '{}' has reached {:.1}% of monthly limit (${:.2} / ${:.2})",
                        budget.name,
                        budget.status.percentage_used,
                        budget.status.current_spend,
                        budget.spec.monthly_limit
                    ),
                )
                .await;

            budget.status.alerts_fired.push(AlertFired {
                name: alert.name.clone(),
                timestamp: now,
                threshold: alert.threshold_percent,
                acknowledged: false,
            });
        }
    }

    /// Apply or lift enforcement according to the budget state
    async fn enforce(&self, budget: &mut CostBudget, now: DateTime<Utc>) -> Result<()> {
        if budget.status.state != BudgetState::Exceeded {
            if budget.status.enforcement_active {
                info!(budget = %budget.name, "budget no longer exceeded, lifting enforcement");
                self.lift_enforcement(budget).await;
                budget.status.enforcement_active = false;
                self.runtime
                    .record_event(
                        &budget.name,
                        EventKind::Normal,
                        "EnforcementLifted",
                        "Budget enforcement has been lifted",
                    )
                    .await;
            }
            return Ok(());
        }

        let Some(enforcement) = budget.spec.enforcement.clone() else {
            return Ok(());
        };

        let grace = ChronoDuration::minutes(enforcement.grace_period_minutes as i64);
        if let Some(since) = budget.status.exceeded_since {
            if now - since < grace {
                debug!(
                    budget = %budget.name,
                    remaining_seconds = (grace - (now - since)).num_seconds(),
                    "budget exceeded but in grace period"
                );
                return Ok(());
            }
        }

        if budget.status.enforcement_active {
            return Ok(());
        }

        info!(
            budget = %budget.name,
            action = ?enforcement.action,
            "enforcing budget limit"
        );

        match enforcement.action {
            EnforcementAction::Alert => {
                self.runtime
                    .record_event(
                        &budget.name,
                        EventKind::Warning,
                        "BudgetExceeded",
                        "Budget has been exceeded",
                    )
                    .await;
            }
            EnforcementAction::Throttle => {
                self.apply_throttle(budget).await;
                self.runtime
                    .record_event(
                        &budget.name,
                        EventKind::Warning,
                        "BudgetThrottled",
                        "Spot GPU capacity is being throttled due to budget limit",
                    )
                    .await;
            }
            EnforcementAction::Block => {
                self.apply_block(budget).await?;
                self.runtime
                    .record_event(
                        &budget.name,
                        EventKind::Warning,
                        "BudgetBlocked",
                        "New GPU workloads are blocked due to budget limit",
                    )
                    .await;
            }
        }

        budget.status.enforcement_active = true;
        Ok(())
    }

    /// Clamp spot pools of every overlapping autoscaling policy,
    /// snapshotting declared bounds first so the lift can restore them
    async fn apply_throttle(&self, budget: &mut CostBudget) {
        let Some(throttle) = budget
            .spec
            .enforcement
            .as_ref()
            .and_then(|e| e.throttle.clone())
        else {
            return;
        };

        let policies = match self.runtime.autoscaling_policies().await {
            Ok(policies) => policies,
            Err(e) => {
                error!(budget = %budget.name, error = %e, "failed to list policies for throttling");
                return;
            }
        };

        for mut policy in policies {
            if !policy_overlaps_scope(&policy.spec.node_selector, &budget.spec.scope) {
                continue;
            }

            let mut modified = false;
            for pool in policy.spec.node_pools.iter_mut() {
                if pool.capacity_class != CapacityClass::Spot {
                    continue;
                }

                let already_snapshotted = budget
                    .status
                    .throttled_pools
                    .iter()
                    .any(|s| s.policy == policy.name && s.pool == pool.name);
                if !already_snapshotted {
                    budget.status.throttled_pools.push(PoolBoundsSnapshot {
                        policy: policy.name.clone(),
                        pool: pool.name.clone(),
                        min_size: pool.min_size,
                        max_size: pool.max_size,
                    });
                }

                if throttle.block_spot_creation {
                    pool.min_size = 0;
                    pool.max_size = 0;
                    modified = true;
                } else if let Some(cap) = throttle.max_spot_instances {
                    if pool.max_size > cap {
                        pool.max_size = cap;
                        modified = true;
                    }
                }
            }

            if modified {
                match self.runtime.update_autoscaling_policy(&policy).await {
                    Ok(()) => {
                        info!(budget = %budget.name, policy = %policy.name, "applied budget throttling")
                    }
                    Err(e) => {
                        error!(policy = %policy.name, error = %e, "failed to update policy for throttling")
                    }
                }
            }
        }
    }

    /// Restore snapshotted pool bounds and unblock admissions
    async fn lift_enforcement(&self, budget: &mut CostBudget) {
        let snapshots = std::mem::take(&mut budget.status.throttled_pools);
        if !snapshots.is_empty() {
            let policies = match self.runtime.autoscaling_policies().await {
                Ok(policies) => policies,
                Err(e) => {
                    error!(error = %e, "failed to list policies for throttle revert");
                    budget.status.throttled_pools = snapshots;
                    return;
                }
            };

            for mut policy in policies {
                let mut modified = false;
                for pool in policy.spec.node_pools.iter_mut() {
                    if let Some(snapshot) = snapshots
                        .iter()
                        .find(|s| s.policy == policy.name && s.pool == pool.name)
                    {
                        pool.min_size = snapshot.min_size;
                        pool.max_size = snapshot.max_size;
                        modified = true;
                    }
                }
                if modified {
                    if let Err(e) = self.runtime.update_autoscaling_policy(&policy).await {
                        error!(policy = %policy.name, error = %e, "failed to revert throttle");
                    }
                }
            }
        }

        // Remove this budget's admission block, if any
        match self.runtime.admission_guard().await {
            Ok(mut guard) => {
                let before = guard.blocked_scopes.len();
                guard.blocked_scopes.retain(|b| b.budget != budget.name);
                if guard.blocked_scopes.len() != before {
                    if let Err(e) = self.runtime.set_admission_guard(&guard).await {
                        error!(budget = %budget.name, error = %e, "failed to clear admission block");
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to read admission guard"),
        }
    }

    /// Signal the admission guard to reject new GPU workloads in scope.
    /// The rewriter is not the enforcer; the guard reads this config.
    async fn apply_block(&self, budget: &CostBudget) -> Result<()> {
        let mut guard = self.runtime.admission_guard().await?;
        if guard.blocked_scopes.iter().any(|b| b.budget == budget.name) {
            return Ok(());
        }
        guard.blocked_scopes.push(BlockedScope {
            budget: budget.name.clone(),
            scope: budget.spec.scope.clone(),
        });
        self.runtime.set_admission_guard(&guard).await
    }
}

/// The budget period containing `now`: the declared start date or the
/// first of the current month, spanning one month
pub fn budget_period(
    start_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = start_date.unwrap_or_else(|| {
        Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now)
    });
    let end = start
        .checked_add_months(Months::new(1))
        .unwrap_or(start + ChronoDuration::days(30));
    (start, end)
}

/// Projected month-end spend from the run rate so far, zero-guarded
pub fn project_monthly_spend(
    current_spend: f64,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let days_elapsed = (now - period_start).num_seconds() as f64 / 86_400.0;
    if days_elapsed <= 0.0 {
        return 0.0;
    }
    let days_in_period = (period_end - period_start).num_seconds() as f64 / 86_400.0;
    current_spend / days_elapsed * days_in_period
}

/// Whether a budget scope covers a cached cost record
fn scope_covers_cost(scope: &BudgetScope, cost: &PodCost) -> bool {
    if !scope.namespaces.is_empty() && !scope.namespaces.contains(&cost.workload.namespace) {
        return false;
    }
    for (k, v) in &scope.labels {
        if cost.labels.get(k) != Some(v) {
            return false;
        }
    }
    if !scope.experiment_id.is_empty() && cost.experiment_id != scope.experiment_id {
        return false;
    }
    if !scope.teams.is_empty() && !scope.teams.iter().any(|t| t == &cost.team) {
        return false;
    }
    true
}

/// Whether an autoscaling policy's node scope can serve workloads in a
/// budget's scope. Workload placement is not knowable here, so a policy
/// only escapes throttling when it is pinned to a node subset and the
/// budget is bounded.
fn policy_overlaps_scope(
    node_selector: &std::collections::BTreeMap<String, String>,
    scope: &BudgetScope,
) -> bool {
    scope.is_unbounded() || node_selector.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{SharingMode, WorkloadRef};
    use std::collections::BTreeMap;

    #[test]
    fn test_budget_period_defaults_to_month_start() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap();
        let (start, end) = budget_period(None, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_budget_period_honors_declared_start() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        let declared = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let (start, end) = budget_period(Some(declared), now);
        assert_eq!(start, declared);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 4, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_projection_math() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();

        // 10 days in, $100 spent, 30-day period: projects to $300
        let now = start + ChronoDuration::days(10);
        let projected = project_monthly_spend(100.0, start, end, now);
        assert!((projected - 300.0).abs() < 1e-6);

        // Division-by-zero guard at period start
        assert_eq!(project_monthly_spend(100.0, start, end, start), 0.0);
    }

    fn cost(ns: &str, team: &str) -> PodCost {
        PodCost {
            workload: WorkloadRef::new(ns, "w"),
            node: "n".into(),
            gpu_type: "nvidia-tesla-t4".into(),
            gpu_count: 1,
            capacity_class: CapacityClass::Spot,
            sharing_mode: SharingMode::Exclusive,
            start_time: Utc::now(),
            hourly_rate: 1.0,
            total_cost: 5.0,
            last_updated: Utc::now(),
            labels: BTreeMap::new(),
            team: team.into(),
            project: String::new(),
            experiment_id: String::new(),
            cost_center: String::new(),
        }
    }

    #[test]
    fn test_scope_covers_cost() {
        let scope = BudgetScope {
            namespaces: vec!["ml".into()],
            teams: vec!["research".into()],
            ..Default::default()
        };

        assert!(scope_covers_cost(&scope, &cost("ml", "research")));
        assert!(!scope_covers_cost(&scope, &cost("ml", "platform")));
        assert!(!scope_covers_cost(&scope, &cost("web", "research")));

        let unbounded = BudgetScope::default();
        assert!(scope_covers_cost(&unbounded, &cost("anything", "anyone")));
    }

    #[test]
    fn test_policy_overlap_rule() {
        let unbounded = BudgetScope::default();
        let bounded = BudgetScope {
            namespaces: vec!["ml".into()],
            ..Default::default()
        };

        let cluster_wide = BTreeMap::new();
        let pinned: BTreeMap<String, String> =
            [("pool".to_string(), "research".to_string())].into();

        assert!(policy_overlaps_scope(&cluster_wide, &unbounded));
        assert!(policy_overlaps_scope(&cluster_wide, &bounded));
        assert!(policy_overlaps_scope(&pinned, &unbounded));
        assert!(!policy_overlaps_scope(&pinned, &bounded));
    }
}
