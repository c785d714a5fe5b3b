//! End-to-end controller scenarios against the in-memory capabilities

use chrono::Duration as ChronoDuration;
use fleet_autoscaler::{DecisionEngine, SpotOrchestrator};
use fleet_cloud::mock::CloudCall;
use fleet_cloud::MockCloudProvider;
use fleet_core::labels;
use fleet_core::policy::{
    AutoscalingPolicy, AutoscalingPolicySpec, BudgetEnforcement, BudgetScope, BudgetState,
    CostBudget, CostBudgetSpec, EnforcementAction, NodePoolSpec, ThrottleSpec,
};
use fleet_core::types::Container;
use fleet_core::{
    CapacityClass, Clock, ClusterRuntime, ScalingAction, Workload, WorkloadPhase, WorkloadRef,
};
use fleet_cost::{BudgetController, CostTracker, PricingClient};
use fleet_dev::{CapturingAlerter, ManualClock, MockClusterRuntime, Scenario};
use fleet_metrics::ControllerMetrics;
use fleet_store::{CostRow, CostStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

fn engine_for(scenario: &Scenario, cloud: Arc<MockCloudProvider>) -> DecisionEngine {
    DecisionEngine::new(
        scenario.runtime.clone(),
        scenario.metrics_reader.clone(),
        cloud,
        ControllerMetrics::new().unwrap(),
        scenario.clock.clone(),
        None,
    )
}

/// Cold pending workload triggers a spot scale-up: empty cluster, one
/// workload waiting past the trigger age, utilization zero.
#[tokio::test]
async fn cold_pending_workload_triggers_scale_up() {
    let scenario = Scenario::new();
    let policy = AutoscalingPolicy {
        name: "default".into(),
        spec: AutoscalingPolicySpec {
            max_nodes: 10,
            node_pools: vec![
                NodePoolSpec {
                    name: "gpu-spot".into(),
                    capacity_class: CapacityClass::Spot,
                    max_size: 10,
                    ..Default::default()
                },
                NodePoolSpec {
                    name: "gpu-on-demand".into(),
                    capacity_class: CapacityClass::OnDemand,
                    max_size: 10,
                    ..Default::default()
                },
            ],
            ..Default::default()
        },
        status: Default::default(),
    };
    scenario.runtime.put_policy(policy.clone()).await;
    scenario
        .runtime
        .put_pending_gpu_workload(
            "ml",
            "trainer-0",
            1,
            scenario.clock.now() - ChronoDuration::seconds(130),
        )
        .await;

    let cloud = Arc::new(MockCloudProvider::new());
    let engine = engine_for(&scenario, cloud.clone());

    let decision = engine.reconcile(policy).await.unwrap();

    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(decision.desired_node_count, 1);
    assert_eq!(decision.capacity_class, CapacityClass::Spot);
    assert!(decision.reason.contains("pending"));

    let calls = cloud.calls().await;
    assert_eq!(
        calls,
        vec![CloudCall::ScaleUp {
            pool: "gpu-spot".into(),
            count: 1
        }]
    );

    // The workload is still pending, but the scale-up cooldown has not
    // elapsed: no second scale-up is produced
    let again = engine
        .reconcile(scenario.runtime.policy("default").await.unwrap())
        .await
        .unwrap();
    assert_eq!(again.action, ScalingAction::NoAction);
    assert_eq!(cloud.calls().await.len(), 1);

    // Once the cooldown passes, the still-pending workload scales again
    scenario.clock.advance(ChronoDuration::seconds(181));
    let after_cooldown = engine
        .reconcile(scenario.runtime.policy("default").await.unwrap())
        .await
        .unwrap();
    assert_eq!(after_cooldown.action, ScalingAction::ScaleUp);
}

/// Utilization just above the threshold with an empty cluster does not
/// scale: the utilization-only trigger needs at least one node.
#[tokio::test]
async fn utilization_trigger_requires_nodes() {
    let scenario = Scenario::new().with_default_policy("default").await;
    scenario
        .metrics_reader
        .set_samples(vec![fleet_dev::mock_metrics::sample("ghost", None, 0.85)])
        .await;

    let cloud = Arc::new(MockCloudProvider::new());
    let engine = engine_for(&scenario, cloud.clone());
    let policy = scenario.runtime.policy("default").await.unwrap();

    let decision = engine.reconcile(policy).await.unwrap();
    assert_eq!(decision.action, ScalingAction::NoAction);
    assert!(cloud.calls().await.is_empty());
}

/// Utilization-driven scale-down removes at most a fifth of the fleet
/// per tick and prefers spot victims.
#[tokio::test]
async fn scale_down_respects_twenty_percent_cap() {
    let scenario = Scenario::new()
        .with_gpu_nodes("spot", CapacityClass::Spot, 4)
        .await
        .with_gpu_nodes("od", CapacityClass::OnDemand, 6)
        .await
        .with_default_policy("default")
        .await;

    // Nine nodes idle at 10%, one busy; the average stays below the
    // scale-down threshold
    let mut samples = Vec::new();
    for i in 0..4 {
        samples.push(fleet_dev::mock_metrics::sample(
            &format!("spot-{}", i),
            None,
            0.1,
        ));
    }
    for i in 0..5 {
        samples.push(fleet_dev::mock_metrics::sample(&format!("od-{}", i), None, 0.1));
    }
    samples.push(fleet_dev::mock_metrics::sample("od-5", None, 0.5));
    scenario.metrics_reader.set_samples(samples).await;

    let cloud = Arc::new(MockCloudProvider::new());
    let engine = engine_for(&scenario, cloud.clone());
    let policy = scenario.runtime.policy("default").await.unwrap();

    let decision = engine.reconcile(policy).await.unwrap();

    assert_eq!(decision.action, ScalingAction::ScaleDown);
    assert_eq!(decision.underutilized_nodes, 9);
    // ceil(10 * 0.2) = 2 removable despite nine being underutilized
    assert_eq!(decision.desired_node_count, 8);
    assert_eq!(decision.capacity_class, CapacityClass::Spot);

    let removed: Vec<String> = cloud
        .calls()
        .await
        .into_iter()
        .filter_map(|c| match c {
            CloudCall::ScaleDown { node } => Some(node),
            _ => None,
        })
        .collect();
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|n| n.starts_with("spot-")));

    // The drained victims are cordoned
    for node in removed {
        assert!(scenario.runtime.get_node(&node).await.unwrap().unschedulable);
    }
}

/// A reclaimed spot node is cordoned and its workloads leave in strict
/// priority order: development first with no grace, inference next,
/// training last with thirty seconds of grace.
#[tokio::test]
async fn reclamation_drains_in_priority_order() {
    let scenario = Scenario::new();
    let runtime = scenario.runtime.clone();
    runtime.put_gpu_node("spot-1", "spot", 8).await;

    for (name, class) in [("a", "training"), ("b", "inference"), ("c", "development")] {
        runtime
            .put_workload(Workload {
                name: name.into(),
                namespace: "ml".into(),
                phase: Some(WorkloadPhase::Running),
                node_name: Some("spot-1".into()),
                labels: [(labels::LABEL_WORKLOAD_TYPE.to_string(), class.to_string())].into(),
                containers: vec![Container {
                    name: "main".into(),
                    requests: [(labels::RESOURCE_WHOLE_GPU.to_string(), 1)].into(),
                    limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), 1)].into(),
                }],
                ..Default::default()
            })
            .await;
    }

    let cloud = Arc::new(MockCloudProvider::new());
    cloud
        .set_reclamation("spot-1", scenario.clock.now() + ChronoDuration::seconds(120))
        .await;

    let orchestrator = SpotOrchestrator::new(
        runtime.clone(),
        cloud,
        ControllerMetrics::new().unwrap(),
        scenario.clock.clone(),
    )
    .with_wave_pause(Duration::from_millis(10));

    orchestrator.check_once().await.unwrap();
    orchestrator.quiesce().await;

    let node = runtime.get_node("spot-1").await.unwrap();
    assert!(node.unschedulable);
    assert_eq!(
        node.annotation(labels::ANNOTATION_RECLAMATION_PENDING),
        Some("true")
    );

    let evictions = runtime.evictions().await;
    let order: Vec<(&str, u64)> = evictions
        .iter()
        .map(|e| (e.workload.name.as_str(), e.grace.as_secs()))
        .collect();
    assert_eq!(order, vec![("c", 0), ("b", 0), ("a", 30)]);
}

/// A budget past its limit with throttle enforcement clamps the spot
/// pools of overlapping policies, then restores them when the budget
/// recovers.
#[tokio::test]
async fn exceeded_budget_throttles_and_reverts() {
    let runtime = Arc::new(MockClusterRuntime::new());
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(MemoryStore::new());

    // A month of spend already persisted for the scope
    store
        .insert_pod_cost(CostRow {
            time: clock.now(),
            workload: WorkloadRef::new("ml", "trainer-0"),
            node: "spot-0".into(),
            gpu_type: "nvidia-tesla-a100".into(),
            gpu_count: 8,
            capacity_class: "spot".into(),
            sharing_mode: "exclusive".into(),
            hourly_rate: 12.0,
            cumulative_cost: 1050.0,
            team: "research".into(),
            project: String::new(),
            experiment_id: String::new(),
            cost_center: String::new(),
            labels: Default::default(),
        })
        .await
        .unwrap();

    runtime
        .put_policy(AutoscalingPolicy {
            name: "default".into(),
            spec: AutoscalingPolicySpec {
                node_pools: vec![NodePoolSpec {
                    name: "gpu-spot".into(),
                    capacity_class: CapacityClass::Spot,
                    min_size: 0,
                    max_size: 50,
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: Default::default(),
        })
        .await;

    let budget = CostBudget {
        name: "ml-monthly".into(),
        spec: CostBudgetSpec {
            monthly_limit: 1000.0,
            scope: BudgetScope {
                namespaces: vec!["ml".into()],
                ..Default::default()
            },
            enforcement: Some(BudgetEnforcement {
                action: EnforcementAction::Throttle,
                grace_period_minutes: 0,
                throttle: Some(ThrottleSpec {
                    max_spot_instances: Some(2),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        },
        status: Default::default(),
    };
    runtime.put_budget(budget.clone()).await;

    let cloud = Arc::new(MockCloudProvider::new());
    let pricing = Arc::new(PricingClient::new(cloud, clock.clone(), "us-east-1"));
    let tracker = Arc::new(CostTracker::new(
        runtime.clone(),
        pricing,
        Some(store.clone()),
        ControllerMetrics::new().unwrap(),
        clock.clone(),
    ));
    let alerter = Arc::new(CapturingAlerter::new());
    let controller = BudgetController::new(
        runtime.clone(),
        tracker,
        Some(store),
        alerter,
        ControllerMetrics::new().unwrap(),
        clock.clone(),
    );

    controller.reconcile(budget).await.unwrap();

    let stored = runtime.budget("ml-monthly").await.unwrap();
    assert_eq!(stored.status.state, BudgetState::Exceeded);
    assert!((stored.status.current_spend - 1050.0).abs() < 1e-6);
    assert!(stored.status.enforcement_active);
    assert_eq!(stored.status.exceeded_since, Some(clock.now()));

    let policy = runtime.policy("default").await.unwrap();
    assert_eq!(policy.spec.node_pools[0].max_size, 2);

    // Re-running the reconcile must not re-apply the mutation
    controller
        .reconcile(runtime.budget("ml-monthly").await.unwrap())
        .await
        .unwrap();
    assert_eq!(
        runtime.policy("default").await.unwrap().spec.node_pools[0].max_size,
        2
    );
    assert_eq!(
        runtime
            .budget("ml-monthly")
            .await
            .unwrap()
            .status
            .throttled_pools
            .len(),
        1
    );

    // Raising the limit brings the budget back under: enforcement lifts
    // and the declared bounds return
    let mut recovered = runtime.budget("ml-monthly").await.unwrap();
    recovered.spec.monthly_limit = 2000.0;
    controller.reconcile(recovered).await.unwrap();

    let stored = runtime.budget("ml-monthly").await.unwrap();
    assert_ne!(stored.status.state, BudgetState::Exceeded);
    assert!(!stored.status.enforcement_active);
    assert_eq!(stored.status.exceeded_since, None);
    assert!(stored.status.throttled_pools.is_empty());
    assert_eq!(
        runtime.policy("default").await.unwrap().spec.node_pools[0].max_size,
        50
    );
}

/// Cost accrual survives a controller restart without double counting:
/// the restarted tracker resumes within one tick of the persisted total.
#[tokio::test]
async fn cost_accrual_resumes_after_restart() {
    let runtime = Arc::new(MockClusterRuntime::new());
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(MemoryStore::new());
    let cloud = Arc::new(MockCloudProvider::new());

    // A node whose GPU type maps to an eight-GPU instance priced at
    // $3.00/h by the mock cloud: $0.375 per GPU-hour
    let mut node = fleet_core::Node::new("gpu-1");
    node.capacity.insert(labels::RESOURCE_WHOLE_GPU.into(), 8);
    node.labels
        .insert(labels::LABEL_GPU_PRODUCT.into(), "nvidia-tesla-a100".into());
    runtime.put_node(node).await;

    // An eight-GPU workload accrues at $3.00/hour
    let start = clock.now();
    runtime
        .put_workload(Workload {
            name: "trainer-0".into(),
            namespace: "ml".into(),
            phase: Some(WorkloadPhase::Running),
            node_name: Some("gpu-1".into()),
            containers: vec![Container {
                name: "main".into(),
                requests: [(labels::RESOURCE_WHOLE_GPU.to_string(), 8)].into(),
                limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), 8)].into(),
            }],
            created_at: Some(start),
            started_at: Some(start),
            ..Default::default()
        })
        .await;

    let tracker = |clock: Arc<ManualClock>| {
        CostTracker::new(
            runtime.clone(),
            Arc::new(PricingClient::new(cloud.clone(), clock.clone(), "us-east-1")),
            Some(store.clone()),
            ControllerMetrics::new().unwrap(),
            clock,
        )
    };

    let first = tracker(clock.clone());
    first.tick().await.unwrap();

    clock.advance(ChronoDuration::minutes(10));
    first.tick().await.unwrap();

    let target = WorkloadRef::new("ml", "trainer-0");
    let before_restart = first.pod_cost(&target).unwrap().total_cost;
    assert!((before_restart - 0.5).abs() < 1e-6);

    // Restart: a fresh tracker over the same store and runtime
    drop(first);
    let second = tracker(clock.clone());
    clock.advance(ChronoDuration::minutes(1));
    second.tick().await.unwrap();

    let after_restart = second.pod_cost(&target).unwrap().total_cost;
    let expected = 3.0 * (11.0 / 60.0);
    assert!(
        (after_restart - expected).abs() < 3.0 * (60.0 / 3600.0),
        "resumed total {} should be within one tick of {}",
        after_restart,
        expected
    );
    assert!(after_restart >= before_restart, "totals must never decrease");
}

/// A workload-listing failure aborts the autoscaling tick entirely.
#[tokio::test]
async fn pending_list_failure_aborts_tick() {
    let scenario = Scenario::new()
        .with_gpu_nodes("spot", CapacityClass::Spot, 2)
        .await
        .with_default_policy("default")
        .await;
    scenario.runtime.fail_workload_list(true).await;

    let cloud = Arc::new(MockCloudProvider::new());
    let engine = engine_for(&scenario, cloud.clone());
    let policy = scenario.runtime.policy("default").await.unwrap();

    assert!(engine.reconcile(policy).await.is_err());
    assert!(cloud.calls().await.is_empty());
}
