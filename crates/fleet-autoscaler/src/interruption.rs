//! Spot reclamation orchestration
//!
//! Polls the cloud capability every five seconds for reclamation notices
//! on spot nodes. On notice: cordon, annotate with the deadline, and
//! drain workloads in three strictly ordered waves so critical work gets
//! the most time to land elsewhere. Waves are strictly ordered per node
//! and independent across nodes. Interruption statistics feed back into
//! the recommended spot share.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_cloud::CloudProvider;
use fleet_core::{
    labels, CapacityClass, Clock, ClusterRuntime, EventKind, EvictionPriority, Result, Workload,
};
use fleet_metrics::ControllerMetrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Poll cadence for reclamation notices
pub const RECLAMATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pause between eviction waves
const WAVE_PAUSE: Duration = Duration::from_secs(10);

/// Grace granted to high-priority workloads in the final wave
const HIGH_PRIORITY_GRACE: Duration = Duration::from_secs(30);

/// Window over which the interruption rate is computed, in hours
const RATE_WINDOW_HOURS: i64 = 24;

/// Interruption statistics over the rolling window
#[derive(Debug, Clone, PartialEq)]
pub struct SpotStats {
    pub total_spot_nodes: u32,
    pub nodes_with_warning: u32,
    pub active_terminations: u32,
    /// Interruptions in the window divided by the spot fleet size
    pub interruption_rate: f64,
    pub last_interruption: Option<DateTime<Utc>>,
}

/// Capacity guidance derived from interruption statistics
#[derive(Debug, Clone, PartialEq)]
pub struct SpotRecommendation {
    pub recommended_spot_percentage: f64,
    pub diversify_instance_types: bool,
    pub suggested_instance_types: Vec<String>,
    /// Fraction of on-demand cost the recommended share saves
    pub estimated_savings: f64,
}

/// Watches spot nodes for reclamation and drains them gracefully
pub struct SpotOrchestrator {
    runtime: Arc<dyn ClusterRuntime>,
    cloud: Arc<dyn CloudProvider>,
    metrics: ControllerMetrics,
    clock: Arc<dyn Clock>,
    /// Nodes whose reclamation is already being handled
    active: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    /// Timestamps of observed interruptions, pruned to the window
    interruptions: RwLock<Vec<DateTime<Utc>>>,
    /// In-flight drain tasks, one per reclaimed node
    drains: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    wave_pause: Duration,
}

impl SpotOrchestrator {
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        cloud: Arc<dyn CloudProvider>,
        metrics: ControllerMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runtime,
            cloud,
            metrics,
            clock,
            active: Arc::new(RwLock::new(HashMap::new())),
            interruptions: RwLock::new(Vec::new()),
            drains: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            wave_pause: WAVE_PAUSE,
        }
    }

    /// Shorten the pause between waves, for tests
    pub fn with_wave_pause(mut self, pause: Duration) -> Self {
        self.wave_pause = pause;
        self
    }

    /// Stop polling; in-flight drains finish their current wave and stop
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for every in-flight drain to finish
    pub async fn quiesce(&self) {
        let handles: Vec<_> = self.drains.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// One polling pass over all spot nodes. Detected reclamations start
    /// their drains concurrently; the pass itself never blocks on them.
    pub async fn check_once(&self) -> Result<()> {
        let spot_nodes: Vec<_> = self
            .runtime
            .list_gpu_nodes()
            .await?
            .into_iter()
            .filter(|n| n.capacity_class() == CapacityClass::Spot)
            .collect();

        let mut warnings = 0u32;
        for node in &spot_nodes {
            let notice = match self.cloud.reclamation_notice(&node.name).await {
                Ok(notice) => notice,
                Err(e) => {
                    error!(node = %node.name, error = %e, "failed to check reclamation notice");
                    continue;
                }
            };

            let Some(notice) = notice else { continue };
            warnings += 1;

            if self.active.read().await.contains_key(&node.name) {
                continue;
            }

            info!(
                node = %node.name,
                deadline = %notice.deadline,
                "spot reclamation warning received"
            );

            if let Err(e) = self.begin_reclamation(&node.name, notice.deadline).await {
                error!(node = %node.name, error = %e, "failed to handle reclamation");
            }
        }

        self.metrics.spot_termination_warnings.set(warnings as f64);
        Ok(())
    }

    /// Cordon, annotate, record the interruption, and start the drain
    async fn begin_reclamation(&self, node_name: &str, deadline: DateTime<Utc>) -> Result<()> {
        let now = self.clock.now();
        self.active
            .write()
            .await
            .insert(node_name.to_string(), deadline);

        let annotations = [
            (
                labels::ANNOTATION_RECLAMATION_PENDING.to_string(),
                "true".to_string(),
            ),
            (
                labels::ANNOTATION_RECLAMATION_DEADLINE.to_string(),
                deadline.to_rfc3339(),
            ),
        ]
        .into();
        self.runtime.annotate_node(node_name, annotations).await?;
        self.runtime.cordon_node(node_name).await?;

        self.metrics.spot_interruptions_total.inc();
        {
            let mut interruptions = self.interruptions.write().await;
            interruptions.push(now);
            let cutoff = now - ChronoDuration::hours(RATE_WINDOW_HOURS);
            interruptions.retain(|t| *t >= cutoff);
        }

        self.runtime
            .record_event(
                node_name,
                EventKind::Warning,
                "SpotReclamation",
                &format!("node will be reclaimed at {}", deadline.to_rfc3339()),
            )
            .await;

        let runtime = self.runtime.clone();
        let active = self.active.clone();
        let shutdown = self.shutdown.clone();
        let wave_pause = self.wave_pause;
        let node = node_name.to_string();
        let handle = tokio::spawn(async move {
            drain_in_waves(&runtime, &node, wave_pause, &shutdown).await;
            active.write().await.remove(&node);
        });
        self.drains.lock().await.push(handle);

        Ok(())
    }

    /// Statistics over the current spot fleet
    pub async fn stats(&self) -> Result<SpotStats> {
        let spot_nodes: Vec<_> = self
            .runtime
            .list_gpu_nodes()
            .await?
            .into_iter()
            .filter(|n| n.capacity_class() == CapacityClass::Spot)
            .collect();

        let nodes_with_warning = spot_nodes
            .iter()
            .filter(|n| n.annotation(labels::ANNOTATION_RECLAMATION_PENDING) == Some("true"))
            .count() as u32;

        let interruptions = self.interruptions.read().await;
        let rate = if spot_nodes.is_empty() {
            0.0
        } else {
            interruptions.len() as f64 / spot_nodes.len() as f64
        };

        Ok(SpotStats {
            total_spot_nodes: spot_nodes.len() as u32,
            nodes_with_warning,
            active_terminations: self.active.read().await.len() as u32,
            interruption_rate: rate,
            last_interruption: interruptions.last().copied(),
        })
    }

    /// Spot-share guidance from the interruption rate: frequent
    /// reclamation argues for a smaller, more diversified spot fleet
    pub async fn recommendation(&self) -> Result<SpotRecommendation> {
        let stats = self.stats().await?;

        let share = if stats.interruption_rate > 0.1 {
            0.4
        } else if stats.interruption_rate < 0.02 {
            0.75
        } else {
            0.6
        };

        let suggested = self
            .cloud
            .recommended_spot_instance_types()
            .await
            .unwrap_or_default();

        Ok(SpotRecommendation {
            recommended_spot_percentage: share,
            diversify_instance_types: true,
            suggested_instance_types: suggested,
            // Spot runs at a 60-90% discount; 70% is the planning figure
            estimated_savings: share * 0.70,
        })
    }
}

/// Evict a node's workloads in strict priority order: low first with no
/// grace, then medium, then high with the longest grace. Low-priority
/// work accepts hard eviction; critical work gets both the most time
/// before eviction and the longest grace after it.
async fn drain_in_waves(
    runtime: &Arc<dyn ClusterRuntime>,
    node_name: &str,
    wave_pause: Duration,
    shutdown: &AtomicBool,
) {
    let workloads = match runtime.list_workloads_on_node(node_name).await {
        Ok(workloads) => workloads,
        Err(e) => {
            error!(node = node_name, error = %e, "failed to list workloads for drain");
            return;
        }
    };

    let mut by_priority: HashMap<EvictionPriority, Vec<Workload>> = HashMap::new();
    for workload in workloads {
        by_priority
            .entry(labels::eviction_priority_of(&workload))
            .or_default()
            .push(workload);
    }

    let waves = [
        (EvictionPriority::Low, Duration::ZERO),
        (EvictionPriority::Medium, Duration::ZERO),
        (EvictionPriority::High, HIGH_PRIORITY_GRACE),
    ];

    for (index, (priority, grace)) in waves.iter().enumerate() {
        if index > 0 {
            if shutdown.load(Ordering::SeqCst) {
                warn!(node = node_name, "shutdown requested, aborting remaining waves");
                return;
            }
            tokio::time::sleep(wave_pause).await;
        }

        if let Some(wave) = by_priority.remove(priority) {
            for workload in wave {
                info!(
                    workload = %workload.workload_ref(),
                    node = node_name,
                    priority = priority.as_str(),
                    grace_seconds = grace.as_secs(),
                    "evicting workload"
                );
                if let Err(e) = runtime.evict_workload(&workload.workload_ref(), *grace).await {
                    error!(workload = %workload.workload_ref(), error = %e, "failed to evict");
                }
            }
        }
    }

    info!(node = node_name, "completed graceful eviction");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_cloud::MockCloudProvider;
    use fleet_core::SystemClock;
    use fleet_dev::MockClusterRuntime;

    fn orchestrator(
        runtime: Arc<MockClusterRuntime>,
        cloud: Arc<MockCloudProvider>,
    ) -> SpotOrchestrator {
        SpotOrchestrator::new(
            runtime,
            cloud,
            ControllerMetrics::new().unwrap(),
            Arc::new(SystemClock),
        )
        .with_wave_pause(Duration::from_millis(20))
    }

    async fn seed_mixed_priorities(runtime: &MockClusterRuntime) {
        runtime.put_gpu_node("spot-1", "spot", 8).await;

        // a: training -> high, b: inference -> medium, c: development -> low
        for (name, class) in [("a", "training"), ("b", "inference"), ("c", "development")] {
            runtime.put_running_gpu_workload("ml", name, "spot-1", 1).await;
            let mut workload = runtime
                .list_workloads_on_node("spot-1")
                .await
                .unwrap()
                .into_iter()
                .find(|w| w.name == name)
                .unwrap();
            workload
                .labels
                .insert(labels::LABEL_WORKLOAD_TYPE.into(), class.into());
            runtime.put_workload(workload).await;
        }
    }

    #[tokio::test]
    async fn test_reclamation_cordons_and_annotates() {
        let runtime = Arc::new(MockClusterRuntime::new());
        let cloud = Arc::new(MockCloudProvider::new());
        seed_mixed_priorities(&runtime).await;

        let deadline = Utc::now() + ChronoDuration::seconds(120);
        cloud.set_reclamation("spot-1", deadline).await;

        let orchestrator = orchestrator(runtime.clone(), cloud);
        orchestrator.check_once().await.unwrap();
        orchestrator.quiesce().await;

        let node = runtime.get_node("spot-1").await.unwrap();
        assert!(node.unschedulable);
        assert_eq!(
            node.annotation(labels::ANNOTATION_RECLAMATION_PENDING),
            Some("true")
        );
        assert_eq!(
            node.annotation(labels::ANNOTATION_RECLAMATION_DEADLINE),
            Some(deadline.to_rfc3339().as_str())
        );
    }

    #[tokio::test]
    async fn test_eviction_waves_are_ordered_low_medium_high() {
        let runtime = Arc::new(MockClusterRuntime::new());
        let cloud = Arc::new(MockCloudProvider::new());
        seed_mixed_priorities(&runtime).await;

        cloud
            .set_reclamation("spot-1", Utc::now() + ChronoDuration::seconds(120))
            .await;
        let orchestrator = orchestrator(runtime.clone(), cloud);
        orchestrator.check_once().await.unwrap();
        orchestrator.quiesce().await;

        let evictions = runtime.evictions().await;
        assert_eq!(evictions.len(), 3);

        // development (low) first with no grace, inference (medium) next
        // with no grace, training (high) last with 30s grace
        assert_eq!(evictions[0].workload.name, "c");
        assert_eq!(evictions[0].grace, Duration::ZERO);
        assert_eq!(evictions[1].workload.name, "b");
        assert_eq!(evictions[1].grace, Duration::ZERO);
        assert_eq!(evictions[2].workload.name, "a");
        assert_eq!(evictions[2].grace, Duration::from_secs(30));

        assert!(evictions[1].at >= evictions[0].at);
        assert!(evictions[2].at >= evictions[1].at);
    }

    #[tokio::test]
    async fn test_duplicate_notices_are_handled_once() {
        let runtime = Arc::new(MockClusterRuntime::new());
        let cloud = Arc::new(MockCloudProvider::new());
        seed_mixed_priorities(&runtime).await;

        cloud
            .set_reclamation("spot-1", Utc::now() + ChronoDuration::seconds(120))
            .await;

        let orchestrator = orchestrator(runtime.clone(), cloud);
        orchestrator.check_once().await.unwrap();
        orchestrator.quiesce().await;
        // The drain completed and the node is empty; a second notice for
        // an already-drained node evicts nothing further
        orchestrator.check_once().await.unwrap();
        orchestrator.quiesce().await;

        assert_eq!(runtime.evictions().await.len(), 3);
    }

    #[tokio::test]
    async fn test_recommendation_tracks_interruption_rate() {
        let runtime = Arc::new(MockClusterRuntime::new());
        let cloud = Arc::new(MockCloudProvider::new());
        for i in 0..10 {
            runtime.put_gpu_node(&format!("spot-{}", i), "spot", 8).await;
        }

        let orchestrator = orchestrator(runtime.clone(), cloud.clone());

        // No interruptions: rate below 2%, lean into spot
        let rec = orchestrator.recommendation().await.unwrap();
        assert!((rec.recommended_spot_percentage - 0.75).abs() < 1e-9);
        assert!((rec.estimated_savings - 0.75 * 0.70).abs() < 1e-9);

        // Two interruptions across ten nodes: 20% rate, back off
        for node in ["spot-0", "spot-1"] {
            cloud
                .set_reclamation(node, Utc::now() + ChronoDuration::seconds(120))
                .await;
        }
        orchestrator.check_once().await.unwrap();
        orchestrator.quiesce().await;

        let rec = orchestrator.recommendation().await.unwrap();
        assert!((rec.recommended_spot_percentage - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stats_count_warnings() {
        let runtime = Arc::new(MockClusterRuntime::new());
        let cloud = Arc::new(MockCloudProvider::new());
        seed_mixed_priorities(&runtime).await;
        runtime.put_gpu_node("spot-2", "spot", 8).await;

        cloud
            .set_reclamation("spot-1", Utc::now() + ChronoDuration::seconds(120))
            .await;
        let orchestrator = orchestrator(runtime.clone(), cloud);
        orchestrator.check_once().await.unwrap();
        orchestrator.quiesce().await;

        let stats = orchestrator.stats().await.unwrap();
        assert_eq!(stats.total_spot_nodes, 2);
        assert_eq!(stats.nodes_with_warning, 1);
        assert!(stats.last_interruption.is_some());
    }
}
