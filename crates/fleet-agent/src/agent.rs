//! The controller process
//!
//! One agent hosts every reconcile loop on a shared set of capabilities:
//! the cluster runtime client, the metrics read model, one cloud
//! provider, one cost store handle, and one alert dispatcher. Loops run
//! cooperatively on the tokio runtime; each is short, independently
//! retryable, and stops at the shutdown signal. A cancelled loop simply
//! does not run its next tick, so no cooldown advances and no alert is
//! marked fired by a cancelled reconcile.

use crate::config::AgentConfig;
use fleet_autoscaler::{DecisionEngine, PredictiveScaler, SpotOrchestrator};
use fleet_cloud::{AwsProvider, AzureProvider, CloudProvider, GcpProvider};
use fleet_core::traits::EnvSecretStore;
use fleet_core::{Clock, ClusterRuntime, Error, MetricsReader, Result, SystemClock};
use fleet_cost::{Alerter, AttributionController, BudgetController, CostTracker, PricingClient};
use fleet_metrics::{ControllerMetrics, MetricsEndpoint};
use fleet_sharing::rewriter::RewriterConfig;
use fleet_sharing::{AdmissionServer, NodeConfigReconciler, WorkloadRewriter};
use fleet_store::{CostStore, MemoryStore};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Handle to one running reconcile loop
struct ServiceHandle {
    name: &'static str,
    handle: tokio::task::JoinHandle<()>,
}

/// The gpufleet controller
pub struct Agent {
    config: AgentConfig,
    metrics: ControllerMetrics,
    metrics_reader: Arc<dyn MetricsReader>,
    clock: Arc<dyn Clock>,

    engine: Arc<DecisionEngine>,
    orchestrator: Arc<SpotOrchestrator>,
    tracker: Arc<CostTracker>,
    budget: Arc<BudgetController>,
    attribution: Arc<AttributionController>,
    node_config: Arc<NodeConfigReconciler>,
    store: Option<Arc<MemoryStore>>,

    metrics_endpoint: Option<MetricsEndpoint>,
    admission_server: Option<AdmissionServer>,

    services: Vec<ServiceHandle>,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Start every configured loop and server
    pub async fn start(&mut self) -> Result<()> {
        info!(agent = %self.config.agent.name, "starting gpufleet agent");
        self.config.validate()?;

        if let Some(endpoint) = &mut self.metrics_endpoint {
            endpoint
                .start()
                .await
                .map_err(|e| Error::internal(format!("metrics endpoint failed: {}", e)))?;
        }
        if let Some(server) = &mut self.admission_server {
            server.start().await?;
        }

        self.spawn_loops();

        info!("gpufleet agent started");
        Ok(())
    }

    /// Stop loops and servers; in-flight drains finish their current
    /// wave
    pub async fn stop(&mut self) {
        info!("stopping gpufleet agent");
        let _ = self.shutdown_tx.send(true);
        self.orchestrator.shutdown();
        self.orchestrator.quiesce().await;

        for service in self.services.drain(..) {
            service.handle.abort();
            match service.handle.await {
                Ok(()) => info!(service = service.name, "service stopped"),
                Err(e) if e.is_cancelled() => {
                    info!(service = service.name, "service cancelled")
                }
                Err(e) => error!(service = service.name, error = %e, "service panicked"),
            }
        }

        if let Some(server) = &mut self.admission_server {
            server.stop().await;
        }
        if let Some(endpoint) = &mut self.metrics_endpoint {
            endpoint.stop().await;
        }

        info!("gpufleet agent stopped");
    }

    /// Run until a termination signal arrives
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        wait_for_termination().await;
        info!("received termination signal");

        self.stop().await;
        Ok(())
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    fn spawn_loops(&mut self) {
        let intervals = self.config.intervals.clone();

        // Autoscaling, with jitter so many controllers don't align
        let engine = self.engine.clone();
        let jitter = intervals.autoscaling_jitter_seconds;
        self.spawn(
            "autoscaler",
            Duration::from_secs(intervals.autoscaling_seconds),
            Some(jitter),
            move || {
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine.reconcile_all().await {
                        error!(error = %e, "autoscaling pass failed");
                    }
                }
            },
        );

        let orchestrator = self.orchestrator.clone();
        self.spawn(
            "spot-orchestrator",
            Duration::from_secs(intervals.interruption_seconds),
            None,
            move || {
                let orchestrator = orchestrator.clone();
                async move {
                    if let Err(e) = orchestrator.check_once().await {
                        error!(error = %e, "reclamation polling failed");
                    }
                }
            },
        );

        let tracker = self.tracker.clone();
        self.spawn(
            "cost-tracker",
            Duration::from_secs(intervals.cost_seconds),
            None,
            move || {
                let tracker = tracker.clone();
                async move {
                    if let Err(e) = tracker.tick().await {
                        error!(error = %e, "cost accrual failed");
                    }
                }
            },
        );

        let budget = self.budget.clone();
        self.spawn(
            "budget-controller",
            Duration::from_secs(intervals.budget_seconds),
            None,
            move || {
                let budget = budget.clone();
                async move {
                    if let Err(e) = budget.reconcile_all().await {
                        error!(error = %e, "budget pass failed");
                    }
                }
            },
        );

        let attribution = self.attribution.clone();
        self.spawn(
            "attribution-controller",
            Duration::from_secs(intervals.attribution_seconds),
            None,
            move || {
                let attribution = attribution.clone();
                async move {
                    if let Err(e) = attribution.reconcile_all().await {
                        error!(error = %e, "attribution pass failed");
                    }
                }
            },
        );

        let node_config = self.node_config.clone();
        self.spawn(
            "node-config",
            Duration::from_secs(intervals.node_config_seconds),
            None,
            move || {
                let node_config = node_config.clone();
                async move {
                    if let Err(e) = node_config.reconcile_all().await {
                        error!(error = %e, "node config pass failed");
                    }
                }
            },
        );

        if let Some(store) = self.store.clone() {
            let clock = self.clock.clone();
            self.spawn("store-retention", Duration::from_secs(3600), None, move || {
                let store = store.clone();
                let clock = clock.clone();
                async move {
                    store.prune(clock.now()).await;
                }
            });
        }

        // Waste analysis: log sharing opportunities for heavily
        // underused allocations
        let reader = self.metrics_reader.clone();
        self.spawn("waste-analyzer", Duration::from_secs(600), None, move || {
            let reader = reader.clone();
            async move {
                match fleet_sharing::waste::analyze(&reader, 10).await {
                    Ok(reports) => {
                        for report in reports
                            .iter()
                            .filter(|r| r.waste_score > fleet_sharing::waste::SIGNIFICANT_WASTE_SCORE)
                        {
                            info!(
                                workload = %report.workload,
                                node = %report.node,
                                waste_score = report.waste_score,
                                gpu_utilization = report.avg_utilization,
                                recommendation = %report.recommendation,
                                "GPU waste detected"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "waste analysis failed"),
                }
            }
        });

        // Periodic spot posture summary: interruption statistics and the
        // resulting capacity recommendation
        let orchestrator = self.orchestrator.clone();
        self.spawn("spot-insights", Duration::from_secs(600), None, move || {
            let orchestrator = orchestrator.clone();
            async move {
                let stats = match orchestrator.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        error!(error = %e, "spot stats failed");
                        return;
                    }
                };
                match orchestrator.recommendation().await {
                    Ok(rec) => info!(
                        spot_nodes = stats.total_spot_nodes,
                        interruption_rate = stats.interruption_rate,
                        recommended_spot_share = rec.recommended_spot_percentage,
                        estimated_savings = rec.estimated_savings,
                        suggested_instance_types = ?rec.suggested_instance_types,
                        "spot capacity posture"
                    ),
                    Err(e) => error!(error = %e, "spot recommendation failed"),
                }
            }
        });
    }

    /// Spawn one loop that ticks at the cadence until shutdown
    fn spawn<F, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        jitter_seconds: Option<u64>,
        tick: F,
    ) where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            info!(service = name, period_seconds = period.as_secs(), "service started");
            loop {
                let sleep_for = match jitter_seconds {
                    Some(max) if max > 0 => {
                        period + Duration::from_millis(rand::thread_rng().gen_range(0..max * 1000))
                    }
                    _ => period,
                };
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(sleep_for) => {
                        tick().await;
                    }
                }
            }
            info!(service = name, "service loop exited");
        });
        self.services.push(ServiceHandle { name, handle });
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Builds an agent from config plus the two capabilities the process
/// cannot construct itself: the cluster runtime client and the metrics
/// read model.
pub struct AgentBuilder {
    config: AgentConfig,
    runtime: Option<Arc<dyn ClusterRuntime>>,
    metrics_reader: Option<Arc<dyn MetricsReader>>,
    clock: Arc<dyn Clock>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            runtime: None,
            metrics_reader: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ClusterRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_metrics_reader(mut self, reader: Arc<dyn MetricsReader>) -> Self {
        self.metrics_reader = Some(reader);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let config = self.config;
        config.validate()?;

        let runtime = self
            .runtime
            .ok_or_else(|| Error::config("a cluster runtime client is required"))?;
        let metrics_reader = self
            .metrics_reader
            .ok_or_else(|| Error::config("a metrics reader is required"))?;
        let clock = self.clock;

        let metrics = ControllerMetrics::new()
            .map_err(|e| Error::internal(format!("failed to build metrics: {}", e)))?;

        let cloud: Arc<dyn CloudProvider> = match config.cluster.provider.as_str() {
            "aws" => Arc::new(AwsProvider::new(config.cluster.region.clone())),
            "gcp" => Arc::new(GcpProvider::new(config.cluster.region.clone())),
            "azure" => Arc::new(AzureProvider::new(config.cluster.region.clone())),
            other => return Err(Error::config(format!("unknown cloud provider: {}", other))),
        };

        let store = if config.cost.store_enabled {
            Some(Arc::new(MemoryStore::with_retention_days(
                config.cost.store_retention_days,
            )))
        } else {
            None
        };
        let store_dyn: Option<Arc<dyn CostStore>> =
            store.clone().map(|s| s as Arc<dyn CostStore>);

        let pricing = Arc::new(PricingClient::new(
            cloud.clone(),
            clock.clone(),
            config.cluster.region.clone(),
        ));

        let tracker = Arc::new(CostTracker::new(
            runtime.clone(),
            pricing,
            store_dyn.clone(),
            metrics.clone(),
            clock.clone(),
        ));

        let alerter = Arc::new(Alerter::new(Arc::new(EnvSecretStore)));
        let budget = Arc::new(BudgetController::new(
            runtime.clone(),
            tracker.clone(),
            store_dyn.clone(),
            alerter,
            metrics.clone(),
            clock.clone(),
        ));

        let attribution = Arc::new(AttributionController::new(
            runtime.clone(),
            tracker.clone(),
            store_dyn,
            clock.clone(),
        ));

        let predictive = if config.cost.predictive_enabled {
            Some(Arc::new(PredictiveScaler::new(clock.clone())))
        } else {
            None
        };

        let engine = Arc::new(DecisionEngine::new(
            runtime.clone(),
            metrics_reader.clone(),
            cloud.clone(),
            metrics.clone(),
            clock.clone(),
            predictive,
        ));

        let orchestrator = Arc::new(SpotOrchestrator::new(
            runtime.clone(),
            cloud,
            metrics.clone(),
            clock.clone(),
        ));

        let node_config = Arc::new(NodeConfigReconciler::new(runtime.clone(), clock.clone()));

        let rewriter = Arc::new(WorkloadRewriter::new(
            RewriterConfig {
                enable_mig: config.sharing.enable_mig,
                enable_mps: config.sharing.enable_mps,
                enable_timeslicing: config.sharing.enable_timeslicing,
                ..Default::default()
            },
            metrics.clone(),
            clock.clone(),
        ));

        let metrics_endpoint = if config.servers.metrics_enabled {
            Some(MetricsEndpoint::new(
                metrics.clone(),
                config.servers.metrics_bind_addr,
            ))
        } else {
            None
        };

        let admission_server = if config.servers.admission_enabled {
            Some(AdmissionServer::new(
                rewriter,
                runtime.clone(),
                metrics.clone(),
                config.servers.admission_bind_addr,
            ))
        } else {
            None
        };

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Agent {
            config,
            metrics,
            metrics_reader,
            clock,
            engine,
            orchestrator,
            tracker,
            budget,
            attribution,
            node_config,
            store,
            metrics_endpoint,
            admission_server,
            services: Vec::new(),
            shutdown_tx,
        })
    }
}
