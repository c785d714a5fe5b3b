//! Synchronous admission endpoint
//!
//! The cluster runtime calls `/mutate` for every workload submission. The
//! handler first consults the budget admission guard (written by block
//! enforcement), then runs the rewriter under an internal deadline well
//! below the admission timeout. Any failure, including a deadline miss,
//! admits the workload unchanged.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleet_core::policy::GpuSharingPolicy;
use fleet_core::{labels, ClusterRuntime, Workload};
use fleet_metrics::ControllerMetrics;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::rewriter::WorkloadRewriter;

/// Internal budget for one admission decision; well under the cluster
/// runtime's admission timeout so a slow path fails open instead of
/// hanging the API server
const ADMISSION_DEADLINE: Duration = Duration::from_millis(80);

/// One admission request from the cluster runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub workload: Workload,
}

/// The admission decision returned to the cluster runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    pub reason: String,
    /// The mutated workload, present only when a rewrite was applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload: Option<Workload>,
}

#[derive(Clone)]
struct AdmissionState {
    rewriter: Arc<WorkloadRewriter>,
    runtime: Arc<dyn ClusterRuntime>,
    metrics: ControllerMetrics,
}

/// The admission webhook server
pub struct AdmissionServer {
    state: AdmissionState,
    bind_addr: SocketAddr,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl AdmissionServer {
    pub fn new(
        rewriter: Arc<WorkloadRewriter>,
        runtime: Arc<dyn ClusterRuntime>,
        metrics: ControllerMetrics,
        bind_addr: SocketAddr,
    ) -> Self {
        Self {
            state: AdmissionState {
                rewriter,
                runtime,
                metrics,
            },
            bind_addr,
            server_handle: None,
        }
    }

    /// Bind and serve in a background task
    pub async fn start(&mut self) -> fleet_core::Result<()> {
        let app = admission_app(self.state.clone());
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(fleet_core::Error::Io)?;

        info!("Serving admission webhook on {}", self.bind_addr);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Admission server error: {}", e);
            }
        });
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.server_handle.is_some()
    }
}

impl Drop for AdmissionServer {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

fn admission_app(state: AdmissionState) -> Router {
    Router::new()
        .route("/mutate", post(mutate_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn mutate_handler(
    State(state): State<AdmissionState>,
    Json(request): Json<AdmissionRequest>,
) -> Json<AdmissionResponse> {
    Json(admit(&state, request).await)
}

/// Decide one admission: guard check, then deadline-bounded rewrite,
/// failing open on every internal error
async fn admit(state: &AdmissionState, request: AdmissionRequest) -> AdmissionResponse {
    let uid = request.uid.clone();
    let workload = request.workload;

    // Budget block enforcement: the guard is the only rejection path
    if labels::is_gpu_workload(&workload) {
        match state.runtime.admission_guard().await {
            Ok(guard) => {
                if let Some(budget) = guard.blocking_budget(&workload) {
                    info!(
                        workload = %workload.workload_ref(),
                        budget,
                        "rejecting GPU workload blocked by budget"
                    );
                    state.metrics.record_admission("blocked", "denied");
                    return AdmissionResponse {
                        uid,
                        allowed: false,
                        reason: format!("GPU workloads are blocked by budget '{}'", budget),
                        workload: None,
                    };
                }
            }
            Err(e) => {
                // Guard read failure fails open
                warn!(error = %e, "admission guard unavailable, admitting");
            }
        }
    }

    let policies = match state.runtime.sharing_policies().await {
        Ok(policies) => policies,
        Err(e) => {
            warn!(error = %e, "sharing policies unavailable, using heuristics only");
            Vec::new()
        }
    };

    let rewriter = state.rewriter.clone();
    let candidate = workload.clone();
    let rewrite = tokio::time::timeout(
        ADMISSION_DEADLINE,
        run_rewrite(rewriter, candidate, policies),
    )
    .await;

    match rewrite {
        Ok(outcome) if outcome.changed => AdmissionResponse {
            uid,
            allowed: true,
            reason: outcome.reason,
            workload: Some(outcome.workload),
        },
        Ok(outcome) => AdmissionResponse {
            uid,
            allowed: true,
            reason: outcome.reason,
            workload: None,
        },
        Err(_) => {
            warn!(
                workload = %workload.workload_ref(),
                "admission rewrite exceeded deadline, admitting unchanged"
            );
            state.metrics.record_admission("unknown", "deadline");
            AdmissionResponse {
                uid,
                allowed: true,
                reason: "rewrite deadline exceeded".to_string(),
                workload: None,
            }
        }
    }
}

async fn run_rewrite(
    rewriter: Arc<WorkloadRewriter>,
    workload: Workload,
    policies: Vec<GpuSharingPolicy>,
) -> crate::rewriter::RewriteOutcome {
    // The rewrite itself is pure CPU; yielding once keeps the handler
    // cancellable at the timeout boundary
    tokio::task::yield_now().await;
    rewriter.rewrite(&workload, &policies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewriter::RewriterConfig;
    use fleet_core::policy::{AdmissionGuardConfig, BlockedScope, BudgetScope};
    use fleet_core::types::Container;
    use fleet_core::SystemClock;
    use fleet_dev::MockClusterRuntime;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn state(runtime: Arc<MockClusterRuntime>) -> AdmissionState {
        let metrics = ControllerMetrics::new().unwrap();
        AdmissionState {
            rewriter: Arc::new(WorkloadRewriter::new(
                RewriterConfig::default(),
                metrics.clone(),
                Arc::new(SystemClock),
            )),
            runtime,
            metrics,
        }
    }

    fn gpu_workload(ns: &str) -> Workload {
        Workload {
            name: "w".into(),
            namespace: ns.into(),
            containers: vec![Container {
                name: "main".into(),
                requests: [
                    (labels::RESOURCE_WHOLE_GPU.to_string(), 1),
                    (labels::RESOURCE_MEMORY.to_string(), 8 * GIB),
                ]
                .into(),
                limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), 1)].into(),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_admission_rewrites_gpu_workload() {
        let runtime = Arc::new(MockClusterRuntime::new());
        let response = admit(
            &state(runtime),
            AdmissionRequest {
                uid: "req-1".into(),
                workload: gpu_workload("ml"),
            },
        )
        .await;

        assert!(response.allowed);
        let mutated = response.workload.expect("expected a mutation");
        assert!(mutated.annotation(labels::ANNOTATION_OPTIMIZED).is_some());
    }

    #[tokio::test]
    async fn test_blocked_scope_denies_gpu_workloads() {
        let runtime = Arc::new(MockClusterRuntime::new());
        runtime
            .set_admission_guard(&AdmissionGuardConfig {
                blocked_scopes: vec![BlockedScope {
                    budget: "ml-monthly".into(),
                    scope: BudgetScope {
                        namespaces: vec!["ml".into()],
                        ..Default::default()
                    },
                }],
            })
            .await
            .unwrap();

        let response = admit(
            &state(runtime.clone()),
            AdmissionRequest {
                uid: "req-2".into(),
                workload: gpu_workload("ml"),
            },
        )
        .await;
        assert!(!response.allowed);
        assert!(response.reason.contains("ml-monthly"));

        // Outside the blocked scope, admission proceeds
        let response = admit(
            &state(runtime),
            AdmissionRequest {
                uid: "req-3".into(),
                workload: gpu_workload("web"),
            },
        )
        .await;
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn test_non_gpu_workload_skips_guard() {
        let runtime = Arc::new(MockClusterRuntime::new());
        runtime
            .set_admission_guard(&AdmissionGuardConfig {
                blocked_scopes: vec![BlockedScope {
                    budget: "everything".into(),
                    scope: BudgetScope::default(),
                }],
            })
            .await
            .unwrap();

        let workload = Workload {
            name: "web".into(),
            namespace: "frontend".into(),
            containers: vec![Container::default()],
            ..Default::default()
        };
        let response = admit(
            &state(runtime),
            AdmissionRequest {
                uid: "req-4".into(),
                workload,
            },
        )
        .await;
        assert!(response.allowed);
        assert!(response.workload.is_none());
    }
}
