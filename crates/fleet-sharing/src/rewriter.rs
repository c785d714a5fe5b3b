//! Admission-time workload rewriter
//!
//! Classifies every incoming GPU workload and, when sharing is
//! beneficial, mutates its resource-request shape in place. The rewrite
//! is idempotent (guarded by the `optimized` annotation), fails open on
//! any internal error, and performs no I/O so it fits the admission
//! latency budget.

use chrono::SecondsFormat;
use fleet_core::policy::{GpuSharingPolicy, MpsPolicyConfig, SharingStrategy};
use fleet_core::{labels, Clock, SharingMode, Workload, WorkloadClass};
use fleet_metrics::ControllerMetrics;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{mig, mps, timeslicing};

/// Feature toggles and tuning for the rewriter
#[derive(Debug, Clone)]
pub struct RewriterConfig {
    pub enable_mig: bool,
    pub enable_mps: bool,
    pub enable_timeslicing: bool,

    /// Assumed mean utilization for replica selection at admission,
    /// before any live samples exist for the workload
    pub assumed_utilization: f64,
    /// Assumed burstiness for replica selection at admission
    pub assumed_burstiness: f64,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            enable_mig: true,
            enable_mps: true,
            enable_timeslicing: true,
            assumed_utilization: 0.3,
            assumed_burstiness: 0.6,
        }
    }
}

/// The result of one admission rewrite
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub workload: Workload,
    pub strategy: SharingMode,
    pub changed: bool,
    pub reason: String,
}

/// Admission-time classifier and mutator
pub struct WorkloadRewriter {
    config: RewriterConfig,
    metrics: ControllerMetrics,
    clock: Arc<dyn Clock>,
}

impl WorkloadRewriter {
    pub fn new(config: RewriterConfig, metrics: ControllerMetrics, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            metrics,
            clock,
        }
    }

    /// Classify and rewrite one workload. Never fails: every error path
    /// admits the workload unchanged and counts the outcome.
    pub fn rewrite(&self, workload: &Workload, policies: &[GpuSharingPolicy]) -> RewriteOutcome {
        if !labels::is_gpu_workload(workload) {
            return self.unchanged(workload, SharingMode::Exclusive, "no GPU requests");
        }

        // Replays observe the guard annotation and pass through
        if workload.annotation(labels::ANNOTATION_OPTIMIZED).is_some() {
            return self.unchanged(workload, SharingMode::Exclusive, "already optimized");
        }

        if workload.annotation(labels::ANNOTATION_OPTIMIZE) == Some("false") {
            return self.unchanged(workload, SharingMode::Exclusive, "optimization disabled");
        }

        let (strategy, matched_policy) = self.select_strategy(workload, policies);
        debug!(
            workload = %workload.workload_ref(),
            strategy = %strategy,
            "selected sharing strategy"
        );

        match strategy {
            SharingMode::Exclusive => {
                self.unchanged(workload, SharingMode::Exclusive, "exclusive GPU access")
            }
            SharingMode::Mig => self.apply_mig(workload, matched_policy),
            SharingMode::Mps => self.apply_mps(workload, matched_policy),
            SharingMode::Timeslicing => self.apply_timeslicing(workload, matched_policy),
        }
    }

    /// Strategy selection, in order: explicit annotation, declared
    /// sharing policies by priority, workload-class heuristics, explicit
    /// opt-in, exclusive.
    fn select_strategy<'a>(
        &self,
        workload: &Workload,
        policies: &'a [GpuSharingPolicy],
    ) -> (SharingMode, Option<&'a GpuSharingPolicy>) {
        if let Some(mode) = workload
            .annotation(labels::ANNOTATION_SHARING_MODE)
            .and_then(|v| v.parse::<SharingMode>().ok())
        {
            return (self.gate(mode), None);
        }

        let mut matching: Vec<&GpuSharingPolicy> = policies
            .iter()
            .filter(|p| p.spec.matches(workload))
            .collect();
        matching.sort_by_key(|p| std::cmp::Reverse(p.spec.priority));
        for policy in matching {
            match policy.spec.strategy {
                SharingStrategy::Auto => continue,
                declared => {
                    if let Some(mode) = declared.as_mode() {
                        return (self.gate(mode), Some(policy));
                    }
                }
            }
        }

        let gpu_request = labels::whole_gpu_request(workload);
        let memory_request = labels::total_memory_request(workload);
        let class = workload.workload_class();

        if class == WorkloadClass::Training {
            return (SharingMode::Exclusive, None);
        }

        if self.config.enable_mig
            && gpu_request == 1
            && memory_request < 20 * 1024 * 1024 * 1024
        {
            return (SharingMode::Mig, None);
        }

        if self.config.enable_mps
            && matches!(class, WorkloadClass::Inference | WorkloadClass::Serving)
        {
            return (SharingMode::Mps, None);
        }

        if self.config.enable_timeslicing
            && matches!(class, WorkloadClass::Development | WorkloadClass::Batch)
        {
            return (SharingMode::Timeslicing, None);
        }

        if workload.annotation(labels::ANNOTATION_SHARING) == Some("enabled") {
            if self.config.enable_mps {
                return (SharingMode::Mps, None);
            }
            if self.config.enable_timeslicing {
                return (SharingMode::Timeslicing, None);
            }
        }

        (SharingMode::Exclusive, None)
    }

    /// Downgrade a requested mode to exclusive when its feature toggle
    /// is off
    fn gate(&self, mode: SharingMode) -> SharingMode {
        let enabled = match mode {
            SharingMode::Mig => self.config.enable_mig,
            SharingMode::Mps => self.config.enable_mps,
            SharingMode::Timeslicing => self.config.enable_timeslicing,
            SharingMode::Exclusive => true,
        };
        if enabled {
            mode
        } else {
            SharingMode::Exclusive
        }
    }

    fn apply_mig(
        &self,
        workload: &Workload,
        policy: Option<&GpuSharingPolicy>,
    ) -> RewriteOutcome {
        let gpu_request = labels::whole_gpu_request(workload);
        let memory_request = labels::total_memory_request(workload);

        let explicit = policy
            .and_then(|p| p.spec.mig.as_ref())
            .filter(|c| !c.auto_select_profile && !c.profile.is_empty())
            .and_then(|c| mig::MigProfile::by_name(&c.profile));

        let profile = match explicit {
            Some(profile) => profile,
            None => match mig::select_profile(gpu_request, memory_request) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(
                        workload = %workload.workload_ref(),
                        error = %e,
                        "no partition profile fits, admitting unchanged"
                    );
                    return self.unchanged(workload, SharingMode::Mig, "no suitable profile");
                }
            },
        };

        let mut mutated = workload.clone();
        mig::convert_workload(&mut mutated, profile);
        self.finish(mutated, SharingMode::Mig)
    }

    fn apply_mps(&self, workload: &Workload, policy: Option<&GpuSharingPolicy>) -> RewriteOutcome {
        let config = policy
            .and_then(|p| p.spec.mps.clone())
            .unwrap_or_else(MpsPolicyConfig::default);

        let mut mutated = workload.clone();
        mps::convert_workload(&mut mutated, &config);
        self.finish(mutated, SharingMode::Mps)
    }

    fn apply_timeslicing(
        &self,
        workload: &Workload,
        policy: Option<&GpuSharingPolicy>,
    ) -> RewriteOutcome {
        let replicas = policy
            .and_then(|p| p.spec.timeslicing.as_ref())
            .map(|c| c.replicas_per_gpu)
            .unwrap_or_else(|| {
                timeslicing::optimal_replicas(
                    self.config.assumed_utilization,
                    self.config.assumed_burstiness,
                )
            });

        let mut mutated = workload.clone();
        timeslicing::convert_workload(&mut mutated, replicas);
        self.finish(mutated, SharingMode::Timeslicing)
    }

    /// Stamp the mutation-guard annotations and record the outcome
    fn finish(&self, mut workload: Workload, strategy: SharingMode) -> RewriteOutcome {
        workload
            .annotations
            .insert(labels::ANNOTATION_OPTIMIZED.to_string(), "true".to_string());
        workload.annotations.insert(
            labels::ANNOTATION_OPTIMIZATION_STRATEGY.to_string(),
            strategy.to_string(),
        );
        workload.annotations.insert(
            labels::ANNOTATION_OPTIMIZATION_TIMESTAMP.to_string(),
            self.clock
                .now()
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );

        info!(
            workload = %workload.workload_ref(),
            strategy = %strategy,
            "workload optimized"
        );
        self.metrics.record_admission(strategy.as_str(), "optimized");

        RewriteOutcome {
            workload,
            strategy,
            changed: true,
            reason: format!("optimized with {}", strategy),
        }
    }

    fn unchanged(&self, workload: &Workload, strategy: SharingMode, reason: &str) -> RewriteOutcome {
        self.metrics.record_admission(strategy.as_str(), "unchanged");
        RewriteOutcome {
            workload: workload.clone(),
            strategy,
            changed: false,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::types::Container;
    use fleet_core::SystemClock;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn rewriter() -> WorkloadRewriter {
        WorkloadRewriter::new(
            RewriterConfig::default(),
            ControllerMetrics::new().unwrap(),
            Arc::new(SystemClock),
        )
    }

    fn gpu_workload(gpus: i64, memory: i64) -> Workload {
        Workload {
            name: "w".into(),
            namespace: "ml".into(),
            containers: vec![Container {
                name: "main".into(),
                requests: [
                    (labels::RESOURCE_WHOLE_GPU.to_string(), gpus),
                    (labels::RESOURCE_MEMORY.to_string(), memory),
                ]
                .into(),
                limits: [(labels::RESOURCE_WHOLE_GPU.to_string(), gpus)].into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_non_gpu_workload_passes_through() {
        let workload = Workload {
            name: "web".into(),
            namespace: "frontend".into(),
            containers: vec![Container::default()],
            ..Default::default()
        };
        let outcome = rewriter().rewrite(&workload, &[]);
        assert!(!outcome.changed);
        assert_eq!(outcome.workload, workload);
    }

    #[test]
    fn test_opt_out_is_respected() {
        let mut workload = gpu_workload(1, 8 * GIB);
        workload
            .annotations
            .insert(labels::ANNOTATION_OPTIMIZE.into(), "false".into());
        let outcome = rewriter().rewrite(&workload, &[]);
        assert!(!outcome.changed);
    }

    #[test]
    fn test_training_stays_exclusive() {
        let mut workload = gpu_workload(1, 8 * GIB);
        workload
            .labels
            .insert(labels::LABEL_WORKLOAD_TYPE.into(), "training".into());
        let outcome = rewriter().rewrite(&workload, &[]);
        assert!(!outcome.changed);
        assert_eq!(outcome.strategy, SharingMode::Exclusive);
    }

    #[test]
    fn test_small_workload_gets_partition() {
        let outcome = rewriter().rewrite(&gpu_workload(1, 8 * GIB), &[]);
        assert!(outcome.changed);
        assert_eq!(outcome.strategy, SharingMode::Mig);

        let container = &outcome.workload.containers[0];
        assert!(!container.requests.contains_key(labels::RESOURCE_WHOLE_GPU));
        assert_eq!(container.requests.get("nvidia.com/mig-2g.10gb"), Some(&1));
        assert_eq!(
            outcome.workload.annotation(labels::ANNOTATION_ORIGINAL_GPU_REQUEST),
            Some("1")
        );
        assert_eq!(
            outcome
                .workload
                .annotation(labels::ANNOTATION_OPTIMIZATION_STRATEGY),
            Some("mig")
        );
    }

    #[test]
    fn test_inference_gets_mps() {
        let mut workload = gpu_workload(2, 32 * GIB);
        workload
            .labels
            .insert(labels::LABEL_WORKLOAD_TYPE.into(), "inference".into());
        let outcome = rewriter().rewrite(&workload, &[]);
        assert_eq!(outcome.strategy, SharingMode::Mps);
        assert!(outcome.changed);
    }

    #[test]
    fn test_development_gets_timeslicing() {
        let mut workload = gpu_workload(2, 32 * GIB);
        workload
            .labels
            .insert(labels::LABEL_WORKLOAD_TYPE.into(), "development".into());
        let outcome = rewriter().rewrite(&workload, &[]);
        assert_eq!(outcome.strategy, SharingMode::Timeslicing);
        // The admission default of (0.3 util, 0.6 burstiness) maps to
        // four replicas per device
        assert_eq!(
            outcome
                .workload
                .annotation(labels::ANNOTATION_TIMESLICE_REPLICAS),
            Some("4")
        );
    }

    #[test]
    fn test_opt_in_prefers_mps_then_timeslicing() {
        let mut workload = gpu_workload(2, 32 * GIB);
        workload
            .annotations
            .insert(labels::ANNOTATION_SHARING.into(), "enabled".into());
        let outcome = rewriter().rewrite(&workload, &[]);
        assert_eq!(outcome.strategy, SharingMode::Mps);

        let mps_disabled = WorkloadRewriter::new(
            RewriterConfig {
                enable_mps: false,
                ..Default::default()
            },
            ControllerMetrics::new().unwrap(),
            Arc::new(SystemClock),
        );
        let outcome = mps_disabled.rewrite(&workload, &[]);
        assert_eq!(outcome.strategy, SharingMode::Timeslicing);
    }

    #[test]
    fn test_explicit_annotation_wins() {
        let mut workload = gpu_workload(1, 8 * GIB);
        workload
            .annotations
            .insert(labels::ANNOTATION_SHARING_MODE.into(), "timeslicing".into());
        let outcome = rewriter().rewrite(&workload, &[]);
        assert_eq!(outcome.strategy, SharingMode::Timeslicing);
    }

    #[test]
    fn test_sharing_policy_overrides_heuristics() {
        let policy = GpuSharingPolicy {
            name: "force-mps".into(),
            spec: fleet_core::policy::GpuSharingPolicySpec {
                strategy: SharingStrategy::Mps,
                namespaces: vec!["ml".into()],
                priority: 10,
                ..Default::default()
            },
            status: Default::default(),
        };

        // Without the policy this workload would take the MIG path
        let outcome = rewriter().rewrite(&gpu_workload(1, 8 * GIB), &[policy]);
        assert_eq!(outcome.strategy, SharingMode::Mps);
    }

    #[test]
    fn test_oversized_partition_request_admits_unchanged() {
        let outcome = rewriter().rewrite(&gpu_workload(8, 100 * GIB), &[]);
        // 8 GPUs cannot fit any profile via the explicit annotation path
        let mut workload = gpu_workload(8, 100 * GIB);
        workload
            .annotations
            .insert(labels::ANNOTATION_SHARING_MODE.into(), "mig".into());
        let outcome_mig = rewriter().rewrite(&workload, &[]);
        assert!(!outcome_mig.changed);
        assert_eq!(outcome_mig.reason, "no suitable profile");

        // The heuristic path never selects MIG for an 8-GPU request
        assert_ne!(outcome.strategy, SharingMode::Mig);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let rewriter = rewriter();
        let first = rewriter.rewrite(&gpu_workload(1, 8 * GIB), &[]);
        assert!(first.changed);

        let second = rewriter.rewrite(&first.workload, &[]);
        assert!(!second.changed);
        assert_eq!(second.workload, first.workload);
        assert_eq!(second.reason, "already optimized");
    }

    #[test]
    fn test_exclusive_preserves_gpu_count() {
        let mut workload = gpu_workload(4, 64 * GIB);
        workload
            .labels
            .insert(labels::LABEL_WORKLOAD_TYPE.into(), "training".into());
        let outcome = rewriter().rewrite(&workload, &[]);
        assert_eq!(labels::whole_gpu_request(&outcome.workload), 4);
    }

    #[test]
    fn test_feature_gate_downgrades_explicit_mode() {
        let all_disabled = WorkloadRewriter::new(
            RewriterConfig {
                enable_mig: false,
                enable_mps: false,
                enable_timeslicing: false,
                ..Default::default()
            },
            ControllerMetrics::new().unwrap(),
            Arc::new(SystemClock),
        );

        let mut workload = gpu_workload(1, 8 * GIB);
        workload
            .annotations
            .insert(labels::ANNOTATION_SHARING_MODE.into(), "mig".into());
        let outcome = all_disabled.rewrite(&workload, &[]);
        assert_eq!(outcome.strategy, SharingMode::Exclusive);
        assert!(!outcome.changed);
    }
}
