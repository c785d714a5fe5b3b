//! GPU waste analysis
//!
//! Scores each GPU workload's waste from averaged utilization samples and
//! recommends a sharing strategy. Surfaced through logs and events; the
//! rewriter stays the only mutation path.

use fleet_core::{MetricsReader, Result, WorkloadRef};
use std::sync::Arc;
use tracing::debug;

/// Waste analysis for one workload's GPU allocation
#[derive(Debug, Clone, PartialEq)]
pub struct WasteReport {
    pub workload: WorkloadRef,
    pub node: String,
    pub gpu_index: u32,
    /// Mean GPU utilization over the lookback, 0-1
    pub avg_utilization: f64,
    /// Mean memory utilization over the lookback, 0-1
    pub avg_memory_utilization: f64,
    /// 0-100, higher means more waste
    pub waste_score: f64,
    pub recommendation: String,
}

/// Score waste for every sampled GPU over the lookback window
pub async fn analyze(
    reader: &Arc<dyn MetricsReader>,
    lookback_minutes: u32,
) -> Result<Vec<WasteReport>> {
    let samples = reader.averaged_samples(lookback_minutes).await?;

    let mut reports = Vec::new();
    for sample in samples {
        let Some(workload) = sample.workload else {
            continue;
        };

        let report = WasteReport {
            workload,
            node: sample.node,
            gpu_index: sample.gpu_index,
            avg_utilization: sample.utilization,
            avg_memory_utilization: sample.memory_utilization,
            waste_score: waste_score(sample.utilization, sample.memory_utilization),
            recommendation: recommendation(sample.utilization, sample.memory_utilization),
        };
        debug!(
            workload = %report.workload,
            score = report.waste_score,
            "scored GPU waste"
        );
        reports.push(report);
    }
    Ok(reports)
}

/// Waste score from 0 (fully used) to 100 (idle). GPU utilization is
/// weighted above memory utilization.
pub fn waste_score(gpu_utilization: f64, memory_utilization: f64) -> f64 {
    let gpu_waste = (1.0 - gpu_utilization.clamp(0.0, 1.0)) * 100.0;
    let memory_waste = (1.0 - memory_utilization.clamp(0.0, 1.0)) * 100.0;
    gpu_waste * 0.6 + memory_waste * 0.4
}

/// Sharing recommendation by utilization band
pub fn recommendation(gpu_utilization: f64, memory_utilization: f64) -> String {
    let gpu = gpu_utilization * 100.0;
    let memory = memory_utilization * 100.0;

    if gpu < 30.0 && memory < 30.0 {
        "Consider sharing this GPU via partitioning or multiplexing - very low utilization"
    } else if gpu < 50.0 && memory < 40.0 {
        "This workload could share a GPU via hardware partitioning"
    } else if gpu < 50.0 {
        "Consider process multiplexing for this workload"
    } else if memory < 40.0 {
        "Memory-light workload - consider time-slicing"
    } else {
        "Utilization is acceptable - no optimization needed"
    }
    .to_string()
}

/// A workload wastes significantly when its score crosses this line
pub const SIGNIFICANT_WASTE_SCORE: f64 = 50.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waste_score_bounds() {
        assert_eq!(waste_score(0.0, 0.0), 100.0);
        assert_eq!(waste_score(1.0, 1.0), 0.0);
        // GPU idle, memory full: weighted toward the GPU side
        assert!((waste_score(0.0, 1.0) - 60.0).abs() < 1e-9);
        // Out-of-range inputs are clamped
        assert_eq!(waste_score(2.0, -1.0), 40.0);
    }

    #[test]
    fn test_recommendation_bands() {
        assert!(recommendation(0.1, 0.1).contains("very low utilization"));
        assert!(recommendation(0.4, 0.3).contains("hardware partitioning"));
        assert!(recommendation(0.4, 0.6).contains("multiplexing"));
        assert!(recommendation(0.7, 0.2).contains("time-slicing"));
        assert!(recommendation(0.8, 0.8).contains("no optimization"));
    }
}
