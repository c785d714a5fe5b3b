//! Programmable metrics read model for tests

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::{Error, GpuSample, MetricsReader, Result, WorkloadRef};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MetricsState {
    samples: Vec<GpuSample>,
    fail: bool,
}

/// Metrics reader whose samples are set by the test
#[derive(Debug, Clone, Default)]
pub struct MockMetricsReader {
    state: Arc<RwLock<MetricsState>>,
}

impl MockMetricsReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sample set
    pub async fn set_samples(&self, samples: Vec<GpuSample>) {
        self.state.write().await.samples = samples;
    }

    /// One sample per node at a uniform utilization
    pub async fn set_uniform_utilization(&self, nodes: &[&str], utilization: f64) {
        let samples = nodes
            .iter()
            .map(|node| sample(node, None, utilization))
            .collect();
        self.set_samples(samples).await;
    }

    /// Make reads fail, to exercise the fail-open utilization path
    pub async fn fail(&self, fail: bool) {
        self.state.write().await.fail = fail;
    }
}

/// Build one sample with the given utilization; memory utilization
/// follows at half the compute utilization
pub fn sample(node: &str, workload: Option<WorkloadRef>, utilization: f64) -> GpuSample {
    GpuSample {
        node: node.to_string(),
        workload,
        gpu_index: 0,
        utilization,
        memory_utilization: utilization / 2.0,
        memory_used_mb: utilization * 40_960.0,
        memory_total_mb: 40_960.0,
        power_watts: 150.0 + utilization * 250.0,
        temperature_c: 40.0 + utilization * 45.0,
        timestamp: Utc::now(),
    }
}

#[async_trait]
impl MetricsReader for MockMetricsReader {
    async fn gpu_samples(&self) -> Result<Vec<GpuSample>> {
        let state = self.state.read().await;
        if state.fail {
            return Err(Error::metrics("scripted metrics failure"));
        }
        Ok(state.samples.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_average_utilization() {
        let reader = MockMetricsReader::new();
        reader
            .set_uniform_utilization(&["n1", "n2"], 0.5)
            .await;
        assert!((reader.average_utilization().await.unwrap() - 0.5).abs() < 1e-9);

        reader
            .set_samples(vec![sample("n1", None, 0.2), sample("n2", None, 0.8)])
            .await;
        assert!((reader.average_utilization().await.unwrap() - 0.5).abs() < 1e-9);
        assert!((reader.node_utilization("n1").await.unwrap() - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let reader = MockMetricsReader::new();
        reader.fail(true).await;
        assert!(reader.gpu_samples().await.is_err());
    }
}
