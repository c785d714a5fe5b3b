//! Node draining for scale-down
//!
//! Cordon the node, delete its workloads with a thirty-second grace, and
//! poll until the node is empty or the drain deadline passes. A timed-out
//! drain fails this victim only; the caller moves on to the next.

use fleet_core::{ClusterRuntime, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Grace period granted to workloads evicted during scale-down
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// How often the drain re-checks the node's workload set
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long a drain may run before the victim is abandoned
const DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

/// Drain one node: cordon, evict everything, wait until empty
pub async fn drain_node(runtime: &Arc<dyn ClusterRuntime>, node_name: &str) -> Result<()> {
    drain_node_with(runtime, node_name, DRAIN_POLL_INTERVAL, DRAIN_TIMEOUT).await
}

/// Drain with explicit pacing, used by tests
pub async fn drain_node_with(
    runtime: &Arc<dyn ClusterRuntime>,
    node_name: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    info!(node = node_name, "draining node");

    runtime.cordon_node(node_name).await?;

    let workloads = runtime.list_workloads_on_node(node_name).await?;
    for workload in &workloads {
        if let Err(e) = runtime
            .evict_workload(&workload.workload_ref(), DRAIN_GRACE)
            .await
        {
            warn!(workload = %workload.workload_ref(), error = %e, "failed to evict workload");
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = runtime.list_workloads_on_node(node_name).await?;
        if remaining.is_empty() {
            info!(node = node_name, "node drained");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::timeout(format!(
                "drain of {} timed out with {} workloads remaining",
                node_name,
                remaining.len()
            )));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_dev::MockClusterRuntime;

    #[tokio::test]
    async fn test_drain_cordons_and_evicts() {
        let mock = Arc::new(MockClusterRuntime::new());
        mock.put_gpu_node("gpu-1", "spot", 8).await;
        mock.put_running_gpu_workload("ml", "w1", "gpu-1", 1).await;
        mock.put_running_gpu_workload("ml", "w2", "gpu-1", 1).await;

        let runtime: Arc<dyn ClusterRuntime> = mock.clone();
        drain_node_with(
            &runtime,
            "gpu-1",
            Duration::from_millis(5),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert!(mock.get_node("gpu-1").await.unwrap().unschedulable);
        let evictions = mock.evictions().await;
        assert_eq!(evictions.len(), 2);
        assert!(evictions.iter().all(|e| e.grace == DRAIN_GRACE));
    }

    #[tokio::test]
    async fn test_drain_of_empty_node_completes_immediately() {
        let mock = Arc::new(MockClusterRuntime::new());
        mock.put_gpu_node("gpu-1", "spot", 8).await;

        let runtime: Arc<dyn ClusterRuntime> = mock.clone();
        drain_node(&runtime, "gpu-1").await.unwrap();
    }
}
