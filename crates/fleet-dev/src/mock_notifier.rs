//! Alert capture for tests

use async_trait::async_trait;
use fleet_core::policy::AlertChannelSpec;
use fleet_core::Result;
use fleet_cost::{AlertDispatch, AlertMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// One captured alert dispatch
#[derive(Debug, Clone)]
pub struct CapturedAlert {
    pub channel: AlertChannelSpec,
    pub message: AlertMessage,
}

/// AlertDispatch implementation that records instead of sending
#[derive(Debug, Clone, Default)]
pub struct CapturingAlerter {
    sent: Arc<RwLock<Vec<CapturedAlert>>>,
}

impl CapturingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<CapturedAlert> {
        self.sent.read().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }
}

#[async_trait]
impl AlertDispatch for CapturingAlerter {
    async fn send_alert(
        &self,
        channel: &AlertChannelSpec,
        message: &AlertMessage,
        _deadline: Duration,
    ) -> Result<()> {
        self.sent.write().await.push(CapturedAlert {
            channel: channel.clone(),
            message: message.clone(),
        });
        Ok(())
    }
}
