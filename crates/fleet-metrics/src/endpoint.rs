//! HTTP endpoint serving `/metrics` and `/health`

use crate::{ControllerMetrics, MetricsError, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Prometheus scrape endpoint for the controller
#[derive(Debug)]
pub struct MetricsEndpoint {
    metrics: ControllerMetrics,
    bind_addr: SocketAddr,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MetricsEndpoint {
    pub fn new(metrics: ControllerMetrics, bind_addr: SocketAddr) -> Self {
        Self {
            metrics,
            bind_addr,
            server_handle: None,
        }
    }

    /// Bind and start serving in a background task
    pub async fn start(&mut self) -> Result<()> {
        if self.server_handle.is_some() {
            return Err(MetricsError::Config("endpoint already started".to_string()));
        }

        let app = metrics_app(self.metrics.clone());
        let listener = TcpListener::bind(self.bind_addr).await?;

        info!("Serving metrics on {}", self.bind_addr);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Metrics server error: {}", e);
            }
        });

        self.server_handle = Some(handle);
        Ok(())
    }

    /// Stop the endpoint
    pub async fn stop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.server_handle.is_some()
    }

    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.bind_addr)
    }
}

impl Drop for MetricsEndpoint {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

fn metrics_app(metrics: ControllerMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<ControllerMetrics>) -> Response {
    match metrics.export() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_lifecycle() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.pending_pods.set(3.0);

        let mut endpoint = MetricsEndpoint::new(metrics, "127.0.0.1:0".parse().unwrap());
        assert!(!endpoint.is_running());

        endpoint.start().await.unwrap();
        assert!(endpoint.is_running());
        assert!(endpoint.start().await.is_err());

        endpoint.stop().await;
        assert!(!endpoint.is_running());
    }
}
