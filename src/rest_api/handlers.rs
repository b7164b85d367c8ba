//! HTTP handlers for the operator endpoints

use axum::{http::StatusCode, Json};
use serde::Serialize;
use tracing::{error, instrument};

use crate::controller::metrics;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Metrics endpoint handler
pub async fn metrics() -> Result<String, StatusCode> {
    metrics::encode_registry().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_version() {
        let Json(body) = health().await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_metrics_exposes_registry() {
        metrics::observe_reconcile_duration_seconds(metrics::KYMA_CONTROLLER, 0.5);
        let body = metrics().await.unwrap();
        assert!(body.contains("# HELP kyma_reconcile_duration_seconds"));
    }
}
