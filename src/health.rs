use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::{sync::Arc, time::SystemTime};

use crate::hub::HubHandle;
use crate::persistence::Persistence;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    persistence: CheckStatus,
    connected_sessions: usize,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    persistence: bool,
}

/// Liveness probe: the process is running and able to respond.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe: the hub can reach its persistence collaborator.
pub async fn readiness(
    State(persistence): State<Arc<dyn Persistence>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let persistence_ready = persistence.ping().await.is_ok();
    let status = if persistence_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: persistence_ready,
            checks: ReadinessChecks {
                persistence: persistence_ready,
            },
        }),
    )
}

/// Detailed health: persistence reachability plus current hub connection count.
pub async fn health(
    State(persistence): State<Arc<dyn Persistence>>,
    State(hub): State<HubHandle>,
) -> (StatusCode, Json<HealthResponse>) {
    let persistence_status = if persistence.ping().await.is_ok() {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };

    let overall_healthy = persistence_status == CheckStatus::Healthy;
    let status = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    (
        status,
        Json(HealthResponse {
            status: if overall_healthy { "healthy" } else { "unhealthy" }.to_string(),
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                persistence: persistence_status,
                connected_sessions: hub.connected_sessions(),
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
