//! Health check handlers

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: CheckResult,
    pub cache: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn up(latency_ms: u64) -> Self {
        Self {
            status: "up".to_string(),
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    fn down(error: String) -> Self {
        Self {
            status: "down".to_string(),
            latency_ms: None,
            error: Some(error),
        }
    }

    /// Backend not configured; it cannot make the service unready
    fn skipped() -> Self {
        Self {
            status: "skipped".to_string(),
            latency_ms: None,
            error: None,
        }
    }
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Readiness probe - checks the configured backing services
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let database = match &state.db {
        Some(db) => {
            let start = std::time::Instant::now();
            match db.ping().await {
                Ok(_) => CheckResult::up(start.elapsed().as_millis() as u64),
                Err(e) => CheckResult::down(e.to_string()),
            }
        }
        None => CheckResult::skipped(),
    };

    let cache = match &state.cache {
        Some(cache) => {
            let start = std::time::Instant::now();
            match cache.ping().await {
                Ok(_) => CheckResult::up(start.elapsed().as_millis() as u64),
                Err(e) => CheckResult::down(e.to_string()),
            }
        }
        None => CheckResult::skipped(),
    };

    let all_healthy = database.status != "down" && cache.status != "down";

    Json(ReadyResponse {
        status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
        checks: HealthChecks { database, cache },
    })
}
