use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::{sync::Arc, time::Duration, time::SystemTime};

use crate::coordinator::Gateway;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    database: CheckStatus,
    account_pool: PoolHealth,
    write_pipeline: WritePipelineHealth,
    online_clients_5m: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct PoolHealth {
    eligible_accounts: usize,
    status: CheckStatus,
}

#[derive(Debug, Serialize)]
pub struct WritePipelineHealth {
    dropped_logs: u64,
    dropped_writes: u64,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    database: bool,
}

/// Liveness probe - checks if the application is running
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe - database connectivity gates traffic.
pub async fn readiness(
    State(gateway): State<Arc<Gateway>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let db_ready = check_database(&gateway).await;
    let status = if db_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: db_ready,
            checks: ReadinessChecks { database: db_ready },
        }),
    )
}

/// Full health report: store connectivity, pool population, write-queue
/// drop counters, and the online-client figure.
pub async fn health(State(gateway): State<Arc<Gateway>>) -> (StatusCode, Json<HealthResponse>) {
    let db_healthy = check_database(&gateway).await;
    let pool_size = gateway.pool.len();
    let (dropped_logs, dropped_writes) = gateway.writeback.dropped_counts();

    let database = if db_healthy {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };
    let pool_status = if pool_size > 0 {
        CheckStatus::Healthy
    } else {
        CheckStatus::Degraded
    };

    let overall_ok = db_healthy;
    let response = HealthResponse {
        status: if overall_ok { "ok" } else { "unhealthy" }.to_string(),
        timestamp: SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database,
            account_pool: PoolHealth {
                eligible_accounts: pool_size,
                status: pool_status,
            },
            write_pipeline: WritePipelineHealth {
                dropped_logs,
                dropped_writes,
            },
            online_clients_5m: gateway.online.active_within(Duration::from_secs(300)),
        },
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn check_database(gateway: &Gateway) -> bool {
    sqlx::query("SELECT 1").execute(&gateway.db).await.is_ok()
}
