use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use carelink_core::chrono::Utc;
use carelink_db::{ping, DbPool, JobQueue};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    jobs: JobQueue,
}

impl HealthState {
    pub fn new(db_pool: DbPool, jobs: JobQueue) -> Self {
        Self { db_pool, jobs }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub pending: u64,
    pub failed: u64,
    pub oldest_pending_age_seconds: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueHealth>,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Readiness: the database must answer. Queue depth is reported but a
/// backlog never marks the service degraded.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match ping(&state.db_pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    };
    let ready = database.status == "ready";

    let queue = if ready {
        state.jobs.stats().await.ok().map(|stats| QueueHealth {
            pending: stats.pending_count,
            failed: stats.failed_count,
            oldest_pending_age_seconds: stats.oldest_pending_age_seconds,
        })
    } else {
        None
    };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "carelink-server runtime initialized".to_string(),
        },
        database,
        queue,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}
