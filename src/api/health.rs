/// Health check endpoints for liveness and readiness checks
///
/// Provides detailed health status including:
/// - Mapping store connectivity
/// - Resolution cache occupancy
/// - Directory version tracking and pending reconciliation
/// - Background job freshness
///
/// Health endpoints are unauthenticated and served on both listeners.

use crate::{context::AppContext, jobs::JobStatus, metrics, store::StoreBackend};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall status: "healthy", "degraded", or "unhealthy"
    pub status: String,

    pub version: String,

    pub uptime_seconds: f64,

    /// Individual component checks
    pub checks: Vec<ComponentHealth>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health status of individual component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,

    /// Status: "healthy", "degraded", or "unhealthy"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_basic))
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
        .route("/health/detailed", get(health_detailed))
        .route("/metrics", get(metrics_endpoint))
}

/// Basic health check
pub async fn health_basic() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Liveness check
///
/// Succeeds whenever the process can answer at all.
pub async fn liveness_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness check
///
/// Returns 503 while the mapping store is unreachable.
pub async fn readiness_check(
    State(ctx): State<AppContext>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if let Err(e) = ctx.engine.ping().await {
        tracing::warn!(error = %e, "readiness_check_failed: store check failed");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(serde_json::json!({
        "status": "ready",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

/// Detailed health check with all component statuses
pub async fn health_detailed(
    State(ctx): State<AppContext>,
) -> (StatusCode, Json<HealthStatus>) {
    let start = Instant::now();

    let checks = vec![
        check_store_detailed(&ctx).await,
        check_cache_detailed(&ctx),
        check_directory_detailed(&ctx),
        check_background_jobs_detailed(&ctx),
    ];

    let overall_status = determine_overall_status(&checks);

    let health = HealthStatus {
        status: overall_status.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: ctx.uptime_seconds(),
        checks,
        message: if overall_status == "healthy" {
            None
        } else {
            Some("One or more components are unhealthy".to_string())
        },
    };

    let status_code = match overall_status.as_str() {
        "healthy" | "degraded" => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };

    tracing::debug!(
        status = %overall_status,
        duration_ms = start.elapsed().as_millis() as u64,
        "health_check_completed"
    );

    (status_code, Json(health))
}

/// Prometheus exposition
pub async fn metrics_endpoint(State(ctx): State<AppContext>) -> Response {
    metrics::UPTIME_SECONDS.set(ctx.uptime_seconds());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
        .into_response()
}

async fn check_store_detailed(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    let result = ctx.engine.ping().await;
    let elapsed = start.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            let details = match ctx.engine.store() {
                StoreBackend::Sqlite(store) => serde_json::json!({
                    "type": "sqlite",
                    "pool_size": store.pool().size(),
                }),
                StoreBackend::Memory(_) => serde_json::json!({ "type": "memory" }),
            };
            ComponentHealth {
                name: "store".to_string(),
                status: "healthy".to_string(),
                response_time_ms: Some(elapsed),
                error: None,
                details: Some(details),
            }
        }
        Err(e) => ComponentHealth {
            name: "store".to_string(),
            status: "unhealthy".to_string(),
            response_time_ms: Some(elapsed),
            error: Some(e.to_string()),
            details: None,
        },
    }
}

fn check_cache_detailed(ctx: &AppContext) -> ComponentHealth {
    let stats = ctx.engine.cache_stats();

    ComponentHealth {
        name: "cache".to_string(),
        status: "healthy".to_string(),
        response_time_ms: None,
        error: None,
        details: serde_json::to_value(&stats).ok(),
    }
}

/// Keys awaiting reconciliation may be served stale until the next pass
fn check_directory_detailed(ctx: &AppContext) -> ComponentHealth {
    let pending = ctx.engine.pending_reconciliation();

    ComponentHealth {
        name: "directory".to_string(),
        status: if pending > 0 { "degraded" } else { "healthy" }.to_string(),
        response_time_ms: None,
        error: (pending > 0).then(|| format!("{} keys awaiting reconciliation", pending)),
        details: Some(serde_json::json!({
            "observed_version": ctx.engine.observed_version(),
            "pending_reconciliation": pending,
        })),
    }
}

fn check_background_jobs_detailed(ctx: &AppContext) -> ComponentHealth {
    jobs_health(ctx.jobs.status())
}

/// Overdue or failing jobs are degraded, not critical
fn jobs_health(jobs: Vec<JobStatus>) -> ComponentHealth {
    let overdue: Vec<&str> = jobs.iter().filter(|j| j.overdue).map(|j| j.name).collect();
    let failing: Vec<&str> = jobs
        .iter()
        .filter(|j| j.last_succeeded == Some(false))
        .map(|j| j.name)
        .collect();

    let error = match (overdue.is_empty(), failing.is_empty()) {
        (true, true) => None,
        (false, _) => Some(format!("Jobs overdue: {}", overdue.join(", "))),
        (true, false) => Some(format!("Last run failed: {}", failing.join(", "))),
    };

    ComponentHealth {
        name: "background_jobs".to_string(),
        status: if error.is_some() { "degraded" } else { "healthy" }.to_string(),
        response_time_ms: None,
        error,
        details: Some(serde_json::json!({ "jobs": jobs })),
    }
}

/// Determine overall health status from individual checks
fn determine_overall_status(checks: &[ComponentHealth]) -> String {
    let unhealthy_count = checks.iter().filter(|c| c.status == "unhealthy").count();
    let degraded_count = checks.iter().filter(|c| c.status == "degraded").count();

    if unhealthy_count > 0 {
        "unhealthy".to_string()
    } else if degraded_count > 0 {
        "degraded".to_string()
    } else {
        "healthy".to_string()
    }
}
