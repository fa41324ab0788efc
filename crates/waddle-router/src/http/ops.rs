//! Operational endpoints: performance metrics and health.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::error;

use crate::app::AppState;
use crate::error::ApiError;

/// GET /router/metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let (total_commands, total_entities, total_executions) = state.registry.totals()?;
    let since = (Utc::now() - Duration::hours(1)).to_rfc3339();
    let (successful, failed, avg_time) = state.registry.execution_stats_since(&since)?;
    let recent_total = successful + failed;

    let cache = state.cache.stats();
    let limiter = state.limiter.stats();

    Ok(Json(json!({
        "processor": state.pipeline.metrics.snapshot(),
        "string_matcher": state.strings.stats()?,
        "cache": {
            "total_entries": cache.total_entries,
            "expired_entries": cache.expired_entries,
            "active_entries": cache.active_entries,
        },
        "rate_limiter": {
            "active_windows": limiter.active_windows,
            "tracked_requests": limiter.tracked_requests,
        },
        "sessions": state.sessions.stats()?,
        "database": {
            "total_commands": total_commands,
            "total_entities": total_entities,
            "total_executions": total_executions,
        },
        "workers": {
            "max_workers": state.config.router.max_workers,
            "event_module_workers": state.config.router.event_module_workers,
        },
        "recent_performance": {
            "successful_executions": successful,
            "failed_executions": failed,
            "avg_execution_time_ms": avg_time,
            "success_rate": if recent_total > 0 {
                successful as f64 / recent_total as f64 * 100.0
            } else {
                0.0
            },
        },
    })))
}

/// GET /router/health — liveness plus a database round-trip.
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.registry.totals() {
        Ok(_) => Ok(Json(json!({
            "status": "healthy",
            "database": "connected",
            "processor": {
                "success_rate": state.pipeline.metrics.success_rate(),
            },
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "timestamp": Utc::now().to_rfc3339(),
        }))),
        Err(e) => {
            error!(error = %e, "health check failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            ))
        }
    }
}
