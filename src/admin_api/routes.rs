use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::analytics::collector::MetricsCollector;
use crate::models::metrics::HealthStatus;
use crate::protection::pipeline::ProtectionPipeline;

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

/// Shared state handed to every admin route.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ProtectionPipeline>,
    pub metrics: Arc<MetricsCollector>,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct EventParams {
    pub limit: Option<usize>,
}

pub async fn get_stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.pipeline.stats();
    Json(json!({
        "stats": stats,
        "responseAction": state.pipeline.response_action().to_string(),
        "rulesVersion": state.pipeline.rules_version(),
        "rateLimit": state.pipeline.rate_limit(),
        "eventCapacity": state.pipeline.events().capacity(),
        "blockedIps": state.pipeline.reputation().blocked_count(),
        "topIps": state
            .metrics
            .top_ips(10)
            .into_iter()
            .map(|(ip, count)| json!({"ip": ip, "count": count}))
            .collect::<Vec<_>>(),
    }))
}

pub async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.pipeline.health_check();
    let status = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Error => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(json!({
            "status": report.status,
            "stats": report.stats,
            "error": report.error,
            "metrics": state.metrics.snapshot(),
        })),
    )
}

pub async fn get_events(State(state): State<AppState>, Query(params): Query<EventParams>) -> Json<Value> {
    let limit = params.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    let events = state.pipeline.events().recent(limit);
    Json(json!({
        "count": events.len(),
        "events": events.iter().map(|e| e.as_ref()).collect::<Vec<_>>(),
    }))
}

pub async fn get_event(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.pipeline.events().find(&id) {
        Some(event) => (StatusCode::OK, Json(json!(event.as_ref()))).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "event not found"}))).into_response(),
    }
}

pub async fn get_reputation(State(state): State<AppState>, Path(ip): Path<String>) -> impl IntoResponse {
    let reputation = state.pipeline.reputation();
    match reputation.persisted(&ip) {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({
                "ip": ip,
                "whitelisted": reputation.is_whitelisted(&ip),
                "blocked": reputation.is_blocked(&ip),
                "record": record,
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn unblock_ip(State(state): State<AppState>, Path(ip): Path<String>) -> impl IntoResponse {
    let reputation = state.pipeline.reputation();
    if !reputation.is_blocked(&ip) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "IP not in blocked set"})),
        )
            .into_response();
    }
    match reputation.unblock(&ip) {
        Ok(()) => (StatusCode::OK, Json(json!({"message": "IP unblocked", "ip": ip}))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn reload_rules(State(state): State<AppState>) -> impl IntoResponse {
    match state.pipeline.reload_rules() {
        Ok(version) => {
            info!(version = %version, "Rules reloaded via admin API");
            (StatusCode::OK, Json(json!({"version": version}))).into_response()
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": e.to_string(),
                "version": state.pipeline.rules_version(),
            })),
        )
            .into_response(),
    }
}
