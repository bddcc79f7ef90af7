//! Control-plane HTTP surface: rule management, health, and metrics.
//!
//! Rule text is screened for injection patterns before entering the
//! registry; a rejection is a 400 and never a crash.

pub mod sanitizer;

pub use sanitizer::{InjectionType, InputScreen};

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::assembler::TraceAssembler;
use crate::dsl::ExpressionCache;
use crate::error::BeTraceError;
use crate::pipeline::WorkerPool;
use crate::rules::{RuleDefinition, RuleRegistry};

// ═══════════════════════════════════════════════════════════════════════════════
// State & Router
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RuleRegistry>,
    pub assembler: Arc<TraceAssembler>,
    pub pool: Arc<WorkerPool>,
    pub cache: Arc<ExpressionCache>,
    pub screen: Arc<InputScreen>,
    pub prometheus: Option<PrometheusHandle>,
}

/// Build the control-plane router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/rules", post(upsert_rule).get(list_rules))
        .route("/api/v1/rules/:id", get(get_rule).delete(delete_rule))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule Management
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct UpsertRuleRequest {
    pub name: String,
    /// DSL v2 text
    pub expression: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct UpsertRuleResponse {
    pub success: bool,
    pub id: String,
}

async fn upsert_rule(
    State(state): State<AppState>,
    Json(body): Json<UpsertRuleRequest>,
) -> Result<impl IntoResponse, BeTraceError> {
    if body.name.trim().is_empty() || body.expression.trim().is_empty() {
        return Err(BeTraceError::validation(
            "rule name and expression must be non-empty",
        ));
    }

    state
        .screen
        .screen("name", &body.name)
        .map_err(|kind| BeTraceError::malicious_input(kind.to_string()))?;
    state
        .screen
        .screen("expression", &body.expression)
        .map_err(|kind| BeTraceError::malicious_input(kind.to_string()))?;

    let id = state
        .registry
        .put(&body.name, &body.expression, body.active);
    info!(rule_id = %id, rule_name = %body.name, "rule accepted via control plane");

    Ok((
        StatusCode::OK,
        Json(UpsertRuleResponse { success: true, id }),
    ))
}

async fn list_rules(State(state): State<AppState>) -> Json<Vec<RuleDefinition>> {
    let snapshot = state.registry.snapshot();
    let mut rules: Vec<RuleDefinition> = snapshot.all_rules().cloned().collect();
    rules.sort_by(|a, b| a.name.cmp(&b.name));
    Json(rules)
}

async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RuleDefinition>, BeTraceError> {
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| BeTraceError::not_found("rule", id))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, BeTraceError> {
    if state.registry.delete(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(BeTraceError::not_found("rule", id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

async fn health_live() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let pool_stats = state.pool.stats();
    let cache_stats = state.cache.stats();
    Json(json!({
        "status": "ok",
        "rules": state.registry.snapshot().len(),
        "pending_traces": state.assembler.pending_traces(),
        "resident_spans": state.assembler.resident_spans(),
        "worker_pool": pool_stats,
        "expression_cache": {
            "entries": cache_stats.entries,
            "hits": cache_stats.hits,
            "misses": cache_stats.misses,
            "evictions": cache_stats.evictions,
        },
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::from("metrics disabled\n")),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceConfig;
    use crate::pipeline::WorkerPoolConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState {
            registry: Arc::new(RuleRegistry::new("t1")),
            assembler: Arc::new(TraceAssembler::new(TraceConfig::default())),
            pool: Arc::new(WorkerPool::new(WorkerPoolConfig::default())),
            cache: Arc::new(ExpressionCache::new(16)),
            screen: Arc::new(InputScreen::default()),
            prometheus: None,
        }
    }

    async fn send_json(router: Router, method: &str, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_upsert_returns_derived_id() {
        let state = state();
        let router = build_router(state.clone());
        let (status, body) = send_json(
            router,
            "POST",
            "/api/v1/rules",
            json!({
                "name": "fraud-check",
                "expression": "when { payment.charge.where(amount > 1000) } always { payment.fraud_check }",
                "active": true
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let id = body["id"].as_str().unwrap();
        assert!(id.starts_with("rule_"));
        assert!(state.registry.get(id).is_some());
    }

    #[tokio::test]
    async fn test_upsert_rejects_injection() {
        let router = build_router(state());
        let (status, body) = send_json(
            router,
            "POST",
            "/api/v1/rules",
            json!({
                "name": "<script>alert(1)</script>",
                "expression": "when { a } always { b }",
            }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "MALICIOUS_INPUT");
    }

    #[tokio::test]
    async fn test_upsert_rejects_shell_metacharacters() {
        let router = build_router(state());
        let (status, _) = send_json(
            router,
            "POST",
            "/api/v1/rules",
            json!({
                "name": "r",
                "expression": "when { a } always { b }; rm -rf /",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_missing_rule_is_404() {
        let router = build_router(state());
        let (status, _) = send_json(router, "GET", "/api/v1/rules/rule_ffffffffffffffff", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_then_404() {
        let state = state();
        let id = state.registry.put("r", "when { a } always { b }", true);
        let router = build_router(state.clone());

        let (status, _) = send_json(
            router.clone(),
            "DELETE",
            &format!("/api/v1/rules/{}", id),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send_json(
            router,
            "DELETE",
            &format!("/api/v1/rules/{}", id),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_live() {
        let router = build_router(state());
        let (status, body) = send_json(router, "GET", "/health/live", serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
