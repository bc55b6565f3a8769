//! REST API Server for the Finance Query Orchestrator
//!
//! Exposes the agent via HTTP endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::error::OrchestrationError;
use crate::models::{OutputShape, Request, RequestStatus};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub output_shape: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            error_kind: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            error_kind: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn from_error(e: &OrchestrationError) -> Self {
        Self {
            error_kind: Some(e.kind().to_string()),
            ..Self::error(e.to_string())
        }
    }
}

fn status_for(e: &OrchestrationError) -> StatusCode {
    match e {
        OrchestrationError::PlanningError(_) | OrchestrationError::ComputationError(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        OrchestrationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OrchestrationError::ConnectorError(_) | OrchestrationError::SchemaViolation(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<Agent>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Query Endpoint
/// =============================

async fn run_query(
    State(state): State<ApiState>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.question.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("question must not be empty".into())),
        );
    }
    info!("Received query: {}", req.question);

    let shape = OutputShape::from(req.output_shape.unwrap_or_default());
    match state.agent.run(Request::new(req.question, shape)).await {
        Ok(outcome) => {
            let status = match outcome.report.status {
                RequestStatus::Failed => StatusCode::BAD_GATEWAY,
                _ => StatusCode::OK,
            };
            (
                status,
                Json(ApiResponse::success(serde_json::json!({
                    "audit_id": outcome.audit_id,
                    "status": outcome.report.status,
                    "report": outcome.report,
                    "reasoning_trace": outcome.reasoning_trace,
                    "execution_time_ms": outcome.execution_time_ms,
                }))),
            )
        }
        Err(e) => {
            warn!(error = %e, "Query rejected");
            (status_for(&e), Json(ApiResponse::from_error(&e)))
        }
    }
}

/// =============================
/// Catalog Endpoint
/// =============================

async fn list_capabilities(State(state): State<ApiState>) -> Json<ApiResponse> {
    let capabilities: Vec<serde_json::Value> = state
        .agent
        .catalog()
        .iter()
        .map(|d| {
            serde_json::json!({
                "name": d.name,
                "category": d.category,
                "description": d.description,
            })
        })
        .collect();
    Json(ApiResponse::success(capabilities))
}

/// =============================
/// Audit Endpoints
/// =============================

async fn get_audit(
    State(state): State<ApiState>,
    Path(audit_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    let log = state.agent.audit_log();
    match log.get(audit_id).await {
        Ok(Some(record)) => {
            let intact = log.verify_integrity(audit_id).await.unwrap_or(false);
            (
                StatusCode::OK,
                Json(ApiResponse::success(serde_json::json!({
                    "record": record,
                    "integrity_verified": intact,
                }))),
            )
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("no audit record {}", audit_id))),
        ),
        Err(e) => (status_for(&e), Json(ApiResponse::from_error(&e))),
    }
}

async fn list_audit(
    State(state): State<ApiState>,
    Query(query): Query<RecentQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.agent.audit_log().list_recent(query.limit.unwrap_or(20)).await {
        Ok(records) => {
            let items: Vec<serde_json::Value> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "audit_id": r.audit_id,
                        "question": r.request.raw_text,
                        "status": r.results.status,
                        "created_at": r.created_at,
                        "execution_time_ms": r.execution_time_ms,
                    })
                })
                .collect();
            (StatusCode::OK, Json(ApiResponse::success(items)))
        }
        Err(e) => (status_for(&e), Json(ApiResponse::from_error(&e))),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(agent: Arc<Agent>) -> Router {
    let state = ApiState { agent };

    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(run_query))
        .route("/api/capabilities", get(list_capabilities))
        .route("/api/audit", get(list_audit))
        .route("/api/audit/:audit_id", get(get_audit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    agent: Arc<Agent>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(agent);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
