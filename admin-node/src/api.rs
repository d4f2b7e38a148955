//! Admin HTTP API.
//!
//! Thin handlers: validate the request, call into the orchestrator or the
//! clients, map the outcome onto status codes. Write endpoints require the
//! configured API key; when none is configured validation is bypassed with
//! a warning.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, warn};

use crate::broker::BrokerApi;
use crate::config::AdminConfig;
use crate::error::AdminError;
use crate::health::ClusterValidator;
use crate::orchestrator::{RestartOptions, RestartOrchestrator, RunOutcome, StartReport};
use crate::ssh::{CommandRunner, ExecOptions};
use crate::status::StatusReporter;
use crate::topology::{BrokerNode, ClusterTopology};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const NODE_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const NODE_START_TIMEOUT: Duration = Duration::from_secs(45);
const NODE_RESTART_TIMEOUT: Duration = Duration::from_secs(60);

type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<AdminConfig>,
    pub topology: Arc<ClusterTopology>,
    pub broker: Arc<dyn BrokerApi>,
    pub runner: Arc<dyn CommandRunner>,
    pub orchestrator: Arc<RestartOrchestrator>,
    pub validator: Arc<ClusterValidator>,
    pub reporter: Arc<StatusReporter>,
}

/// Create the admin API router with all endpoints.
pub fn create_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/rolling-restart/start", post(start_rolling_restart))
        .route("/api/rolling-restart/status", get(restart_status))
        .route("/api/rolling-restart/cancel", post(cancel_restart))
        .route("/api/rolling-restart/validate", post(validate_restart))
        .route("/api/rolling-restart/history", get(restart_history))
        .route("/api/cluster/status", get(cluster_status))
        .route("/api/cluster/health", get(cluster_health))
        .route("/api/cluster/connections", get(cluster_connections))
        .route("/api/cluster/connectivity", get(cluster_connectivity))
        .route("/api/nodes/:id", get(node_info))
        .route("/api/nodes/:id/queues", get(node_queues))
        .route("/api/nodes/:id/maintenance", put(node_maintenance))
        .route("/api/nodes/:id/restart", post(node_restart))
        .route("/api/nodes/:id/stop", post(node_stop))
        .route("/api/nodes/:id/start", post(node_start))
        .route("/health", get(service_health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API-key check for write endpoints.
async fn require_api_key(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    if request.method() == Method::GET {
        return next.run(request).await;
    }

    let Some(expected) = state.config.api.api_key.as_deref() else {
        warn!("No API key configured, write endpoint validation bypassed");
        return next.run(request).await;
    };

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    let query_key = request.uri().query().and_then(api_key_from_query);

    if header_key == Some(expected) || query_key == Some(expected) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected request with invalid API key");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing API key" })),
        )
            .into_response()
    }
}

fn api_key_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("apiKey="))
}

async fn start_rolling_restart(
    State(state): State<ApiState>,
    options: Option<Json<RestartOptions>>,
) -> ApiResponse {
    let options = options.map(|Json(o)| o).unwrap_or_default();

    match state.orchestrator.start(options).await {
        Ok(StartReport::DryRun(report)) => (StatusCode::OK, Json(json!(report))),
        Ok(StartReport::Finished(summary)) => match summary.outcome {
            RunOutcome::Completed => (
                StatusCode::OK,
                Json(json!({ "status": "completed", "summary": summary })),
            ),
            RunOutcome::Cancelled => (
                StatusCode::OK,
                Json(json!({ "status": "cancelled", "summary": summary })),
            ),
            RunOutcome::Failed => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": summary.error,
                    "nodesCompleted": summary.nodes_completed,
                    "totalNodes": summary.total_nodes,
                })),
            ),
        },
        Err(AdminError::Disabled) => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": AdminError::Disabled.to_string() })),
        ),
        Err(e @ AdminError::AlreadyActive) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        }
        Err(AdminError::Admission { reasons }) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Cluster validation failed", "reasons": reasons })),
        ),
        Err(e) => {
            error!(error = %e, "Rolling restart start failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn restart_status(State(state): State<ApiState>) -> ApiResponse {
    let status = state.reporter.status().await;
    (StatusCode::OK, Json(json!(status)))
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

async fn cancel_restart(
    State(state): State<ApiState>,
    body: Option<Json<CancelRequest>>,
) -> ApiResponse {
    let reason = body
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "operator request".to_string());

    match state.orchestrator.cancel().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "cancel-requested", "reason": reason })),
        ),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))),
    }
}

async fn validate_restart(State(state): State<ApiState>) -> ApiResponse {
    let verdict = state.orchestrator.validate_only().await;
    let code = if verdict.can_restart {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (code, Json(json!(verdict)))
}

async fn restart_history(State(state): State<ApiState>) -> ApiResponse {
    let records = state.orchestrator.history().await;
    (
        StatusCode::OK,
        Json(json!({ "persisted": false, "records": records })),
    )
}

async fn cluster_status(State(state): State<ApiState>) -> ApiResponse {
    let mut nodes = Vec::with_capacity(state.topology.node_count());

    for node in state.topology.nodes_in_restart_order() {
        let health = match state.broker.check_node_health(node).await {
            Ok(health) => Some(health),
            Err(e) => {
                warn!(node = %node.name, error = %e, "Node health unavailable");
                None
            }
        };
        let connections = state.broker.connection_count(&node.id).await.unwrap_or(0);
        let queues = state
            .broker
            .queues(Some(&node.id))
            .await
            .map(|q| q.len() as u64)
            .unwrap_or(0);

        nodes.push(json!({
            "id": node.id,
            "name": node.name,
            "configOrder": node.config_order,
            "health": health,
            "connections": connections,
            "queues": queues,
        }));
    }

    (
        StatusCode::OK,
        Json(json!({
            "clusterName": state.topology.cluster_name,
            "nodes": nodes,
            "checkedAt": Utc::now(),
        })),
    )
}

#[derive(Debug, Default, Deserialize)]
struct ClusterHealthQuery {
    #[serde(rename = "checkSSH")]
    check_ssh: Option<bool>,
}

async fn cluster_health(
    State(state): State<ApiState>,
    Query(query): Query<ClusterHealthQuery>,
) -> ApiResponse {
    let report = state.validator.cluster_health().await;

    let code = if report.healthy_nodes == report.total_nodes {
        StatusCode::OK
    } else if report.healthy_nodes > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let mut body = json!(report);

    if query.check_ssh.unwrap_or(false) {
        let mut probes = Vec::with_capacity(state.topology.node_count());
        for node in state.topology.nodes_in_restart_order() {
            let probe = state
                .runner
                .execute(node, "uptime", ExecOptions::plain(PROBE_TIMEOUT))
                .await;
            probes.push(json!({
                "node": node.name,
                "reachable": probe.is_ok(),
                "error": probe.err().map(|e| e.to_string()),
            }));
        }
        body["ssh"] = json!(probes);
    }

    (code, Json(body))
}

async fn cluster_connectivity(State(state): State<ApiState>) -> ApiResponse {
    match state.broker.test_connectivity().await {
        Ok(probes) => (StatusCode::OK, Json(json!({ "probes": probes }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn cluster_connections(State(state): State<ApiState>) -> ApiResponse {
    match state.broker.connections(None).await {
        Ok(connections) => (
            StatusCode::OK,
            Json(json!({ "total": connections.len(), "connections": connections })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

fn lookup_node<'a>(state: &'a ApiState, id: &str) -> Option<&'a BrokerNode> {
    state.topology.node_by_id(id)
}

fn unknown_node(id: &str) -> ApiResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": AdminError::UnknownNode(id.to_string()).to_string() })),
    )
}

async fn node_info(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    let Some(node) = lookup_node(&state, &id) else {
        return unknown_node(&id);
    };

    let broker_info = state.broker.node_info(node).await.ok();

    // Read-only probes; each one is best-effort.
    let mut system = serde_json::Map::new();
    for (label, command) in [
        ("uptime", "uptime"),
        ("loadavg", "cat /proc/loadavg"),
        ("meminfo", "head -n 3 /proc/meminfo"),
        ("disk", "df -h /"),
    ] {
        let value = state
            .runner
            .execute(node, command, ExecOptions::plain(PROBE_TIMEOUT))
            .await
            .ok();
        system.insert(label.to_string(), json!(value));
    }

    (
        StatusCode::OK,
        Json(json!({
            "id": node.id,
            "name": node.name,
            "host": node.host(),
            "configOrder": node.config_order,
            "broker": broker_info,
            "system": system,
        })),
    )
}

async fn node_queues(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    let Some(node) = lookup_node(&state, &id) else {
        return unknown_node(&id);
    };

    match state.broker.queues(Some(&node.id)).await {
        Ok(queues) => (
            StatusCode::OK,
            Json(json!({ "node": node.name, "total": queues.len(), "queues": queues })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct MaintenanceRequest {
    maintenance: bool,
    reason: Option<String>,
}

async fn node_maintenance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<MaintenanceRequest>,
) -> ApiResponse {
    let Some(node) = lookup_node(&state, &id) else {
        return unknown_node(&id);
    };

    let reason = request
        .reason
        .unwrap_or_else(|| "operator request".to_string());

    match state
        .broker
        .set_maintenance_mode(node, request.maintenance, &reason)
        .await
    {
        Ok(ack) => (StatusCode::OK, Json(json!(ack))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn node_restart(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    node_power(state, id, "restart", NODE_RESTART_TIMEOUT).await
}

async fn node_stop(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    node_power(state, id, "stop", NODE_STOP_TIMEOUT).await
}

async fn node_start(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    node_power(state, id, "start", NODE_START_TIMEOUT).await
}

/// Single-node systemctl operation over SSH, outside any orchestrated run.
async fn node_power(
    state: ApiState,
    id: String,
    action: &'static str,
    timeout: Duration,
) -> ApiResponse {
    let Some(node) = lookup_node(&state, &id) else {
        return unknown_node(&id);
    };

    let command = format!("systemctl {} {}", action, state.config.broker.service_name);
    match state
        .runner
        .execute(node, &command, ExecOptions::sudo(timeout))
        .await
    {
        Ok(output) => (
            StatusCode::OK,
            Json(json!({ "node": node.name, "action": action, "output": output })),
        ),
        Err(e) => {
            error!(node = %node.name, action, error = %e, "Node power operation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn service_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_from_query() {
        assert_eq!(api_key_from_query("apiKey=secret"), Some("secret"));
        assert_eq!(api_key_from_query("a=1&apiKey=secret&b=2"), Some("secret"));
        assert_eq!(api_key_from_query("a=1&b=2"), None);
        assert_eq!(api_key_from_query(""), None);
    }
}
