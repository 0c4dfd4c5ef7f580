//! RPC method handlers.

use std::sync::Arc;

use serde_json::{json, Value};

use overwatch_core::ids::{InterventionId, SessionId};
use overwatch_store::{Database, SessionRepo, SessionStatus};
use overwatch_telemetry::{LogQuery, TelemetryGuard};

use crate::gateway::{Gateway, LogEventRequest};
use crate::lifecycle::StartSession;
use crate::rpc::{self, RpcResponse};

const DEFAULT_EVENT_LIMIT: u32 = 50;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub db: Database,
    pub gateway: Arc<Gateway>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(db: Database, gateway: Arc<Gateway>) -> Self {
        Self {
            db,
            gateway,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Dispatch an RPC method to its handler. camelCase params are normalized
/// to snake_case first.
pub async fn dispatch(state: &Arc<HandlerState>, method: &str, params: &Value, id: Option<Value>) -> RpcResponse {
    let params = rpc::normalize_params(params);

    match method {
        "session.start" => session_start(state, &params, id),
        "session.heartbeat" => session_heartbeat(state, &params, id),
        "session.end" => session_end(state, &params, id),
        "session.status" => session_status(state, &params, id),

        "events.log" => events_log(state, params, id).await,
        "events.list" => events_list(state, &params, id),

        "interventions.list" => interventions_list(state, &params, id),
        "interventions.acknowledge" => interventions_acknowledge(state, &params, id),
        "instructions.issue" => instructions_issue(state, &params, id),
        "suggestions.get" => suggestions_get(state, &params, id).await,
        "policies.list" => policies_list(state, id),

        "telemetry.logs" => telemetry_logs(state, &params, id),
        "system.health" | "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn session_param(params: &Value) -> Result<SessionId, String> {
    rpc::require_str(params, "session_id").map(|s| SessionId::from_raw(s.trim()))
}

fn to_result<T: serde::Serialize>(id: Option<Value>, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => RpcResponse::success(id, v),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

// ── Session ──

fn session_start(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let req = StartSession {
        session_id: rpc::optional_str(params, "session_id").map(SessionId::from_raw),
        project_path: rpc::optional_str(params, "project_path").map(String::from),
        user_id: rpc::optional_str(params, "user_id").map(String::from),
        agent_profile: params.get("agent_profile").cloned(),
        metadata: params.get("metadata").cloned(),
    };
    match state.gateway.lifecycle().start_session(req) {
        Ok(row) => to_result(id, &row),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn session_heartbeat(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match session_param(params) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state
        .gateway
        .lifecycle()
        .heartbeat(&session_id, params.get("metadata").cloned())
    {
        Ok(row) => RpcResponse::success(
            id,
            json!({
                "sessionId": row.id,
                "status": row.status,
                "lastSeenAt": row.last_seen_at,
            }),
        ),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn session_end(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match session_param(params) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.gateway.lifecycle().end_session(&session_id) {
        Ok(row) => to_result(id, &row),
        Err(e) => RpcResponse::from_gateway(id, &crate::error::GatewayError::from(e)),
    }
}

fn session_status(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match session_param(params) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.gateway.session_status(&session_id) {
        Ok(v) => RpcResponse::success(id, v),
        Err(e) => RpcResponse::from_gateway(id, &e),
    }
}

// ── Events ──

async fn events_log(state: &Arc<HandlerState>, params: Value, id: Option<Value>) -> RpcResponse {
    let req: LogEventRequest = match serde_json::from_value(params) {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e.to_string()),
    };
    match state.gateway.log_event(req).await {
        Ok(result) => to_result(id, &result),
        Err(e) => RpcResponse::from_gateway(id, &e),
    }
}

fn events_list(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match session_param(params) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let limit = rpc::optional_u32(params, "limit").unwrap_or(DEFAULT_EVENT_LIMIT);
    match state.gateway.stores().events.events_by_session(&session_id, limit) {
        Ok(events) => RpcResponse::success(id, json!({ "events": events, "count": events.len() })),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

// ── Interventions ──

fn interventions_list(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match session_param(params) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let limit = rpc::optional_u32(params, "limit");
    match state
        .gateway
        .stores()
        .interventions
        .interventions_by_session(&session_id, limit)
    {
        Ok(rows) => RpcResponse::success(id, json!({ "interventions": rows, "count": rows.len() })),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn interventions_acknowledge(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let intervention_id = match rpc::require_str(params, "intervention_id") {
        Ok(s) => InterventionId::from_raw(s.trim()),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let status = match rpc::require_str(params, "status") {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state
        .gateway
        .acknowledge_intervention(&intervention_id, status, params.get("result").cloned())
    {
        Ok(outcome) => to_result(id, &outcome),
        Err(e) => RpcResponse::from_gateway(id, &e),
    }
}

fn instructions_issue(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match session_param(params) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let instruction = match rpc::require_str(params, "instruction") {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.gateway.issue_instruction(&session_id, instruction) {
        Ok(outcome) => to_result(id, &outcome),
        Err(e) => RpcResponse::from_gateway(id, &e),
    }
}

async fn suggestions_get(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let session_id = match session_param(params) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.gateway.suggestions(&session_id).await {
        Ok(suggestions) => RpcResponse::success(id, json!({ "suggestions": suggestions })),
        Err(e) => RpcResponse::from_gateway(id, &e),
    }
}

fn policies_list(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    match state.gateway.stores().policies.active_policies() {
        Ok(policies) => RpcResponse::success(id, json!({ "policies": policies })),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

// ── System ──

fn telemetry_logs(state: &Arc<HandlerState>, params: &Value, id: Option<Value>) -> RpcResponse {
    let Some(sink) = state.telemetry.as_ref().and_then(|t| t.logs()) else {
        return RpcResponse::success(
            id,
            json!({
                "logs": [],
                "totalCount": 0,
                "enabled": false,
            }),
        );
    };

    let query = LogQuery {
        level: rpc::optional_str(params, "level").map(String::from),
        target: rpc::optional_str(params, "target").map(String::from),
        session_id: rpc::optional_str(params, "session_id").map(String::from),
        connection_id: rpc::optional_str(params, "connection_id").map(String::from),
        since: rpc::optional_str(params, "since").map(String::from),
        limit: rpc::optional_u32(params, "limit"),
    };

    match sink.query(&query) {
        Ok(records) => RpcResponse::success(
            id,
            json!({
                "totalCount": records.len(),
                "logs": records,
                "enabled": true,
            }),
        ),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

/// Database reachability plus session and connection counts.
pub fn health_snapshot(state: &HandlerState) -> (bool, Value) {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(true)
        })
        .unwrap_or(false);
    let active_sessions = SessionRepo::new(state.db.clone())
        .count_by_status(SessionStatus::Active)
        .unwrap_or(0);
    let hubs = state.gateway.hubs();

    let body = json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "activeSessions": active_sessions,
        "activeConnections": hubs.connection_count(),
        "components": {
            "database": if db_ok { "ok" } else { "error" },
        },
    });
    (db_ok, body)
}

fn health(state: &Arc<HandlerState>, id: Option<Value>) -> RpcResponse {
    RpcResponse::success(id, health_snapshot(state).1)
}
