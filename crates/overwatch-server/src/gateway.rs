use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use overwatch_core::ids::{ConnectionId, EventId, InterventionId, PolicyId, SessionId};
use overwatch_core::{Envelope, OutboundKind};
use overwatch_engine::{PolicyEngine, SuggestionAdvisor};
use overwatch_store::{
    InterventionRow, InterventionUpdate, NewEvent, NewIntervention, PolicyAction, Severity,
    StoreError, Stores,
};

use crate::error::GatewayError;
use crate::hub::{Channel, HubRegistry};
use crate::lifecycle::{LifecycleManager, Signal};

const MANUAL_REASONING: &str = "operator-issued instruction";
const PENDING_ON_WELCOME: u32 = 20;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEventRequest {
    #[serde(default, alias = "session_id")]
    pub session_id: String,
    #[serde(default, rename = "type", alias = "event_type")]
    pub event_type: String,
    #[serde(default)]
    pub level: Option<Severity>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The caller-facing view of an intervention; delivery state is omitted
/// because delivery is still in flight when this is returned.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionSummary {
    pub id: InterventionId,
    pub rule_id: PolicyId,
    pub decision: PolicyAction,
    pub instruction: Option<String>,
    pub reasoning: Option<String>,
}

impl From<&InterventionRow> for InterventionSummary {
    fn from(row: &InterventionRow) -> Self {
        Self {
            id: row.id.clone(),
            rule_id: row.rule_id.clone(),
            decision: row.decision,
            instruction: row.instruction.clone(),
            reasoning: row.reasoning.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEventResult {
    pub event_id: EventId,
    pub interventions: Vec<InterventionSummary>,
    /// False when the policy set could not be read, so an empty
    /// `interventions` does not mean nothing matched.
    pub evaluated: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AckOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueOutcome {
    pub success: bool,
    pub message: String,
    pub intervention_id: InterventionId,
    pub persisted: bool,
    pub delivered: usize,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckData {
    #[serde(alias = "intervention_id", alias = "id")]
    intervention_id: String,
    status: String,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatData {
    #[serde(default, alias = "meta")]
    metadata: Option<Value>,
}

/// Entry point for every inbound operation, whichever transport it came from.
pub struct Gateway {
    stores: Stores,
    engine: Arc<PolicyEngine>,
    advisor: Arc<SuggestionAdvisor>,
    hubs: Arc<HubRegistry>,
    lifecycle: Arc<LifecycleManager>,
}

impl Gateway {
    pub fn new(
        stores: Stores,
        engine: Arc<PolicyEngine>,
        advisor: Arc<SuggestionAdvisor>,
        hubs: Arc<HubRegistry>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            stores,
            engine,
            advisor,
            hubs,
            lifecycle,
        }
    }

    pub fn hubs(&self) -> &Arc<HubRegistry> {
        &self.hubs
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Record an event, evaluate it, and push every resulting intervention
    /// to all live connections of the session.
    #[instrument(skip(self, req), fields(session_id = %req.session_id, event_type = %req.event_type))]
    pub async fn log_event(&self, req: LogEventRequest) -> Result<LogEventResult, GatewayError> {
        let session_id = require_session(&req.session_id)?;
        if req.event_type.trim().is_empty() {
            return Err(GatewayError::Validation("event type is required".into()));
        }
        let Some(payload) = req.payload else {
            return Err(GatewayError::Validation("payload is required".into()));
        };

        self.lifecycle.ensure_session(&session_id)?;
        let event = self.stores.events.create_event(&NewEvent {
            session_id: session_id.clone(),
            event_type: req.event_type,
            level: req.level,
            payload,
            tags: req.tags,
        })?;
        self.lifecycle.signal(&session_id, Signal::EventLogged);

        let (fired, evaluated) = match self.engine.evaluate_policies(&session_id, &event).await {
            Ok(rows) => (rows, true),
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "policy evaluation aborted, event kept without interventions");
                (Vec::new(), false)
            }
        };
        for row in &fired {
            let delivered = self.hubs.broadcast(&session_id, &intervention_envelope(row));
            debug!(intervention_id = %row.id, delivered, "intervention pushed");
        }

        Ok(LogEventResult {
            event_id: event.id,
            interventions: fired.iter().map(InterventionSummary::from).collect(),
            evaluated,
        })
    }

    /// Mark an intervention delivered and store the client's outcome. Any
    /// status string is accepted; repeated acks overwrite the result.
    #[instrument(skip(self, result), fields(intervention_id = %id))]
    pub fn acknowledge_intervention(
        &self,
        id: &InterventionId,
        status: &str,
        result: Option<Value>,
    ) -> Result<AckOutcome, GatewayError> {
        if id.is_empty() {
            return Err(GatewayError::Validation("intervention id is required".into()));
        }
        if status.trim().is_empty() {
            return Err(GatewayError::Validation("status is required".into()));
        }

        let update = InterventionUpdate {
            delivered: Some(true),
            result: Some(json!({
                "status": status,
                "result": result.unwrap_or(Value::Null),
                "acknowledgedAt": overwatch_core::timestamp_now(),
            })),
        };
        match self.stores.interventions.update_intervention(id, &update) {
            Ok(_) => {
                info!(status, "intervention acknowledged");
                Ok(AckOutcome {
                    success: true,
                    message: format!("Intervention {id} acknowledged as {status}"),
                })
            }
            Err(StoreError::NotFound(_)) => Ok(AckOutcome {
                success: false,
                message: format!("Intervention {id} not found"),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Push an operator instruction to a session outside policy evaluation.
    /// It is recorded like any other intervention when possible; a failed
    /// insert does not stop the live push.
    #[instrument(skip(self, instruction), fields(session_id = %session_id))]
    pub fn issue_instruction(&self, session_id: &SessionId, instruction: &str) -> Result<IssueOutcome, GatewayError> {
        let session_id = require_session(session_id.as_str())?;
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(GatewayError::Validation("instruction is required".into()));
        }

        let new = NewIntervention {
            session_id: session_id.clone(),
            rule_id: PolicyId::manual(),
            event_id: None,
            decision: PolicyAction::Advise,
            reasoning: Some(MANUAL_REASONING.into()),
            instruction: Some(instruction.to_string()),
        };
        let (row, persisted) = match self.stores.interventions.create_intervention(&new) {
            Ok(row) => (row, true),
            Err(e) => {
                warn!(error = %e, "manual instruction not persisted, delivering anyway");
                (unsaved_intervention(new), false)
            }
        };

        let delivered = self.hubs.broadcast(&session_id, &intervention_envelope(&row));
        info!(intervention_id = %row.id, delivered, persisted, "manual instruction issued");
        Ok(IssueOutcome {
            success: true,
            message: format!("Instruction sent to {delivered} connection(s)"),
            intervention_id: row.id,
            persisted,
            delivered,
        })
    }

    pub async fn suggestions(&self, session_id: &SessionId) -> Result<Vec<String>, GatewayError> {
        let session_id = require_session(session_id.as_str())?;
        Ok(self.advisor.suggestions(&session_id).await)
    }

    /// Session row plus its live connection count.
    pub fn session_status(&self, session_id: &SessionId) -> Result<Value, GatewayError> {
        let row = self.lifecycle.get(session_id)?;
        let mut value = serde_json::to_value(&row).map_err(|e| GatewayError::Store(e.into()))?;
        value["activeConnections"] = json!(self.hubs.active_count(session_id));
        Ok(value)
    }

    // ── Connection hooks ──

    /// Attach a connection to its session hub and greet it.
    #[instrument(skip(self, channel, metadata), fields(session_id = %session_id, connection_id = %connection_id))]
    pub fn on_connect(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        channel: Arc<dyn Channel>,
        metadata: Value,
    ) -> Result<(), GatewayError> {
        let session_id = require_session(session_id.as_str())?;
        self.lifecycle.ensure_session(&session_id)?;
        self.hubs.register(&session_id, connection_id.clone(), channel, metadata);
        let status = self.lifecycle.signal(&session_id, Signal::Connected);
        info!(active = self.hubs.active_count(&session_id), "connection opened");

        let connected = Envelope::new(
            OutboundKind::Connected,
            json!({
                "sessionId": session_id,
                "connectionId": connection_id,
            }),
        );
        self.hubs.send_to(connection_id, &connected);

        let pending: Vec<InterventionRow> = self
            .stores
            .interventions
            .interventions_by_session(&session_id, Some(PENDING_ON_WELCOME))
            .map(|rows| rows.into_iter().filter(|r| !r.delivered).collect())
            .unwrap_or_else(|e| {
                warn!(error = %e, "could not load pending interventions");
                Vec::new()
            });
        let welcome = Envelope::new(
            OutboundKind::Welcome,
            json!({
                "sessionId": session_id,
                "status": status,
                "activeConnections": self.hubs.active_count(&session_id),
                "pendingInterventions": pending,
            }),
        );
        self.hubs.send_to(connection_id, &welcome);
        Ok(())
    }

    /// Handle one inbound frame. Replies go back to the sending connection only.
    pub async fn on_message(&self, connection_id: &ConnectionId, raw: &str) {
        let Some(session_id) = self.hubs.session_of(connection_id) else {
            warn!(connection_id = %connection_id, "message from unregistered connection");
            return;
        };

        let message: InboundMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                self.reply(connection_id, Envelope::error("PARSE_ERROR", format!("malformed message: {e}")));
                return;
            }
        };

        let reply = match message.kind.as_str() {
            "log_event" | "event" => self.handle_log_event(&session_id, message.data).await,
            "heartbeat" | "ping" => self.handle_heartbeat(&session_id, message.data),
            "ack" | "acknowledge" => self.handle_ack(message.data),
            other => {
                debug!(connection_id = %connection_id, kind = other, "unknown message type");
                Ok(Envelope::new(OutboundKind::Unknown, json!({ "type": other })))
            }
        };

        let envelope = reply.unwrap_or_else(|e| Envelope::error(e.code(), e.to_string()));
        self.reply(connection_id, envelope);
    }

    async fn handle_log_event(&self, session_id: &SessionId, data: Value) -> Result<Envelope, GatewayError> {
        let mut req: LogEventRequest =
            serde_json::from_value(data).map_err(|e| GatewayError::Validation(e.to_string()))?;
        req.session_id = session_id.to_string();
        let result = self.log_event(req).await?;
        let data = serde_json::to_value(&result).unwrap_or_default();
        Ok(Envelope::new(OutboundKind::EventLogged, data))
    }

    fn handle_heartbeat(&self, session_id: &SessionId, data: Value) -> Result<Envelope, GatewayError> {
        let data: HeartbeatData = serde_json::from_value(data).unwrap_or_default();
        let row = self.lifecycle.heartbeat(session_id, data.metadata)?;
        Ok(Envelope::new(
            OutboundKind::HeartbeatAck,
            json!({ "sessionId": row.id, "status": row.status }),
        ))
    }

    fn handle_ack(&self, data: Value) -> Result<Envelope, GatewayError> {
        let ack: AckData = serde_json::from_value(data).map_err(|e| GatewayError::Validation(e.to_string()))?;
        let id = InterventionId::from_raw(ack.intervention_id);
        let outcome = self.acknowledge_intervention(&id, &ack.status, ack.result)?;
        Ok(Envelope::new(
            OutboundKind::AckReceived,
            json!({
                "interventionId": id,
                "success": outcome.success,
                "message": outcome.message,
            }),
        ))
    }

    fn reply(&self, connection_id: &ConnectionId, envelope: Envelope) {
        if !self.hubs.send_to(connection_id, &envelope) {
            debug!(connection_id = %connection_id, kind = envelope.kind.as_str(), "reply not delivered");
        }
    }

    /// Detach a closed connection. The session goes idle when its last
    /// connection leaves.
    pub fn on_close(&self, connection_id: &ConnectionId, code: Option<u16>, reason: &str) {
        let Some((session_id, remaining)) = self.hubs.unregister(connection_id) else {
            return;
        };
        info!(session_id = %session_id, connection_id = %connection_id, ?code, reason, remaining, "connection closed");
        if remaining == 0 {
            self.session_emptied(&session_id);
        }
    }

    /// Idle a session whose hub just ran out of connections. A connection
    /// that registered meanwhile has either already signalled, or is seen
    /// here and the session is put back to active.
    pub fn session_emptied(&self, session_id: &SessionId) {
        self.lifecycle.signal(session_id, Signal::LastConnectionClosed);
        let active = self.hubs.active_count(session_id);
        if active > 0 {
            debug!(session_id = %session_id, active, "connection arrived while closing, session stays active");
            self.lifecycle.signal(session_id, Signal::Connected);
        }
    }

    /// Detach a failed connection and flag its session.
    pub fn on_error(&self, connection_id: &ConnectionId, error: &str) {
        let Some((session_id, remaining)) = self.hubs.unregister(connection_id) else {
            return;
        };
        warn!(session_id = %session_id, connection_id = %connection_id, error, remaining, "connection transport error");
        self.lifecycle.signal(&session_id, Signal::TransportError);
    }
}

fn require_session(raw: &str) -> Result<SessionId, GatewayError> {
    let id = SessionId::from_raw(raw.trim());
    if id.is_empty() {
        return Err(GatewayError::Validation("session id is required".into()));
    }
    Ok(id)
}

pub fn intervention_envelope(row: &InterventionRow) -> Envelope {
    Envelope::new(OutboundKind::Intervention, serde_json::to_value(row).unwrap_or_default())
}

fn unsaved_intervention(new: NewIntervention) -> InterventionRow {
    InterventionRow {
        id: InterventionId::new(),
        session_id: new.session_id,
        rule_id: new.rule_id,
        event_id: new.event_id,
        fired_at: overwatch_core::timestamp_now(),
        decision: new.decision,
        reasoning: new.reasoning,
        instruction: new.instruction,
        delivered: false,
        result: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ChannelState;
    use crate::test_support::{context, context_with, OfflineEvents, OfflinePolicies, RecordingChannel};
    use overwatch_core::BackendError;
    use overwatch_llm::mock::MockResponse;
    use overwatch_store::SessionStatus;

    fn log(session: &str, payload: Value) -> LogEventRequest {
        LogEventRequest {
            session_id: session.into(),
            event_type: "code_change".into(),
            level: None,
            payload: Some(payload),
            tags: vec![],
        }
    }

    fn connect(ctx: &crate::test_support::TestContext, session: &str) -> (ConnectionId, Arc<RecordingChannel>) {
        let channel = RecordingChannel::open();
        let id = ConnectionId::new();
        ctx.gateway
            .on_connect(&SessionId::from_raw(session), &id, channel.clone(), json!({}))
            .unwrap();
        (id, channel)
    }

    fn of_kind(channel: &RecordingChannel, kind: &str) -> Vec<Value> {
        channel
            .received_json()
            .into_iter()
            .filter(|m| m["type"] == kind)
            .collect()
    }

    #[tokio::test]
    async fn matching_event_returns_warn_intervention() {
        let ctx = context(vec![]);
        let result = ctx.gateway.log_event(log("S", json!({"code": "import workers-ai"}))).await.unwrap();

        assert_eq!(result.interventions.len(), 1);
        assert_eq!(result.interventions[0].decision, PolicyAction::Warn);
        assert_eq!(
            result.interventions[0].instruction.as_deref(),
            Some("Use the AI binding instead of importing workers-ai")
        );
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["interventions"][0]["ruleId"], "pol_workers_ai");
        assert!(wire["interventions"][0].get("delivered").is_none());
    }

    #[tokio::test]
    async fn non_matching_event_returns_none() {
        let ctx = context(vec![]);
        let result = ctx.gateway.log_event(log("S", json!({"code": "import foo-bar"}))).await.unwrap();
        assert!(result.interventions.is_empty());
    }

    #[tokio::test]
    async fn failing_generator_uses_policy_description() {
        let ctx = context(vec![MockResponse::Error(BackendError::Overloaded)]);
        let result = ctx.gateway.log_event(log("S", json!({"code": "import workers-ai"}))).await.unwrap();
        assert_eq!(
            result.interventions[0].instruction.as_deref(),
            Some("Use the AI binding instead of importing workers-ai")
        );
    }

    #[tokio::test]
    async fn both_connections_receive_same_intervention() {
        let ctx = context(vec![]);
        let (_, a) = connect(&ctx, "S");
        let (_, b) = connect(&ctx, "S");
        let (_, other) = connect(&ctx, "T");

        let result = ctx.gateway.log_event(log("S", json!({"code": "import workers-ai"}))).await.unwrap();
        let id = result.interventions[0].id.to_string();

        let got_a = of_kind(&a, "intervention");
        let got_b = of_kind(&b, "intervention");
        assert_eq!(got_a.len(), 1);
        assert_eq!(got_b.len(), 1);
        assert_eq!(got_a[0]["data"]["id"], id);
        assert_eq!(got_b[0]["data"]["id"], id);
        assert_eq!(got_a[0]["data"]["delivered"], false);
        assert!(of_kind(&other, "intervention").is_empty());
    }

    #[tokio::test]
    async fn broken_connection_does_not_fail_log_event() {
        let ctx = context(vec![]);
        let (_, good) = connect(&ctx, "S");
        let bad = RecordingChannel::failing();
        ctx.gateway
            .on_connect(&SessionId::from_raw("S"), &ConnectionId::new(), bad, json!({}))
            .unwrap();

        let result = ctx.gateway.log_event(log("S", json!({"code": "import workers-ai"}))).await.unwrap();
        assert_eq!(result.interventions.len(), 1);
        assert_eq!(of_kind(&good, "intervention").len(), 1);
    }

    #[tokio::test]
    async fn unreadable_policies_flag_event_unevaluated() {
        let ctx = context_with(vec![], |stores| Stores {
            policies: Arc::new(OfflinePolicies),
            ..stores
        });
        let (id, channel) = connect(&ctx, "S");

        let result = ctx.gateway.log_event(log("S", json!({"code": "import workers-ai"}))).await.unwrap();
        assert!(!result.evaluated);
        assert!(result.interventions.is_empty());

        let other = ctx.gateway.log_event(log("S", json!({"code": "import foo-bar"}))).await;
        assert!(matches!(other, Ok(LogEventResult { evaluated: false, .. })));

        ctx.gateway
            .on_message(
                &id,
                &json!({"type": "log_event", "data": {"type": "command", "payload": "workers-ai"}}).to_string(),
            )
            .await;
        let logged = of_kind(&channel, "event_logged");
        assert_eq!(logged[0]["data"]["evaluated"], false);
        assert!(of_kind(&channel, "intervention").is_empty());
    }

    #[tokio::test]
    async fn evaluated_events_say_so() {
        let ctx = context(vec![]);
        let result = ctx.gateway.log_event(log("S", json!({"code": "import foo-bar"}))).await.unwrap();
        assert!(result.evaluated);
        assert_eq!(serde_json::to_value(&result).unwrap()["evaluated"], true);
    }

    #[tokio::test]
    async fn failed_event_write_skips_evaluation() {
        let ctx = context_with(vec![], |stores| Stores {
            events: Arc::new(OfflineEvents),
            ..stores
        });
        let (_, channel) = connect(&ctx, "S");
        let sid = SessionId::from_raw("S");

        let err = ctx
            .gateway
            .log_event(log("S", json!({"code": "import workers-ai"})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Store(_)));
        assert_eq!(ctx.backend.call_count(), 0);
        assert!(ctx
            .gateway
            .stores()
            .interventions
            .interventions_by_session(&sid, None)
            .unwrap()
            .is_empty());
        assert!(of_kind(&channel, "intervention").is_empty());
    }

    #[tokio::test]
    async fn validation_rejects_before_storage() {
        let ctx = context(vec![]);
        let err = ctx.gateway.log_event(log("  ", json!({}))).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let mut missing_type = log("S", json!({}));
        missing_type.event_type.clear();
        assert!(matches!(
            ctx.gateway.log_event(missing_type).await,
            Err(GatewayError::Validation(_))
        ));

        let mut missing_payload = log("S", json!({}));
        missing_payload.payload = None;
        assert!(matches!(
            ctx.gateway.log_event(missing_payload).await,
            Err(GatewayError::Validation(_))
        ));
        assert!(ctx.lifecycle.get(&SessionId::from_raw("S")).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unknown_session_is_auto_registered() {
        let ctx = context(vec![]);
        ctx.gateway.log_event(log("brand-new", json!({}))).await.unwrap();
        let row = ctx.lifecycle.get(&SessionId::from_raw("brand-new")).unwrap();
        assert_eq!(row.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn acknowledge_sets_delivered_and_overwrites_result() {
        let ctx = context(vec![]);
        let result = ctx.gateway.log_event(log("S", json!({"code": "import workers-ai"}))).await.unwrap();
        let id = result.interventions[0].id.clone();

        let first = ctx
            .gateway
            .acknowledge_intervention(&id, "applied", Some(json!({"files": 2})))
            .unwrap();
        assert!(first.success);
        let row = ctx.gateway.stores().interventions.get_intervention(&id).unwrap();
        assert!(row.delivered);
        assert_eq!(row.result.as_ref().unwrap()["status"], "applied");
        assert_eq!(row.result.as_ref().unwrap()["result"]["files"], 2);

        ctx.gateway.acknowledge_intervention(&id, "made-up-status", None).unwrap();
        let rows = ctx
            .gateway
            .stores()
            .interventions
            .interventions_by_session(&SessionId::from_raw("S"), None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        let result = rows[0].result.as_ref().unwrap();
        assert_eq!(result["status"], "made-up-status");
        assert!(result["result"].is_null());
        assert!(result["acknowledgedAt"].is_string());
    }

    #[tokio::test]
    async fn acknowledge_unknown_id_is_unsuccessful() {
        let ctx = context(vec![]);
        let outcome = ctx
            .gateway
            .acknowledge_intervention(&InterventionId::from_raw("int_missing"), "applied", None)
            .unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn acknowledge_does_not_change_session_status() {
        let ctx = context(vec![]);
        let result = ctx.gateway.log_event(log("S", json!({"code": "import workers-ai"}))).await.unwrap();
        let sid = SessionId::from_raw("S");
        ctx.lifecycle.end_session(&sid).unwrap();
        ctx.gateway
            .acknowledge_intervention(&result.interventions[0].id, "ignored", None)
            .unwrap();
        assert_eq!(ctx.lifecycle.get(&sid).unwrap().status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn manual_instruction_is_broadcast_and_recorded() {
        let ctx = context(vec![]);
        let (_, channel) = connect(&ctx, "S");
        let outcome = ctx
            .gateway
            .issue_instruction(&SessionId::from_raw("S"), "Pause and run the test suite")
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.persisted);
        assert_eq!(outcome.delivered, 1);

        let pushed = of_kind(&channel, "intervention");
        assert_eq!(pushed[0]["data"]["ruleId"], "manual-intervention");
        assert_eq!(pushed[0]["data"]["decision"], "advise");
        assert!(pushed[0]["data"]["eventId"].is_null());

        let stored = ctx.gateway.stores().interventions.get_intervention(&outcome.intervention_id).unwrap();
        assert!(stored.rule_id.is_manual());
    }

    #[tokio::test]
    async fn manual_instruction_for_unknown_session_still_succeeds() {
        let ctx = context(vec![]);
        let outcome = ctx
            .gateway
            .issue_instruction(&SessionId::from_raw("nobody"), "hello")
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.persisted);
        assert_eq!(outcome.delivered, 0);
    }

    #[tokio::test]
    async fn connect_sends_connected_then_welcome() {
        let ctx = context(vec![]);
        let (id, channel) = connect(&ctx, "S");
        let messages = channel.received_json();
        assert_eq!(messages[0]["type"], "connected");
        assert_eq!(messages[0]["data"]["connectionId"], id.to_string());
        assert_eq!(messages[1]["type"], "welcome");
        assert_eq!(messages[1]["data"]["status"], "active");
        assert_eq!(messages[1]["data"]["activeConnections"], 1);
    }

    #[tokio::test]
    async fn welcome_lists_pending_interventions() {
        let ctx = context(vec![]);
        ctx.gateway.log_event(log("S", json!({"code": "import workers-ai"}))).await.unwrap();
        let (_, channel) = connect(&ctx, "S");
        let welcome = &of_kind(&channel, "welcome")[0];
        assert_eq!(welcome["data"]["pendingInterventions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inbound_protocol() {
        let ctx = context(vec![]);
        let (id, channel) = connect(&ctx, "S");

        ctx.gateway
            .on_message(&id, r#"{"type": "event", "data": {"type": "code", "payload": {"code": "import workers-ai"}}}"#)
            .await;
        let logged = of_kind(&channel, "event_logged");
        assert_eq!(logged.len(), 1);
        let int_id = logged[0]["data"]["interventions"][0]["id"].as_str().unwrap().to_string();

        ctx.gateway.on_message(&id, r#"{"type": "ping"}"#).await;
        assert_eq!(of_kind(&channel, "heartbeat_ack")[0]["data"]["status"], "active");

        ctx.gateway
            .on_message(&id, &json!({"type": "ack", "data": {"interventionId": int_id, "status": "applied"}}).to_string())
            .await;
        assert_eq!(of_kind(&channel, "ack_received")[0]["data"]["success"], true);

        ctx.gateway.on_message(&id, r#"{"type": "dance"}"#).await;
        assert_eq!(of_kind(&channel, "unknown")[0]["data"]["type"], "dance");

        ctx.gateway.on_message(&id, "not json").await;
        ctx.gateway.on_message(&id, r#"{"type": "log_event", "data": {"type": "code"}}"#).await;
        let errors = of_kind(&channel, "error");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0]["data"]["code"], "PARSE_ERROR");
        assert_eq!(errors[1]["data"]["code"], "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn last_close_moves_session_idle() {
        let ctx = context(vec![]);
        let (a, _) = connect(&ctx, "S");
        let (b, _) = connect(&ctx, "S");
        let sid = SessionId::from_raw("S");

        ctx.gateway.on_close(&a, Some(1000), "bye");
        assert_eq!(ctx.lifecycle.get(&sid).unwrap().status, SessionStatus::Active);
        ctx.gateway.on_close(&b, Some(1000), "bye");
        assert_eq!(ctx.lifecycle.get(&sid).unwrap().status, SessionStatus::Idle);
        ctx.gateway.on_close(&b, None, "again");

        connect(&ctx, "S");
        assert_eq!(ctx.lifecycle.get(&sid).unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn connection_registered_during_close_keeps_session_active() {
        let ctx = context(vec![]);
        let (a, _) = connect(&ctx, "S");
        let sid = SessionId::from_raw("S");

        // Hub emptied, then a new connection registers before the idle signal lands.
        assert_eq!(ctx.hubs.unregister(&a), Some((sid.clone(), 0)));
        ctx.hubs
            .register(&sid, ConnectionId::new(), RecordingChannel::open(), json!({}));
        ctx.gateway.session_emptied(&sid);

        assert_eq!(ctx.lifecycle.get(&sid).unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn transport_error_flags_session_and_removes_connection() {
        let ctx = context(vec![]);
        let (id, channel) = connect(&ctx, "S");
        channel.set_state(ChannelState::Closed);
        ctx.gateway.on_error(&id, "reset by peer");

        assert_eq!(
            ctx.lifecycle.get(&SessionId::from_raw("S")).unwrap().status,
            SessionStatus::Error
        );
        assert_eq!(ctx.hubs.connection_count(), 0);
    }

    #[tokio::test]
    async fn suggestions_fall_back_without_backend() {
        let ctx = context(vec![]);
        let list = ctx.gateway.suggestions(&SessionId::from_raw("S")).await.unwrap();
        assert_eq!(list, overwatch_engine::FALLBACK_SUGGESTIONS);
        assert!(matches!(
            ctx.gateway.suggestions(&SessionId::from_raw(" ")).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn session_status_includes_connection_count() {
        let ctx = context(vec![]);
        connect(&ctx, "S");
        let status = ctx.gateway.session_status(&SessionId::from_raw("S")).unwrap();
        assert_eq!(status["status"], "active");
        assert_eq!(status["activeConnections"], 1);
        assert!(matches!(
            ctx.gateway.session_status(&SessionId::from_raw("missing")),
            Err(GatewayError::NotFound(_))
        ));
    }
}
