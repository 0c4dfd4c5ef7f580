use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use overwatch_core::ids::SessionId;
use overwatch_store::{EventRow, EventStore, PolicyRow, PolicyStore};

use crate::condition::serialize_payload;
use crate::generator::InstructionGenerator;
use crate::text::{find_json_value, sanitize};

pub const FALLBACK_SUGGESTIONS: [&str; 3] = [
    "Review recent errors in this session before continuing.",
    "Run the project's test suite to confirm recent changes.",
    "Check active policies for guidance relevant to your current task.",
];

const RECENT_EVENTS: u32 = 10;
const MAX_SUGGESTIONS: usize = 3;
const MAX_SUGGESTION_CHARS: usize = 280;
const PAYLOAD_PREVIEW_CHARS: usize = 200;

/// Read-only advisory: a few next-step hints for a session, derived from its
/// recent events and the active policies.
pub struct SuggestionAdvisor {
    events: Arc<dyn EventStore>,
    policies: Arc<dyn PolicyStore>,
    generator: Arc<InstructionGenerator>,
}

impl SuggestionAdvisor {
    pub fn new(events: Arc<dyn EventStore>, policies: Arc<dyn PolicyStore>, generator: Arc<InstructionGenerator>) -> Self {
        Self {
            events,
            policies,
            generator,
        }
    }

    /// Never fails; any problem yields [`FALLBACK_SUGGESTIONS`].
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn suggestions(&self, session_id: &SessionId) -> Vec<String> {
        match self.try_suggestions(session_id).await {
            Some(list) => list,
            None => fallback(),
        }
    }

    async fn try_suggestions(&self, session_id: &SessionId) -> Option<Vec<String>> {
        let events = self
            .events
            .events_by_session(session_id, RECENT_EVENTS)
            .map_err(|e| warn!(error = %e, "could not read recent events for suggestions"))
            .ok()?;
        let policies = self
            .policies
            .active_policies()
            .map_err(|e| warn!(error = %e, "could not read policies for suggestions"))
            .ok()?;

        let prompt = build_prompt(&events, &policies);
        let text = self
            .generator
            .complete_bounded(&prompt)
            .await
            .map_err(|e| debug!(error_kind = e.error_kind(), error = %e, "suggestion backend failed"))
            .ok()?;

        let list = parse_suggestions(&text);
        if list.is_empty() {
            debug!("backend returned no usable suggestions");
            return None;
        }
        Some(list)
    }
}

fn fallback() -> Vec<String> {
    FALLBACK_SUGGESTIONS.iter().map(|s| s.to_string()).collect()
}

fn build_prompt(events: &[EventRow], policies: &[PolicyRow]) -> String {
    let mut prompt = String::from(
        "You advise an AI coding agent working inside an IDE. Based on its recent activity \
         and the team's policies, suggest up to three short next steps.\n\nRecent events (newest first):\n",
    );
    if events.is_empty() {
        prompt.push_str("- none\n");
    }
    for e in events {
        let payload = sanitize(&serialize_payload(&e.payload), PAYLOAD_PREVIEW_CHARS);
        let level = e.level.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
        let _ = writeln!(prompt, "- [{}] {} ({level}): {payload}", e.timestamp, e.event_type);
    }

    prompt.push_str("\nActive policies:\n");
    if policies.is_empty() {
        prompt.push_str("- none\n");
    }
    for p in policies.iter().filter(|p| p.active) {
        let _ = writeln!(prompt, "- {} [{}]: {}", p.name, p.action, p.description);
    }

    prompt.push_str("\nReply with a JSON array of strings, nothing else.");
    prompt
}

/// Accepts `["a", "b"]` or `{"suggestions": ["a", "b"]}` anywhere in the text.
pub fn parse_suggestions(text: &str) -> Vec<String> {
    let found = find_json_value(text, |v| match v {
        Value::Array(_) => true,
        Value::Object(map) => map.get("suggestions").is_some_and(Value::is_array),
        _ => false,
    });

    let items = match found {
        Some(Value::Array(items)) => items,
        Some(Value::Object(mut map)) => match map.remove("suggestions") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(Value::as_str)
        .map(|s| sanitize(s, MAX_SUGGESTION_CHARS))
        .filter(|s| !s.is_empty())
        .take(MAX_SUGGESTIONS)
        .collect()
}
