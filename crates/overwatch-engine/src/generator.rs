use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use overwatch_core::{BackendError, CompletionBackend};
use overwatch_store::{EventRow, PolicyRow};

use crate::condition::serialize_payload;
use crate::text::{find_json_value, sanitize};

pub const FALLBACK_REASONING: &str = "automated policy enforcement";

const DEFAULT_PROMPT: &str = "\
You are a guardrail for an AI coding agent working inside an IDE.
The policy \"{{policy.name}}\" ({{policy.action}}) matched the agent's latest activity.

Policy description: {{policy.description}}
Event type: {{event.type}}
Event level: {{event.level}}
Event payload: {{event.payload}}

Reply with a single JSON object of the form
{\"instruction\": \"<what the agent should do next>\", \"reasoning\": \"<one sentence explaining why>\"}";

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub timeout: Duration,
    pub max_tokens: u32,
    pub max_output_chars: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_tokens: 512,
            max_output_chars: 2000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionSource {
    Generated,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedInstruction {
    pub instruction: String,
    pub reasoning: String,
    pub source: InstructionSource,
}

/// Turns a fired policy into client-facing text. Backend failures of any
/// kind (error, timeout, panic, unusable output) fall back to deterministic
/// text derived from the policy itself.
pub struct InstructionGenerator {
    backend: Arc<dyn CompletionBackend>,
    config: GeneratorConfig,
}

impl InstructionGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: GeneratorConfig) -> Self {
        Self { backend, config }
    }

    pub async fn generate(&self, policy: &PolicyRow, event: &EventRow) -> GeneratedInstruction {
        let prompt = render_prompt(policy, event);

        let parsed = match self.complete_bounded(&prompt).await {
            Ok(text) => parse_response(&text),
            Err(e) => {
                warn!(
                    policy_id = %policy.id,
                    event_id = %event.id,
                    backend = self.backend.name(),
                    error_kind = e.error_kind(),
                    error = %e,
                    "instruction generation failed, using fallback"
                );
                ParsedResponse::default()
            }
        };

        let source = if parsed.instruction.is_some() || parsed.reasoning.is_some() {
            InstructionSource::Generated
        } else {
            InstructionSource::Fallback
        };

        let instruction = parsed.instruction.unwrap_or_else(|| fallback_instruction(policy));
        let reasoning = parsed.reasoning.unwrap_or_else(|| FALLBACK_REASONING.to_string());
        let max = self.config.max_output_chars;

        let mut out = GeneratedInstruction {
            instruction: sanitize(&instruction, max),
            reasoning: sanitize(&reasoning, max),
            source,
        };
        // Sanitizing can empty a generated field.
        if out.instruction.is_empty() {
            out.instruction = sanitize(&fallback_instruction(policy), max);
        }
        if out.reasoning.is_empty() {
            out.reasoning = FALLBACK_REASONING.to_string();
        }
        debug!(policy_id = %policy.id, source = ?out.source, "instruction ready");
        out
    }

    /// Run one completion under the configured timeout, converting a panic
    /// inside the backend future into an error.
    pub async fn complete_bounded(&self, prompt: &str) -> Result<String, BackendError> {
        let call = AssertUnwindSafe(self.backend.complete(prompt, self.config.max_tokens)).catch_unwind();
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(BackendError::MalformedResponse("backend panicked".into())),
            Err(_) => Err(BackendError::Timeout(self.config.timeout)),
        }
    }
}

/// Substitute `{{policy.*}}` and `{{event.*}}` placeholders into the policy's
/// template, or the default prompt when it has none.
pub fn render_prompt(policy: &PolicyRow, event: &EventRow) -> String {
    let template = policy
        .prompt_template
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_PROMPT);

    let level = event.level.map(|l| l.to_string()).unwrap_or_default();
    template
        .replace("{{policy.name}}", &policy.name)
        .replace("{{policy.description}}", &policy.description)
        .replace("{{policy.action}}", policy.action.as_str())
        .replace("{{event.type}}", &event.event_type)
        .replace("{{event.level}}", &level)
        .replace("{{event.payload}}", &serialize_payload(&event.payload))
}

pub fn fallback_instruction(policy: &PolicyRow) -> String {
    if policy.description.trim().is_empty() {
        policy.name.clone()
    } else {
        policy.description.clone()
    }
}

#[derive(Debug, Default, PartialEq)]
struct ParsedResponse {
    instruction: Option<String>,
    reasoning: Option<String>,
}

fn parse_response(text: &str) -> ParsedResponse {
    let Some(obj) = find_json_value(text, Value::is_object) else {
        return ParsedResponse::default();
    };
    ParsedResponse {
        instruction: string_field(&obj, "instruction").or_else(|| string_field(&obj, "fixPrompt")),
        reasoning: string_field(&obj, "reasoning").or_else(|| string_field(&obj, "humanReadable")),
    }
}

fn string_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}
