use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use overwatch_core::{BackendError, CompletionBackend};

const MESSAGES_PATH: &str = "/v1/messages";
const API_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Anthropic Messages API client: one user turn in, concatenated text blocks out.
pub struct AnthropicBackend {
    client: Client,
    api_key: SecretString,
    model: String,
    url: String,
}

impl AnthropicBackend {
    pub fn new(api_key: SecretString, model: impl Into<String>, base_url: &str) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("http client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model: model.into(),
            url: format!("{}{MESSAGES_PATH}", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Request body for a single-turn completion.
pub fn build_body(model: &str, prompt: &str, max_tokens: u32) -> Value {
    json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": [{ "role": "user", "content": prompt }],
    })
}

/// Concatenate the `text` blocks of a Messages API response.
pub fn extract_text(body: &Value) -> Result<String, BackendError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::MalformedResponse("missing content array".into()))?;

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();

    if text.is_empty() {
        return Err(BackendError::MalformedResponse("no text content".into()));
    }
    Ok(text)
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&build_body(&self.model, prompt, max_tokens))
            .send()
            .await
            .map_err(|e| BackendError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let hint = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(match BackendError::from_status(status, body) {
                BackendError::RateLimited { .. } => BackendError::RateLimited { retry_after: hint },
                other => other,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        let text = extract_text(&body)?;
        debug!(chars = text.len(), "completion received");
        Ok(text)
    }
}
