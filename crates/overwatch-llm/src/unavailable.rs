use async_trait::async_trait;

use overwatch_core::{BackendError, CompletionBackend};

/// Backend used when no credentials are configured. Every call fails fast,
/// so callers take their deterministic fallback path.
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CompletionBackend for UnavailableBackend {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn model(&self) -> &str {
        "none"
    }

    async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, BackendError> {
        Err(BackendError::Unavailable(self.reason.clone()))
    }
}
