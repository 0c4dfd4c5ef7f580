use async_trait::async_trait;

use crate::errors::BackendError;

/// A text-generation backend: prompt in, text out.
///
/// Implementations may fail in any of the ways described by [`BackendError`].
/// Callers are responsible for bounding the call with a timeout.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, BackendError>;
}
