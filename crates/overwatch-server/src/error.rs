use overwatch_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed inbound call; never reaches the engine.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Store(StoreError),
}

impl GatewayError {
    /// Stable code for `error` envelopes and RPC responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "INVALID_PARAMS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Store(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other),
        }
    }
}
