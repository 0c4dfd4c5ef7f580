#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Every attempt to read the active policy set failed; evaluation of this event is aborted.
    #[error("policy fetch failed after {attempts} attempt(s): {reason}")]
    PolicyFetch { attempts: u32, reason: String },
}
