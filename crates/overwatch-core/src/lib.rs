pub mod backend;
pub mod envelope;
pub mod errors;
pub mod ids;

pub use backend::CompletionBackend;
pub use envelope::{Envelope, OutboundKind};
pub use errors::BackendError;

/// Current time as a fixed-width RFC 3339 UTC string (millisecond precision, `Z` suffix).
///
/// Every persisted timestamp uses this format so lexical order matches chronological order.
pub fn timestamp_now() -> String {
    format_timestamp(chrono::Utc::now())
}

/// Format an instant in the canonical persisted form.
pub fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
