pub mod anthropic;
pub mod reliable;
pub mod unavailable;

pub mod mock;

pub use anthropic::AnthropicBackend;
pub use reliable::{ReliableBackend, ReliableConfig};
pub use unavailable::UnavailableBackend;
