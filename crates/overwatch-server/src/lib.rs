pub mod connection;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod hub;
pub mod lifecycle;
pub mod maintenance;
pub mod rpc;
pub mod server;

pub use error::GatewayError;
pub use gateway::{Gateway, LogEventRequest, LogEventResult};
pub use hub::{Channel, ChannelError, ChannelState, HubRegistry, SessionHub};
pub use lifecycle::{LifecycleManager, Signal};
pub use server::{start, AppState, ServerConfig, ServerHandle};

#[cfg(test)]
pub(crate) mod test_support;
