use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use overwatch_core::ids::{ConnectionId, SessionId};
use overwatch_core::Envelope;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("send queue full")]
    Full,
    #[error("send failed: {0}")]
    Failed(String),
}

/// Outbound half of one duplex connection. `send` must not block.
pub trait Channel: Send + Sync {
    fn send(&self, message: String) -> Result<(), ChannelError>;
    fn state(&self) -> ChannelState;
}

pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub channel: Arc<dyn Channel>,
    pub connected_at: String,
    pub metadata: Value,
}

/// Live connections of one session. Every mutation and every fan-out goes
/// through this hub's own lock, which is never held across an await.
pub struct SessionHub {
    session_id: SessionId,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
}

impl SessionHub {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn add_connection(&self, id: ConnectionId, channel: Arc<dyn Channel>, metadata: Value) {
        let handle = ConnectionHandle {
            id: id.clone(),
            channel,
            connected_at: overwatch_core::timestamp_now(),
            metadata,
        };
        if self.connections.lock().insert(id.clone(), handle).is_some() {
            warn!(session_id = %self.session_id, connection_id = %id, "replaced existing connection");
        }
    }

    /// Idempotent. Returns whether the connection was present.
    pub fn remove_connection(&self, id: &ConnectionId) -> bool {
        self.connections.lock().remove(id).is_some()
    }

    /// Deliver to every connection. One connection failing (error or panic)
    /// never affects the others. Returns the number of successful sends.
    pub fn broadcast(&self, message: &Envelope) -> usize {
        let text = message.to_json();
        let connections = self.connections.lock();
        let mut delivered = 0;
        for handle in connections.values() {
            if deliver(&self.session_id, handle, &text) {
                delivered += 1;
            }
        }
        debug!(
            session_id = %self.session_id,
            kind = message.kind.as_str(),
            delivered,
            total = connections.len(),
            "broadcast"
        );
        delivered
    }

    pub fn send_to(&self, id: &ConnectionId, message: &Envelope) -> bool {
        let connections = self.connections.lock();
        match connections.get(id) {
            Some(handle) => deliver(&self.session_id, handle, &message.to_json()),
            None => false,
        }
    }

    /// Connections whose channel is still open.
    pub fn active_count(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|h| h.channel.state() == ChannelState::Open)
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Drop connections that are closing or closed.
    pub fn cleanup(&self) -> Vec<ConnectionId> {
        let mut connections = self.connections.lock();
        let dead: Vec<ConnectionId> = connections
            .values()
            .filter(|h| h.channel.state() != ChannelState::Open)
            .map(|h| h.id.clone())
            .collect();
        for id in &dead {
            connections.remove(id);
        }
        dead
    }
}

fn deliver(session_id: &SessionId, handle: &ConnectionHandle, text: &str) -> bool {
    let outcome = catch_unwind(AssertUnwindSafe(|| handle.channel.send(text.to_string())));
    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(session_id = %session_id, connection_id = %handle.id, error = %e, "send failed");
            false
        }
        Err(_) => {
            warn!(session_id = %session_id, connection_id = %handle.id, "send panicked");
            false
        }
    }
}

/// All session hubs, created lazily on first connection.
#[derive(Default)]
pub struct HubRegistry {
    hubs: DashMap<SessionId, Arc<SessionHub>>,
    index: DashMap<ConnectionId, SessionId>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hub(&self, session_id: &SessionId) -> Option<Arc<SessionHub>> {
        self.hubs.get(session_id).map(|h| Arc::clone(h.value()))
    }

    pub fn register(&self, session_id: &SessionId, id: ConnectionId, channel: Arc<dyn Channel>, metadata: Value) {
        // Add while holding the entry so a concurrent cleanup cannot drop the hub in between.
        let hub = self
            .hubs
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionHub::new(session_id.clone())));
        hub.add_connection(id.clone(), channel, metadata);
        drop(hub);
        self.index.insert(id, session_id.clone());
    }

    /// Remove a connection wherever it lives. Returns its session and the
    /// number of connections the session still has.
    pub fn unregister(&self, id: &ConnectionId) -> Option<(SessionId, usize)> {
        let (_, session_id) = self.index.remove(id)?;
        let remaining = match self.hub(&session_id) {
            Some(hub) => {
                hub.remove_connection(id);
                hub.len()
            }
            None => 0,
        };
        self.hubs.remove_if(&session_id, |_, hub| hub.is_empty());
        Some((session_id, remaining))
    }

    pub fn session_of(&self, id: &ConnectionId) -> Option<SessionId> {
        self.index.get(id).map(|s| s.value().clone())
    }

    /// Fan out to one session. A session without a hub reaches nobody.
    pub fn broadcast(&self, session_id: &SessionId, message: &Envelope) -> usize {
        self.hub(session_id).map(|hub| hub.broadcast(message)).unwrap_or(0)
    }

    pub fn send_to(&self, id: &ConnectionId, message: &Envelope) -> bool {
        let Some(session_id) = self.session_of(id) else {
            return false;
        };
        self.hub(&session_id).is_some_and(|hub| hub.send_to(id, message))
    }

    pub fn active_count(&self, session_id: &SessionId) -> usize {
        self.hub(session_id).map(|hub| hub.active_count()).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.hubs.len()
    }

    pub fn connection_count(&self) -> usize {
        self.index.len()
    }

    /// Sweep every hub and drop the ones left empty. Returns the sessions
    /// whose last connection was removed by this sweep.
    pub fn cleanup_all(&self) -> Vec<SessionId> {
        let hubs: Vec<Arc<SessionHub>> = self.hubs.iter().map(|e| Arc::clone(e.value())).collect();
        let mut emptied = Vec::new();

        for hub in hubs {
            let removed = hub.cleanup();
            for id in &removed {
                self.index.remove(id);
            }
            if !removed.is_empty() {
                debug!(session_id = %hub.session_id(), removed = removed.len(), "removed dead connections");
                if hub.is_empty() {
                    emptied.push(hub.session_id().clone());
                }
            }
            self.hubs.remove_if(hub.session_id(), |_, h| h.is_empty());
        }
        emptied
    }
}
