use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use overwatch_core::ids::{ConnectionId, SessionId};

use crate::gateway::Gateway;
use crate::hub::{Channel, ChannelError, ChannelState};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub max_send_queue: usize,
    pub ping_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_send_queue: 256,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Hub-facing half of a WebSocket: a bounded queue drained by the writer task.
pub struct WsChannel {
    tx: mpsc::Sender<String>,
    state: AtomicU8,
}

impl WsChannel {
    pub fn new(max_send_queue: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(max_send_queue.max(1));
        let channel = Arc::new(Self {
            tx,
            state: AtomicU8::new(OPEN),
        });
        (channel, rx)
    }

    pub fn set_state(&self, state: ChannelState) {
        let raw = match state {
            ChannelState::Open => OPEN,
            ChannelState::Closing => CLOSING,
            ChannelState::Closed => CLOSED,
        };
        self.state.store(raw, Ordering::Release);
    }
}

impl Channel for WsChannel {
    fn send(&self, message: String) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    fn state(&self) -> ChannelState {
        match self.state.load(Ordering::Acquire) {
            OPEN => ChannelState::Open,
            CLOSING => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

enum Disconnect {
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Drive one WebSocket for its whole life: register with the gateway,
/// forward frames in both directions, then report how it ended.
pub async fn handle_ws_connection(
    socket: WebSocket,
    session_id: SessionId,
    metadata: Value,
    gateway: Arc<Gateway>,
    config: ConnectionConfig,
) {
    let connection_id = ConnectionId::new();
    let (channel, rx) = WsChannel::new(config.max_send_queue);

    if let Err(e) = gateway.on_connect(&session_id, &connection_id, channel.clone(), metadata) {
        warn!(session_id = %session_id, error = %e, "rejecting connection");
        return;
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, connection_id.clone(), config.ping_interval));

    let reader = async {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => gateway.on_message(&connection_id, text.as_str()).await,
                Ok(WsMessage::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(f.code), f.reason.as_str().to_string()),
                        None => (None, String::new()),
                    };
                    return Disconnect::Closed { code, reason };
                }
                Ok(WsMessage::Binary(_)) => {
                    debug!(connection_id = %connection_id, "ignoring binary frame");
                }
                Ok(_) => {}
                Err(e) => return Disconnect::Error(e.to_string()),
            }
        }
        Disconnect::Closed {
            code: None,
            reason: "stream ended".into(),
        }
    };

    let outcome = tokio::select! {
        outcome = reader => outcome,
        finished = &mut writer => match finished {
            Ok(Some(error)) => Disconnect::Error(error),
            _ => Disconnect::Closed { code: None, reason: "writer stopped".into() },
        },
    };

    channel.set_state(ChannelState::Closed);
    writer.abort();

    match outcome {
        Disconnect::Closed { code, reason } => gateway.on_close(&connection_id, code, &reason),
        Disconnect::Error(error) => gateway.on_error(&connection_id, &error),
    }
    info!(session_id = %session_id, connection_id = %connection_id, "connection finished");
}

/// Forward queued messages and keep the socket alive with pings.
/// Returns the send error that stopped it, if any.
async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
    connection_id: ConnectionId,
    ping_interval: Duration,
) -> Option<String> {
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(text) = msg else { return None };
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    return Some(e.to_string());
                }
            }
            _ = ping.tick() => {
                if let Err(e) = ws_tx.send(WsMessage::Ping(Vec::new().into())).await {
                    return Some(e.to_string());
                }
                trace!(connection_id = %connection_id, "sent ping");
            }
        }
    }
}
