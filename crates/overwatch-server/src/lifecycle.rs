//! Session state machine.
//!
//! `ended` is terminal and only reached through [`LifecycleManager::end_session`];
//! inactivity never goes further than `idle`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use overwatch_core::ids::SessionId;
use overwatch_store::{NewSession, SessionRow, SessionStatus, SessionStore, SessionUpdate, StoreError};

const CAS_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Heartbeat,
    EventLogged,
    Connected,
    /// Explicit start call on an existing session.
    Started,
    LastConnectionClosed,
    Stale,
    TransportError,
    End,
}

impl Signal {
    fn marks_activity(self) -> bool {
        matches!(self, Self::Heartbeat | Self::EventLogged | Self::Connected | Self::Started)
    }
}

/// Next status for `signal`, or `None` when the signal does not apply.
pub fn transition(current: SessionStatus, signal: Signal) -> Option<SessionStatus> {
    use SessionStatus::{Active, Ended, Error, Idle};

    match (current, signal) {
        (_, Signal::End) => Some(Ended),
        (Ended, _) => None,
        (Active | Idle, Signal::Heartbeat | Signal::EventLogged | Signal::Connected) => Some(Active),
        (Active | Idle | Error, Signal::Started) => Some(Active),
        (Active, Signal::LastConnectionClosed | Signal::Stale) => Some(Idle),
        (Active | Idle | Error, Signal::TransportError) => Some(Error),
        _ => None,
    }
}

/// Optional fields for [`LifecycleManager::start_session`].
#[derive(Clone, Debug, Default)]
pub struct StartSession {
    pub session_id: Option<SessionId>,
    pub project_path: Option<String>,
    pub user_id: Option<String>,
    pub agent_profile: Option<Value>,
    pub metadata: Option<Value>,
}

pub struct LifecycleManager {
    sessions: Arc<dyn SessionStore>,
    staleness: Duration,
}

impl LifecycleManager {
    pub fn new(sessions: Arc<dyn SessionStore>, staleness: Duration) -> Self {
        Self { sessions, staleness }
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.sessions.get_session(id)
    }

    /// Create a session, or reactivate and update an existing one.
    #[instrument(skip(self, req))]
    pub fn start_session(&self, req: StartSession) -> Result<SessionRow, StoreError> {
        let id = req.session_id.filter(|id| !id.is_empty()).unwrap_or_default();
        let new = NewSession {
            id: id.clone(),
            user_id: req.user_id.clone(),
            project_path: req.project_path.clone(),
            status: SessionStatus::Active,
            agent_profile: req.agent_profile.clone().unwrap_or_else(empty_object),
            metadata: req.metadata.clone().unwrap_or_else(empty_object),
        };

        match self.sessions.create_session(&new) {
            Ok(row) => {
                info!(session_id = %row.id, "session started");
                Ok(row)
            }
            Err(StoreError::Conflict(_)) => {
                let update = SessionUpdate {
                    user_id: req.user_id,
                    project_path: req.project_path,
                    agent_profile: req.agent_profile,
                    metadata: req.metadata,
                    last_seen_at: None,
                };
                self.sessions.update_session(&id, &update)?;
                self.apply(&id, Signal::Started, Utc::now())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a session, registering it as active if it does not exist yet.
    pub fn ensure_session(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        match self.sessions.get_session(id) {
            Ok(row) => Ok(row),
            Err(StoreError::NotFound(_)) => {
                debug!(session_id = %id, "auto-registering unknown session");
                match self.sessions.create_session(&NewSession::active(id.clone())) {
                    // Lost a race with another registration.
                    Err(StoreError::Conflict(_)) => self.sessions.get_session(id),
                    other => other,
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn heartbeat(&self, id: &SessionId, metadata: Option<Value>) -> Result<SessionRow, StoreError> {
        self.ensure_session(id)?;
        if let Some(metadata) = metadata {
            self.sessions.update_session(
                id,
                &SessionUpdate {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )?;
        }
        self.apply(id, Signal::Heartbeat, Utc::now())
    }

    #[instrument(skip(self))]
    pub fn end_session(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        let row = self.apply(id, Signal::End, Utc::now())?;
        info!(session_id = %id, "session ended");
        Ok(row)
    }

    /// Apply a signal observed at `at`: activity signals move `last_seen_at`
    /// forward, then the status changes if the transition table allows it.
    pub fn apply(&self, id: &SessionId, signal: Signal, at: DateTime<Utc>) -> Result<SessionRow, StoreError> {
        let mut row = self.sessions.get_session(id)?;
        if signal.marks_activity() && row.status != SessionStatus::Ended {
            row = self
                .sessions
                .update_session(id, &SessionUpdate::seen_at(overwatch_core::format_timestamp(at)))?;
        }

        for _ in 0..CAS_ATTEMPTS {
            let Some(next) = transition(row.status, signal) else {
                return Ok(row);
            };
            if next == row.status {
                return Ok(row);
            }
            if self.sessions.compare_and_set_status(id, row.status, next)? {
                debug!(session_id = %id, from = %row.status, to = %next, ?signal, "session transition");
                row.status = next;
                return Ok(row);
            }
            row = self.sessions.get_session(id)?;
        }

        warn!(session_id = %id, ?signal, "session status kept changing, giving up transition");
        Ok(row)
    }

    /// Apply a signal, logging instead of failing. For paths where the
    /// session bookkeeping must not break the caller.
    pub fn signal(&self, id: &SessionId, signal: Signal) -> Option<SessionStatus> {
        match self.apply(id, signal, Utc::now()) {
            Ok(row) => Some(row.status),
            Err(e) => {
                warn!(session_id = %id, ?signal, error = %e, "session transition failed");
                None
            }
        }
    }

    /// Move every active session not seen within the staleness threshold to idle.
    #[instrument(skip(self))]
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>, StoreError> {
        let staleness = chrono::Duration::from_std(self.staleness).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(staleness).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let moved = self.sessions.mark_stale(&overwatch_core::format_timestamp(cutoff))?;
        if !moved.is_empty() {
            info!(count = moved.len(), "stale sessions moved to idle");
        }
        Ok(moved)
    }
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}
