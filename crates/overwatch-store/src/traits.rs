//! Collaborator interfaces consumed by the engine and gateway.
//!
//! The SQLite repos implement these; tests substitute in-memory fakes.
//! Calls are synchronous; async callers run them on the blocking pool when
//! they need a timeout.

use std::sync::Arc;

use overwatch_core::ids::{InterventionId, PolicyId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::events::{EventRepo, EventRow, NewEvent};
use crate::interventions::{InterventionRepo, InterventionRow, InterventionUpdate, NewIntervention};
use crate::policies::{PolicyRepo, PolicyRow};
use crate::sessions::{NewSession, SessionRepo, SessionRow, SessionStatus, SessionUpdate};

pub trait PolicyStore: Send + Sync {
    fn active_policies(&self) -> Result<Vec<PolicyRow>, StoreError>;
    fn get_policy(&self, id: &PolicyId) -> Result<PolicyRow, StoreError>;
}

pub trait SessionStore: Send + Sync {
    fn create_session(&self, new: &NewSession) -> Result<SessionRow, StoreError>;
    fn get_session(&self, id: &SessionId) -> Result<SessionRow, StoreError>;
    fn update_session(&self, id: &SessionId, update: &SessionUpdate) -> Result<SessionRow, StoreError>;
    fn compare_and_set_status(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        new: SessionStatus,
    ) -> Result<bool, StoreError>;
    fn mark_stale(&self, cutoff: &str) -> Result<Vec<SessionId>, StoreError>;
}

pub trait EventStore: Send + Sync {
    fn create_event(&self, new: &NewEvent) -> Result<EventRow, StoreError>;
    /// Newest first.
    fn events_by_session(&self, id: &SessionId, limit: u32) -> Result<Vec<EventRow>, StoreError>;
}

pub trait InterventionStore: Send + Sync {
    fn create_intervention(&self, new: &NewIntervention) -> Result<InterventionRow, StoreError>;
    fn get_intervention(&self, id: &InterventionId) -> Result<InterventionRow, StoreError>;
    fn interventions_by_session(
        &self,
        id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Vec<InterventionRow>, StoreError>;
    fn update_intervention(
        &self,
        id: &InterventionId,
        update: &InterventionUpdate,
    ) -> Result<InterventionRow, StoreError>;
}

impl PolicyStore for PolicyRepo {
    fn active_policies(&self) -> Result<Vec<PolicyRow>, StoreError> {
        self.list_active()
    }

    fn get_policy(&self, id: &PolicyId) -> Result<PolicyRow, StoreError> {
        self.get(id)
    }
}

impl SessionStore for SessionRepo {
    fn create_session(&self, new: &NewSession) -> Result<SessionRow, StoreError> {
        self.create(new)
    }

    fn get_session(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.get(id)
    }

    fn update_session(&self, id: &SessionId, update: &SessionUpdate) -> Result<SessionRow, StoreError> {
        self.update(id, update)
    }

    fn compare_and_set_status(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        new: SessionStatus,
    ) -> Result<bool, StoreError> {
        SessionRepo::compare_and_set_status(self, id, expected, new)
    }

    fn mark_stale(&self, cutoff: &str) -> Result<Vec<SessionId>, StoreError> {
        SessionRepo::mark_stale(self, cutoff)
    }
}

impl EventStore for EventRepo {
    fn create_event(&self, new: &NewEvent) -> Result<EventRow, StoreError> {
        self.append(new)
    }

    fn events_by_session(&self, id: &SessionId, limit: u32) -> Result<Vec<EventRow>, StoreError> {
        self.list_recent(id, limit)
    }
}

impl InterventionStore for InterventionRepo {
    fn create_intervention(&self, new: &NewIntervention) -> Result<InterventionRow, StoreError> {
        self.create(new)
    }

    fn get_intervention(&self, id: &InterventionId) -> Result<InterventionRow, StoreError> {
        self.get(id)
    }

    fn interventions_by_session(
        &self,
        id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Vec<InterventionRow>, StoreError> {
        self.list_by_session(id, limit)
    }

    fn update_intervention(
        &self,
        id: &InterventionId,
        update: &InterventionUpdate,
    ) -> Result<InterventionRow, StoreError> {
        self.update(id, update)
    }
}

/// The full set of persistence collaborators, shared by reference.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub interventions: Arc<dyn InterventionStore>,
}

impl Stores {
    /// SQLite-backed stores sharing one connection.
    pub fn sqlite(db: &Database) -> Self {
        Self {
            sessions: Arc::new(SessionRepo::new(db.clone())),
            events: Arc::new(EventRepo::new(db.clone())),
            policies: Arc::new(PolicyRepo::new(db.clone())),
            interventions: Arc::new(InterventionRepo::new(db.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::PolicyAction;
    use serde_json::json;

    #[test]
    fn sqlite_stores_share_one_database() {
        let db = Database::in_memory().unwrap();
        let stores = Stores::sqlite(&db);
        PolicyRepo::new(db.clone())
            .upsert(&PolicyRow {
                id: PolicyId::from_raw("p1"),
                name: "sdk".into(),
                description: "Use the approved SDK".into(),
                active: true,
                condition: "payload LIKE '%workers-ai%'".into(),
                action: PolicyAction::Warn,
                prompt_template: None,
            })
            .unwrap();

        let session = stores
            .sessions
            .create_session(&NewSession::active(SessionId::new()))
            .unwrap();
        let event = stores
            .events
            .create_event(&NewEvent {
                session_id: session.id.clone(),
                event_type: "command".into(),
                level: None,
                payload: json!({}),
                tags: vec![],
            })
            .unwrap();

        assert_eq!(stores.policies.active_policies().unwrap().len(), 1);
        assert_eq!(stores.events.events_by_session(&session.id, 10).unwrap()[0].id, event.id);
        assert!(stores
            .sessions
            .compare_and_set_status(&session.id, SessionStatus::Active, SessionStatus::Ended)
            .unwrap());
    }
}
