//! In-memory fakes for the store traits.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use overwatch_core::ids::{EventId, InterventionId, PolicyId, SessionId};
use overwatch_store::{
    EventRow, EventStore, InterventionRow, InterventionStore, InterventionUpdate, NewEvent, NewIntervention,
    PolicyAction, PolicyRow, PolicyStore, StoreError,
};

pub fn event(payload: Value) -> EventRow {
    EventRow {
        id: EventId::new(),
        session_id: SessionId::from_raw("sess-test"),
        timestamp: overwatch_core::timestamp_now(),
        event_type: "command".into(),
        level: None,
        payload,
        tags: vec![],
    }
}

pub fn policy(condition: &str, description: &str) -> PolicyRow {
    PolicyRow {
        id: PolicyId::new(),
        name: "test-policy".into(),
        description: description.into(),
        active: true,
        condition: condition.into(),
        action: PolicyAction::Warn,
        prompt_template: None,
    }
}

#[derive(Default)]
pub struct FakePolicies {
    pub rows: Mutex<Vec<PolicyRow>>,
    /// Number of upcoming `active_policies` calls that fail.
    pub failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FakePolicies {
    pub fn with(rows: Vec<PolicyRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Default::default()
        }
    }
}

impl PolicyStore for FakePolicies {
    fn active_policies(&self) -> Result<Vec<PolicyRow>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database("policy store offline".into()));
        }
        Ok(self.rows.lock().clone())
    }

    fn get_policy(&self, id: &PolicyId) -> Result<PolicyRow, StoreError> {
        self.rows
            .lock()
            .iter()
            .find(|p| &p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("policy {id}")))
    }
}

#[derive(Default)]
pub struct FakeInterventions {
    pub rows: Mutex<Vec<InterventionRow>>,
    /// Rule ids whose inserts fail.
    pub reject_rules: Mutex<Vec<PolicyId>>,
}

impl InterventionStore for FakeInterventions {
    fn create_intervention(&self, new: &NewIntervention) -> Result<InterventionRow, StoreError> {
        if self.reject_rules.lock().contains(&new.rule_id) {
            return Err(StoreError::Database("disk full".into()));
        }
        let mut rows = self.rows.lock();
        let duplicate = new.event_id.is_some()
            && rows
                .iter()
                .any(|r| r.event_id == new.event_id && r.rule_id == new.rule_id);
        if duplicate {
            return Err(StoreError::Conflict("intervention exists".into()));
        }
        let row = InterventionRow {
            id: InterventionId::new(),
            session_id: new.session_id.clone(),
            rule_id: new.rule_id.clone(),
            event_id: new.event_id.clone(),
            fired_at: overwatch_core::timestamp_now(),
            decision: new.decision,
            reasoning: new.reasoning.clone(),
            instruction: new.instruction.clone(),
            delivered: false,
            result: None,
        };
        rows.push(row.clone());
        Ok(row)
    }

    fn get_intervention(&self, id: &InterventionId) -> Result<InterventionRow, StoreError> {
        self.rows
            .lock()
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("intervention {id}")))
    }

    fn interventions_by_session(&self, id: &SessionId, _limit: Option<u32>) -> Result<Vec<InterventionRow>, StoreError> {
        Ok(self.rows.lock().iter().filter(|r| &r.session_id == id).cloned().collect())
    }

    fn update_intervention(&self, id: &InterventionId, update: &InterventionUpdate) -> Result<InterventionRow, StoreError> {
        let mut rows = self.rows.lock();
        let row = rows
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("intervention {id}")))?;
        if let Some(delivered) = update.delivered {
            row.delivered = delivered;
        }
        if let Some(result) = &update.result {
            row.result = Some(result.clone());
        }
        Ok(row.clone())
    }
}

#[derive(Default)]
pub struct FakeEvents {
    pub rows: Mutex<Vec<EventRow>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl EventStore for FakeEvents {
    fn create_event(&self, new: &NewEvent) -> Result<EventRow, StoreError> {
        let row = EventRow {
            id: EventId::new(),
            session_id: new.session_id.clone(),
            timestamp: overwatch_core::timestamp_now(),
            event_type: new.event_type.clone(),
            level: new.level,
            payload: new.payload.clone(),
            tags: new.tags.clone(),
        };
        self.rows.lock().push(row.clone());
        Ok(row)
    }

    fn events_by_session(&self, id: &SessionId, limit: u32) -> Result<Vec<EventRow>, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Database("events offline".into()));
        }
        Ok(self
            .rows
            .lock()
            .iter()
            .rev()
            .filter(|e| &e.session_id == id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
