use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use overwatch_core::ids::{EventId, InterventionId, PolicyId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::policies::PolicyAction;
use crate::row_helpers;

/// One fired policy's verdict for one event (or a manual instruction).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionRow {
    pub id: InterventionId,
    pub session_id: SessionId,
    pub rule_id: PolicyId,
    pub event_id: Option<EventId>,
    pub fired_at: String,
    pub decision: PolicyAction,
    pub reasoning: Option<String>,
    pub instruction: Option<String>,
    pub delivered: bool,
    pub result: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct NewIntervention {
    pub session_id: SessionId,
    pub rule_id: PolicyId,
    pub event_id: Option<EventId>,
    pub decision: PolicyAction,
    pub reasoning: Option<String>,
    pub instruction: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct InterventionUpdate {
    pub delivered: Option<bool>,
    pub result: Option<Value>,
}

const INTERVENTION_COLUMNS: &str =
    "id, session_id, rule_id, event_id, fired_at, decision, reasoning, instruction, delivered, result";

pub struct InterventionRepo {
    db: Database,
}

impl InterventionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new, undelivered intervention. A second row for the same
    /// `(event_id, rule_id)` is a `Conflict`.
    #[instrument(skip(self, new), fields(session_id = %new.session_id, policy_id = %new.rule_id))]
    pub fn create(&self, new: &NewIntervention) -> Result<InterventionRow, StoreError> {
        let id = InterventionId::new();
        let fired_at = overwatch_core::timestamp_now();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO interventions (id, session_id, rule_id, event_id, fired_at, decision, reasoning, instruction, delivered, result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL)",
                rusqlite::params![
                    id.as_str(),
                    new.session_id.as_str(),
                    new.rule_id.as_str(),
                    new.event_id.as_ref().map(|e| e.as_str()),
                    fired_at,
                    new.decision.as_str(),
                    new.reasoning,
                    new.instruction,
                ],
            )?;
            Ok(())
        })?;

        Ok(InterventionRow {
            id,
            session_id: new.session_id.clone(),
            rule_id: new.rule_id.clone(),
            event_id: new.event_id.clone(),
            fired_at,
            decision: new.decision,
            reasoning: new.reasoning.clone(),
            instruction: new.instruction.clone(),
            delivered: false,
            result: None,
        })
    }

    #[instrument(skip(self), fields(intervention_id = %id))]
    pub fn get(&self, id: &InterventionId) -> Result<InterventionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_intervention(row),
                None => Err(StoreError::NotFound(format!("intervention {id}"))),
            }
        })
    }

    /// Interventions for a session in firing order, optionally capped to the most recent `limit`.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_by_session(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
    ) -> Result<Vec<InterventionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM (
                    SELECT {INTERVENTION_COLUMNS} FROM interventions
                    WHERE session_id = ?1 ORDER BY fired_at DESC, id DESC LIMIT ?2
                 ) ORDER BY fired_at ASC, id ASC"
            ))?;
            let cap: i64 = limit.map(i64::from).unwrap_or(-1);
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), cap])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_intervention(row)?);
            }
            Ok(results)
        })
    }

    /// Apply a partial update and return the resulting row.
    #[instrument(skip(self, update), fields(intervention_id = %id))]
    pub fn update(
        &self,
        id: &InterventionId,
        update: &InterventionUpdate,
    ) -> Result<InterventionRow, StoreError> {
        let result = update
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE interventions SET
                    delivered = COALESCE(?1, delivered),
                    result = COALESCE(?2, result)
                 WHERE id = ?3",
                rusqlite::params![update.delivered, result, id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("intervention {id}")));
        }
        self.get(id)
    }
}

fn row_to_intervention(row: &rusqlite::Row<'_>) -> Result<InterventionRow, StoreError> {
    let decision_str: String = row_helpers::get(row, 5, "interventions", "decision")?;
    let result_str: Option<String> = row_helpers::get_opt(row, 9, "interventions", "result")?;

    Ok(InterventionRow {
        id: InterventionId::from_raw(row_helpers::get::<String>(row, 0, "interventions", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "interventions", "session_id")?),
        rule_id: PolicyId::from_raw(row_helpers::get::<String>(row, 2, "interventions", "rule_id")?),
        event_id: row_helpers::get_opt::<String>(row, 3, "interventions", "event_id")?
            .map(EventId::from_raw),
        fired_at: row_helpers::get(row, 4, "interventions", "fired_at")?,
        decision: row_helpers::parse_enum(&decision_str, "interventions", "decision")?,
        reasoning: row_helpers::get_opt(row, 6, "interventions", "reasoning")?,
        instruction: row_helpers::get_opt(row, 7, "interventions", "instruction")?,
        delivered: row_helpers::get(row, 8, "interventions", "delivered")?,
        result: result_str
            .map(|r| row_helpers::parse_json(&r, "interventions", "result"))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventRepo, NewEvent};
    use crate::sessions::{NewSession, SessionRepo};
    use serde_json::json;

    struct Fixture {
        repo: InterventionRepo,
        session_id: SessionId,
        event_id: EventId,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone())
            .create(&NewSession::active(SessionId::new()))
            .unwrap();
        let event = EventRepo::new(db.clone())
            .append(&NewEvent {
                session_id: session.id.clone(),
                event_type: "command".into(),
                level: None,
                payload: json!({"code": "import workers-ai"}),
                tags: vec![],
            })
            .unwrap();
        Fixture {
            repo: InterventionRepo::new(db),
            session_id: session.id,
            event_id: event.id,
        }
    }

    fn new_for(f: &Fixture, rule: &str, event: Option<EventId>) -> NewIntervention {
        NewIntervention {
            session_id: f.session_id.clone(),
            rule_id: PolicyId::from_raw(rule),
            event_id: event,
            decision: PolicyAction::Warn,
            reasoning: Some("automated policy enforcement".into()),
            instruction: Some("Use the approved SDK".into()),
        }
    }

    #[test]
    fn create_starts_undelivered() {
        let f = setup();
        let row = f.repo.create(&new_for(&f, "p1", Some(f.event_id.clone()))).unwrap();
        assert!(!row.delivered);
        assert!(row.result.is_none());
        assert_eq!(f.repo.get(&row.id).unwrap(), row);
    }

    #[test]
    fn one_row_per_event_and_rule() {
        let f = setup();
        f.repo.create(&new_for(&f, "p1", Some(f.event_id.clone()))).unwrap();
        let dup = f.repo.create(&new_for(&f, "p1", Some(f.event_id.clone())));
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
        // Different rule on the same event is fine
        f.repo.create(&new_for(&f, "p2", Some(f.event_id.clone()))).unwrap();
    }

    #[test]
    fn manual_rows_without_event_do_not_collide() {
        let f = setup();
        f.repo.create(&new_for(&f, "manual-intervention", None)).unwrap();
        f.repo.create(&new_for(&f, "manual-intervention", None)).unwrap();
        assert_eq!(f.repo.list_by_session(&f.session_id, None).unwrap().len(), 2);
    }

    #[test]
    fn acknowledge_overwrites_result_in_place() {
        let f = setup();
        let row = f.repo.create(&new_for(&f, "p1", Some(f.event_id.clone()))).unwrap();

        let first = f
            .repo
            .update(
                &row.id,
                &InterventionUpdate {
                    delivered: Some(true),
                    result: Some(json!({"status": "applied"})),
                },
            )
            .unwrap();
        assert!(first.delivered);
        assert_eq!(first.result.as_ref().unwrap()["status"], "applied");

        let second = f
            .repo
            .update(
                &row.id,
                &InterventionUpdate {
                    delivered: Some(true),
                    result: Some(json!({"status": "ignored"})),
                },
            )
            .unwrap();
        assert_eq!(second.result.as_ref().unwrap()["status"], "ignored");
        assert_eq!(f.repo.list_by_session(&f.session_id, None).unwrap().len(), 1);
    }

    #[test]
    fn update_missing_is_not_found() {
        let f = setup();
        let err = f
            .repo
            .update(&InterventionId::from_raw("int_missing"), &InterventionUpdate::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_by_session_limit_keeps_most_recent_in_order() {
        let f = setup();
        for i in 0..4 {
            f.repo.create(&new_for(&f, &format!("p{i}"), None)).unwrap();
        }
        let last_two = f.repo.list_by_session(&f.session_id, Some(2)).unwrap();
        let rules: Vec<&str> = last_two.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(rules, vec!["p2", "p3"]);
    }
}
