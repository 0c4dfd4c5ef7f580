use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use overwatch_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Ended,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Ended => write!(f, "ended"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "ended" => Ok(Self::Ended),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: SessionId,
    pub user_id: Option<String>,
    pub project_path: Option<String>,
    pub started_at: String,
    pub last_seen_at: String,
    pub status: SessionStatus,
    pub agent_profile: Value,
    pub metadata: Value,
}

/// Fields for a new session row. `started_at` and `last_seen_at` are stamped on insert.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub id: SessionId,
    pub user_id: Option<String>,
    pub project_path: Option<String>,
    pub status: SessionStatus,
    pub agent_profile: Value,
    pub metadata: Value,
}

impl NewSession {
    pub fn active(id: SessionId) -> Self {
        Self {
            id,
            user_id: None,
            project_path: None,
            status: SessionStatus::Active,
            agent_profile: Value::Object(Default::default()),
            metadata: Value::Object(Default::default()),
        }
    }
}

/// Partial update; `None` leaves a column untouched.
///
/// `last_seen_at` never moves backwards: the stored value becomes the max of
/// the current and supplied timestamps.
#[derive(Clone, Debug, Default)]
pub struct SessionUpdate {
    pub user_id: Option<String>,
    pub project_path: Option<String>,
    pub agent_profile: Option<Value>,
    pub metadata: Option<Value>,
    pub last_seen_at: Option<String>,
}

impl SessionUpdate {
    pub fn seen_at(ts: impl Into<String>) -> Self {
        Self {
            last_seen_at: Some(ts.into()),
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.project_path.is_none()
            && self.agent_profile.is_none()
            && self.metadata.is_none()
            && self.last_seen_at.is_none()
    }
}

const SESSION_COLUMNS: &str =
    "id, user_id, project_path, started_at, last_seen_at, status, agent_profile, metadata";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a session row. An existing id is a `Conflict`.
    #[instrument(skip(self, new), fields(session_id = %new.id))]
    pub fn create(&self, new: &NewSession) -> Result<SessionRow, StoreError> {
        let now = overwatch_core::timestamp_now();
        let agent_profile = serde_json::to_string(&new.agent_profile)?;
        let metadata = serde_json::to_string(&new.metadata)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, project_path, started_at, last_seen_at, status, agent_profile, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    new.id.as_str(),
                    new.user_id,
                    new.project_path,
                    now,
                    now,
                    new.status.to_string(),
                    agent_profile,
                    metadata,
                ],
            )?;

            Ok(SessionRow {
                id: new.id.clone(),
                user_id: new.user_id.clone(),
                project_path: new.project_path.clone(),
                started_at: now.clone(),
                last_seen_at: now,
                status: new.status,
                agent_profile: new.agent_profile.clone(),
                metadata: new.metadata.clone(),
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Apply a partial update and return the resulting row.
    #[instrument(skip(self, update), fields(session_id = %id))]
    pub fn update(&self, id: &SessionId, update: &SessionUpdate) -> Result<SessionRow, StoreError> {
        if !update.is_empty() {
            let mut sets: Vec<&str> = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(v) = &update.user_id {
                sets.push("user_id = ?");
                params.push(Box::new(v.clone()));
            }
            if let Some(v) = &update.project_path {
                sets.push("project_path = ?");
                params.push(Box::new(v.clone()));
            }
            if let Some(v) = &update.agent_profile {
                sets.push("agent_profile = ?");
                params.push(Box::new(serde_json::to_string(v)?));
            }
            if let Some(v) = &update.metadata {
                sets.push("metadata = ?");
                params.push(Box::new(serde_json::to_string(v)?));
            }
            if let Some(v) = &update.last_seen_at {
                sets.push("last_seen_at = MAX(last_seen_at, ?)");
                params.push(Box::new(v.clone()));
            }

            let sql = format!("UPDATE sessions SET {} WHERE id = ?", sets.join(", "));
            params.push(Box::new(id.as_str().to_string()));

            let changed = self.db.with_conn(|conn| {
                let refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
                Ok(conn.execute(&sql, refs.as_slice())?)
            })?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
        }
        self.get(id)
    }

    /// Write `new` only if the stored status is still `expected`.
    /// Returns whether the row changed.
    #[instrument(skip(self), fields(session_id = %id, expected = %expected, new = %new))]
    pub fn compare_and_set_status(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        new: SessionStatus,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = ?1 WHERE id = ?2 AND status = ?3",
                rusqlite::params![new.to_string(), id.as_str(), expected.to_string()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Move every `active` session last seen strictly before `cutoff` to `idle`.
    #[instrument(skip(self))]
    pub fn mark_stale(&self, cutoff: &str) -> Result<Vec<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE status = 'active' AND last_seen_at < ?1 ORDER BY last_seen_at",
            )?;
            let ids = stmt
                .query_map([cutoff], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut moved = Vec::with_capacity(ids.len());
            for id in ids {
                let changed = conn.execute(
                    "UPDATE sessions SET status = 'idle' WHERE id = ?1 AND status = 'active' AND last_seen_at < ?2",
                    rusqlite::params![id, cutoff],
                )?;
                if changed == 1 {
                    moved.push(SessionId::from_raw(id));
                }
            }
            Ok(moved)
        })
    }

    #[instrument(skip(self))]
    pub fn count_by_status(&self, status: SessionStatus) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = ?1",
                [status.to_string()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row_helpers::get(row, 5, "sessions", "status")?;
    let profile_str: String = row_helpers::get(row, 6, "sessions", "agent_profile")?;
    let metadata_str: String = row_helpers::get(row, 7, "sessions", "metadata")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        user_id: row_helpers::get_opt(row, 1, "sessions", "user_id")?,
        project_path: row_helpers::get_opt(row, 2, "sessions", "project_path")?,
        started_at: row_helpers::get(row, 3, "sessions", "started_at")?,
        last_seen_at: row_helpers::get(row, 4, "sessions", "last_seen_at")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        agent_profile: row_helpers::parse_json(&profile_str, "sessions", "agent_profile")?,
        metadata: row_helpers::parse_json(&metadata_str, "sessions", "metadata")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_and_get() {
        let repo = setup();
        let mut new = NewSession::active(SessionId::from_raw("ide-1"));
        new.user_id = Some("u1".into());
        new.agent_profile = json!({"agent": "cursor"});
        let created = repo.create(&new).unwrap();
        assert_eq!(created.status, SessionStatus::Active);
        assert_eq!(created.started_at, created.last_seen_at);

        let fetched = repo.get(&created.id).unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn duplicate_create_is_conflict() {
        let repo = setup();
        let new = NewSession::active(SessionId::from_raw("dup"));
        repo.create(&new).unwrap();
        assert!(matches!(repo.create(&new), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = setup();
        let err = repo.get(&SessionId::from_raw("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn last_seen_never_decreases() {
        let repo = setup();
        let s = repo.create(&NewSession::active(SessionId::new())).unwrap();

        let later = repo
            .update(&s.id, &SessionUpdate::seen_at("2999-01-01T00:00:00.000Z"))
            .unwrap();
        assert_eq!(later.last_seen_at, "2999-01-01T00:00:00.000Z");

        let stale = repo
            .update(&s.id, &SessionUpdate::seen_at("2000-01-01T00:00:00.000Z"))
            .unwrap();
        assert_eq!(stale.last_seen_at, "2999-01-01T00:00:00.000Z");
    }

    #[test]
    fn partial_update_keeps_other_columns() {
        let repo = setup();
        let mut new = NewSession::active(SessionId::new());
        new.project_path = Some("/repo".into());
        let s = repo.create(&new).unwrap();

        let updated = repo
            .update(
                &s.id,
                &SessionUpdate {
                    metadata: Some(json!({"branch": "main"})),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.project_path.as_deref(), Some("/repo"));
        assert_eq!(updated.metadata["branch"], "main");
    }

    #[test]
    fn update_missing_is_not_found() {
        let repo = setup();
        let err = repo
            .update(&SessionId::from_raw("nope"), &SessionUpdate::seen_at("2024-01-01T00:00:00.000Z"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn compare_and_set_only_from_expected() {
        let repo = setup();
        let s = repo.create(&NewSession::active(SessionId::new())).unwrap();

        assert!(!repo
            .compare_and_set_status(&s.id, SessionStatus::Idle, SessionStatus::Active)
            .unwrap());
        assert!(repo
            .compare_and_set_status(&s.id, SessionStatus::Active, SessionStatus::Idle)
            .unwrap());
        assert_eq!(repo.get(&s.id).unwrap().status, SessionStatus::Idle);
    }

    #[test]
    fn mark_stale_only_touches_old_active_sessions() {
        let repo = setup();
        let old = repo.create(&NewSession::active(SessionId::from_raw("old"))).unwrap();
        let fresh = repo.create(&NewSession::active(SessionId::from_raw("fresh"))).unwrap();
        let mut ended = NewSession::active(SessionId::from_raw("ended"));
        ended.status = SessionStatus::Ended;
        repo.create(&ended).unwrap();

        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE sessions SET last_seen_at = '2000-01-01T00:00:00.000Z' WHERE id IN ('old', 'ended')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let moved = repo.mark_stale("2020-01-01T00:00:00.000Z").unwrap();
        assert_eq!(moved, vec![old.id.clone()]);
        assert_eq!(repo.get(&old.id).unwrap().status, SessionStatus::Idle);
        assert_eq!(repo.get(&fresh.id).unwrap().status, SessionStatus::Active);
        assert_eq!(repo.get(&SessionId::from_raw("ended")).unwrap().status, SessionStatus::Ended);
        assert_eq!(repo.count_by_status(SessionStatus::Active).unwrap(), 1);
    }
}
