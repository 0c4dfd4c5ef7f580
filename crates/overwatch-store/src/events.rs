use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use overwatch_core::ids::{EventId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Optional severity attached to an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Debug,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// An immutable telemetry record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: EventId,
    pub session_id: SessionId,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub level: Option<Severity>,
    pub payload: Value,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct NewEvent {
    pub session_id: SessionId,
    pub event_type: String,
    pub level: Option<Severity>,
    pub payload: Value,
    pub tags: Vec<String>,
}

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event. Id and timestamp are assigned here.
    #[instrument(skip(self, new), fields(session_id = %new.session_id, event_type = %new.event_type))]
    pub fn append(&self, new: &NewEvent) -> Result<EventRow, StoreError> {
        let id = EventId::new();
        let timestamp = overwatch_core::timestamp_now();
        let payload = serde_json::to_string(&new.payload)?;
        let tags = serde_json::to_string(&new.tags)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (id, session_id, timestamp, type, level, payload, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    new.session_id.as_str(),
                    timestamp,
                    new.event_type,
                    new.level.map(|l| l.to_string()),
                    payload,
                    tags,
                ],
            )?;
            Ok(())
        })?;

        Ok(EventRow {
            id,
            session_id: new.session_id.clone(),
            timestamp,
            event_type: new.event_type.clone(),
            level: new.level,
            payload: new.payload.clone(),
            tags: new.tags.clone(),
        })
    }

    #[instrument(skip(self), fields(event_id = %id))]
    pub fn get(&self, id: &EventId) -> Result<EventRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, timestamp, type, level, payload, tags FROM events WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_event(row),
                None => Err(StoreError::NotFound(format!("event {id}"))),
            }
        })
    }

    /// Most recent events for a session, newest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_recent(&self, session_id: &SessionId, limit: u32) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, timestamp, type, level, payload, tags FROM events
                 WHERE session_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    let level: Option<String> = row_helpers::get_opt(row, 4, "events", "level")?;
    let payload_str: String = row_helpers::get(row, 5, "events", "payload")?;
    let tags_str: String = row_helpers::get(row, 6, "events", "tags")?;
    let tags = serde_json::from_str(&tags_str).map_err(|e| StoreError::CorruptRow {
        table: "events",
        column: "tags",
        detail: format!("invalid JSON: {e}"),
    })?;

    Ok(EventRow {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, "events", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "events", "session_id")?),
        timestamp: row_helpers::get(row, 2, "events", "timestamp")?,
        event_type: row_helpers::get(row, 3, "events", "type")?,
        level: level
            .map(|l| row_helpers::parse_enum(&l, "events", "level"))
            .transpose()?,
        payload: row_helpers::parse_json(&payload_str, "events", "payload")?,
        tags,
    })
}
