use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const LOG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    span_id TEXT,
    session_id TEXT,
    connection_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub span_id: Option<String>,
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(LOG_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // A failed log write has nowhere to be reported.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_id, session_id, connection_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_id,
                record.session_id,
                record.connection_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, span_id, session_id, connection_id
             FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.to_uppercase()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(session_id) = &q.session_id {
            sql.push_str(&format!(" AND session_id = ?{}", params.len() + 1));
            params.push(Box::new(session_id.clone()));
        }
        if let Some(connection_id) = &q.connection_id {
            sql.push_str(&format!(" AND connection_id = ?{}", params.len() + 1));
            params.push(Box::new(connection_id.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        let limit = q.limit.unwrap_or(100);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                span_id: row.get(6)?,
                session_id: row.get(7)?,
                connection_id: row.get(8)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_id: Option<String>,
    session_id: Option<String>,
    connection_id: Option<String>,
}

/// tracing Layer that writes warn+ events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    session_id: Option<String>,
    connection_id: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "session_id" => self.session_id = Some(value),
            "connection_id" => self.connection_id = Some(value),
            other => {
                self.fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        let val = if field.name() == "message" {
            val
        } else {
            val.trim_matches('"').to_string()
        };
        self.put(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        // Fall back to ids recorded on enclosing spans
        if visitor.session_id.is_none() || visitor.connection_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.session_id.is_none() {
                            visitor.session_id.clone_from(&fields.session_id);
                        }
                        if visitor.connection_id.is_none() {
                            visitor.connection_id.clone_from(&fields.connection_id);
                        }
                    }
                }
            }
        }

        let span_id = ctx
            .event_scope(event)
            .and_then(|mut scope| scope.next())
            .map(|span| format!("{:?}", span.id()));

        let fields_json = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        let record = LogInsert {
            timestamp: overwatch_core::timestamp_now(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: fields_json,
            span_id,
            session_id: visitor.session_id,
            connection_id: visitor.connection_id,
        };

        self.sink.insert(&record);
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.session_id.is_some() || visitor.connection_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    session_id: visitor.session_id,
                    connection_id: visitor.connection_id,
                });
            }
        }
    }
}

/// Stored on spans to propagate session_id / connection_id to child events.
struct SpanFields {
    session_id: Option<String>,
    connection_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn insert(sink: &SqliteLogSink, ts: &str, level: &str, target: &str, msg: &str, session: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: ts.into(),
            level: level.into(),
            target: target.into(),
            message: msg.into(),
            fields: None,
            span_id: None,
            session_id: session.map(String::from),
            connection_id: None,
        });
    }

    #[test]
    fn file_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs.db");
        let sink = SqliteLogSink::new(&path).unwrap();
        insert(&sink, "2026-02-14T12:00:00.000Z", "WARN", "overwatch_llm", "rate limited", None);
        assert_eq!(sink.count().unwrap(), 1);
        assert!(path.exists());
    }

    #[test]
    fn query_by_level_and_session() {
        let sink = SqliteLogSink::in_memory().unwrap();
        insert(&sink, "2026-02-14T12:00:00.000Z", "WARN", "t", "warning msg", Some("sess_a"));
        insert(&sink, "2026-02-14T12:00:01.000Z", "ERROR", "t", "error msg", Some("sess_b"));

        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "error msg");

        let by_session = sink
            .query(&LogQuery {
                session_id: Some("sess_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].message, "warning msg");
    }

    #[test]
    fn query_by_target_since_and_limit() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            insert(
                &sink,
                &format!("2026-02-14T12:00:{i:02}.000Z"),
                "WARN",
                "overwatch_engine::generator",
                &format!("msg {i}"),
                None,
            );
        }
        insert(&sink, "2026-02-14T13:00:00.000Z", "WARN", "overwatch_store::events", "db", None);

        let recent = sink
            .query(&LogQuery {
                target: Some("generator".into()),
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "msg 9");

        let since = sink
            .query(&LogQuery {
                since: Some("2026-02-14T12:30:00.000Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].message, "db");
    }

    #[test]
    fn layer_persists_warnings_with_span_ids() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("ignored");
            let span = tracing::info_span!("ws", session_id = "sess_1", connection_id = "conn_9");
            let _enter = span.enter();
            tracing::warn!(attempt = 2u64, "send failed");
        });

        assert_eq!(sink.count().unwrap(), 1);
        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows[0].level, "WARN");
        assert_eq!(rows[0].message, "send failed");
        assert_eq!(rows[0].session_id.as_deref(), Some("sess_1"));
        assert_eq!(rows[0].connection_id.as_deref(), Some("conn_9"));
        assert!(rows[0].fields.as_deref().unwrap_or("").contains("attempt"));
    }

    #[test]
    fn event_fields_override_span_fields() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("outer", session_id = "sess_outer");
            let _enter = span.enter();
            tracing::error!(session_id = "sess_inner", "boom");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows[0].session_id.as_deref(), Some("sess_inner"));
        assert_eq!(rows[0].level, "ERROR");
    }
}
