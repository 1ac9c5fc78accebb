use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    /// Correlation token of the run that logged this, if any.
    pub token: Option<String>,
    pub job_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring of the target module path.
    pub target: Option<String>,
    pub token: Option<String>,
    /// RFC 3339 lower bound.
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
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 token TEXT,
                 job_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_token ON logs(token);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, token, job_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.token,
                record.job_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, token, job_id FROM logs WHERE 1=1",
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
        if let Some(token) = &q.token {
            sql.push_str(&format!(" AND token = ?{}", params.len() + 1));
            params.push(Box::new(token.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        sql.push_str(&format!(" LIMIT {}", q.limit.unwrap_or(100)));

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
                token: row.get(6)?,
                job_id: row.get(7)?,
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
    token: Option<String>,
    job_id: Option<String>,
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

/// Visitor that extracts fields from a tracing event or span.
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    token: Option<String>,
    job_id: Option<String>,
}

impl FieldVisitor {
    fn routing(&mut self, name: &str, value: String) -> Option<String> {
        match name {
            "token" => self.token = Some(value),
            "job_id" => self.job_id = Some(value),
            _ => return Some(value),
        }
        None
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(val);
            return;
        }
        if let Some(val) = self.routing(field.name(), val.trim_matches('"').to_string()) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(val));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
            return;
        }
        if let Some(val) = self.routing(field.name(), value.to_string()) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(val));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "job_id" {
            self.job_id = Some(value.to_string());
            return;
        }
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
        // Only persist WARN and above
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        // Inherit token/job_id from the nearest enclosing span that has them.
        if visitor.token.is_none() || visitor.job_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.token.is_none() {
                            visitor.token.clone_from(&fields.token);
                        }
                        if visitor.job_id.is_none() {
                            visitor.job_id.clone_from(&fields.job_id);
                        }
                    }
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).unwrap_or_default());

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            token: visitor.token,
            job_id: visitor.job_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.token.is_some() || visitor.job_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    token: visitor.token,
                    job_id: visitor.job_id,
                });
            }
        }
    }
}

/// Stored on spans to propagate token / job_id to child events.
struct SpanFields {
    token: Option<String>,
    job_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(sink: &Arc<SqliteLogSink>, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn only_warn_and_above_are_persisted() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        capture(&sink, || {
            tracing::info!("progress");
            tracing::warn!(attempt = 2, "retrying after error");
            tracing::error!("gave up");
        });

        assert_eq!(sink.count().unwrap(), 2);
        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "gave up");
    }

    #[test]
    fn token_is_inherited_from_span() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        capture(&sink, || {
            let span = tracing::info_span!("run", token = "run_abc", job_id = 7_i64);
            let _guard = span.enter();
            tracing::warn!(prompt = 3, "prompt failed");
        });
        capture(&sink, || tracing::warn!(token = "run_other", "unrelated"));

        let records = sink
            .query(&LogQuery {
                token: Some("run_abc".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_id.as_deref(), Some("7"));
        assert_eq!(records[0].fields.as_deref(), Some(r#"{"prompt":3}"#));
    }

    #[test]
    fn query_by_target_and_limit() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        capture(&sink, || {
            tracing::warn!(target: "tome_llm::gemini", "rate limited");
            tracing::warn!(target: "tome_store::jobs", "slow query");
            tracing::warn!(target: "tome_llm::retry", "retrying");
        });

        let llm = sink
            .query(&LogQuery {
                target: Some("tome_llm".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(llm.len(), 2);
        assert_eq!(llm[0].message, "retrying", "newest first");

        let limited = sink
            .query(&LogQuery {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn file_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("logs.db");
        let sink = SqliteLogSink::new(&path).unwrap();
        assert_eq!(sink.count().unwrap(), 0);
        assert!(path.exists());
    }
}
