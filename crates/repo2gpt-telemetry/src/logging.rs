//! Warn-and-above records persisted to SQLite, keyed by the job they concern.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<Value>,
    pub job_id: Option<String>,
}

/// Filter for `GET /admin/logs`. `level` is a threshold: `warn` returns
/// warnings and errors. `target` matches a module path prefix.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub job_id: Option<String>,
    pub limit: Option<u32>,
}

/// Lower is more severe; only ERROR and WARN are ever stored.
fn severity(level: Level) -> i64 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        Level::TRACE => 5,
    }
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS job_logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 logged_at TEXT NOT NULL,
                 severity INTEGER NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 job_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id, id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record(&self, entry: Entry) {
        let fields = (!entry.fields.is_empty())
            .then(|| serde_json::to_string(&entry.fields).ok())
            .flatten();
        let conn = self.conn.lock();
        // Best-effort.
        let _ = conn.execute(
            "INSERT INTO job_logs (logged_at, severity, target, message, fields, job_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                severity(entry.level),
                entry.target,
                entry.message,
                fields,
                entry.job_id,
            ],
        );
    }

    /// Newest first. An unrecognized `level` matches nothing rather than everything.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let threshold = match q.level.as_deref() {
            None => severity(Level::TRACE),
            Some(name) => name.parse::<Level>().map(severity).unwrap_or(0),
        };
        let target = q.target.as_ref().map(|t| format!("{t}%"));
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, logged_at, severity, target, message, fields, job_id FROM job_logs
             WHERE severity <= ?1
               AND (?2 IS NULL OR target LIKE ?2)
               AND (?3 IS NULL OR job_id = ?3)
             ORDER BY id DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![threshold, target, q.job_id, limit], |row| {
            let fields: Option<String> = row.get(5)?;
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: level_name(row.get(2)?).to_string(),
                target: row.get(3)?,
                message: row.get(4)?,
                fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
                job_id: row.get(6)?,
            })
        })?;
        rows.collect()
    }
}

fn level_name(severity: i64) -> &'static str {
    match severity {
        1 => "ERROR",
        2 => "WARN",
        3 => "INFO",
        4 => "DEBUG",
        _ => "TRACE",
    }
}

struct Entry {
    level: Level,
    target: String,
    message: String,
    fields: Map<String, Value>,
    job_id: Option<String>,
}

/// Collects an event's or span's fields, lifting `message` and `job_id` out.
#[derive(Default)]
struct Fields {
    message: Option<String>,
    job_id: Option<String>,
    rest: Map<String, Value>,
}

impl Fields {
    fn put(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(s)) => self.message = Some(s),
            ("job_id", Value::String(s)) => self.job_id = Some(s),
            (name, value) => {
                self.rest.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        let text = match field.name() {
            "job_id" => text.trim_matches('"').to_string(),
            _ => text,
        };
        self.put(field, Value::String(text));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Span extension carrying the job a span was opened for.
struct JobScope(String);

/// Writes warn+ events to a [`SqliteLogSink`]. Events without their own
/// `job_id` inherit the nearest enclosing span's.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        attrs.record(&mut fields);
        if let (Some(job_id), Some(span)) = (fields.job_id, ctx.span(id)) {
            span.extensions_mut().insert(JobScope(job_id));
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }
        let mut fields = Fields::default();
        event.record(&mut fields);

        let job_id = fields.job_id.or_else(|| {
            ctx.event_scope(event)?
                .find_map(|span| span.extensions().get::<JobScope>().map(|s| s.0.clone()))
        });

        self.sink.record(Entry {
            level: *meta.level(),
            target: meta.target().to_string(),
            message: fields.message.unwrap_or_default(),
            fields: fields.rest,
            job_id,
        });
    }
}
