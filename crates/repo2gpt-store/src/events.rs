//! Per-job append-only event log.

use chrono::Utc;
use rusqlite::Connection;
use tracing::instrument;

use repo2gpt_core::events::{EventDraft, JobEvent};
use repo2gpt_core::ids::JobId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_EVENT: &str = "SELECT job_id, id, kind, message, data, timestamp FROM job_events";

/// Append `draft` to the job's log with id = last id + 1 (ids start at 1).
///
/// Callers must hold the job's write lock and should run this inside the
/// same transaction as any status change it records.
pub fn insert_event(
    conn: &Connection,
    job_id: &JobId,
    draft: EventDraft,
) -> Result<JobEvent, StoreError> {
    let last: i64 = conn.query_row(
        "SELECT COALESCE(MAX(id), 0) FROM job_events WHERE job_id = ?1",
        [job_id.as_str()],
        |row| row.get(0),
    )?;
    let id = last + 1;
    let timestamp = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO job_events (job_id, id, kind, message, data, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            job_id.as_str(),
            id,
            draft.kind.to_string(),
            draft.message,
            serde_json::to_string(&draft.data)?,
            timestamp,
        ],
    )?;

    Ok(JobEvent {
        id: id as u64,
        job_id: job_id.clone(),
        timestamp,
        kind: draft.kind,
        message: draft.message,
        data: draft.data,
    })
}

/// Read side of the event log.
pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Events with id > `after`, in id order.
    #[instrument(skip(self), fields(job_id = %job_id, after))]
    pub fn list_after(&self, job_id: &JobId, after: u64) -> Result<Vec<JobEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_EVENT} WHERE job_id = ?1 AND id > ?2 ORDER BY id ASC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![job_id.as_str(), after as i64])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// Full history of a job.
    pub fn list(&self, job_id: &JobId) -> Result<Vec<JobEvent>, StoreError> {
        self.list_after(job_id, 0)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<JobEvent, StoreError> {
    const T: &str = "job_events";
    let job_id: String = row_helpers::get(row, 0, T, "job_id")?;
    let id: i64 = row_helpers::get(row, 1, T, "id")?;
    let kind: String = row_helpers::get(row, 2, T, "kind")?;
    let data: String = row_helpers::get(row, 4, T, "data")?;
    Ok(JobEvent {
        id: id as u64,
        job_id: JobId::from_raw(job_id),
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        message: row_helpers::get_opt(row, 3, T, "message")?,
        data: row_helpers::parse_json(&data, T, "data")?,
        timestamp: row_helpers::get(row, 5, T, "timestamp")?,
    })
}
