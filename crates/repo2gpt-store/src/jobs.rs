//! Job records. Write helpers take a `Connection` so the store can pair each
//! status change with its event in one transaction.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use repo2gpt_core::ids::JobId;
use repo2gpt_core::job::{Job, JobRequest, JobResult, JobStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SELECT_JOB: &str = "SELECT id, status, request, result, error, cancel_requested, created_at, updated_at FROM jobs";

/// Insert a new `pending` job.
pub fn insert_job(conn: &Connection, id: &JobId, request: &JobRequest) -> Result<Job, StoreError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO jobs (id, status, request, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        rusqlite::params![
            id.as_str(),
            JobStatus::Pending.to_string(),
            serde_json::to_string(request)?,
            now,
        ],
    )?;
    Ok(Job {
        id: id.clone(),
        status: JobStatus::Pending,
        request: request.clone(),
        result: None,
        error: None,
        cancel_requested: false,
        created_at: now.clone(),
        updated_at: now,
    })
}

pub fn get_job(conn: &Connection, id: &JobId) -> Result<Job, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_JOB} WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_job(row),
        None => Err(StoreError::NotFound(format!("job {id}"))),
    }
}

/// Compare-and-set the status column. Fails without writing if the job is
/// not currently in `from` or the edge is not part of the lifecycle.
pub fn update_status(
    conn: &Connection,
    id: &JobId,
    from: JobStatus,
    to: JobStatus,
    result: Option<&JobResult>,
    error: Option<&str>,
) -> Result<(), StoreError> {
    if !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            job_id: id.to_string(),
            from,
            to,
        });
    }

    let result_json = result.map(serde_json::to_string).transpose()?;
    let changed = conn.execute(
        "UPDATE jobs SET status = ?1, result = ?2, error = ?3, updated_at = ?4
         WHERE id = ?5 AND status = ?6",
        rusqlite::params![
            to.to_string(),
            result_json,
            error,
            Utc::now().to_rfc3339(),
            id.as_str(),
            from.to_string(),
        ],
    )?;

    if changed == 0 {
        let current = get_job(conn, id)?;
        return Err(StoreError::InvalidTransition {
            job_id: id.to_string(),
            from: current.status,
            to,
        });
    }
    Ok(())
}

/// Oldest pending job, if any.
pub fn oldest_pending(conn: &Connection) -> Result<Option<JobId>, StoreError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM jobs WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.map(JobId::from_raw))
}

pub fn ids_with_status(conn: &Connection, status: JobStatus) -> Result<Vec<JobId>, StoreError> {
    let mut stmt = conn.prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY created_at ASC")?;
    let ids = stmt
        .query_map([status.to_string()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids.into_iter().map(JobId::from_raw).collect())
}

/// Read-only access to job records.
pub struct JobRepo {
    db: Database,
}

impl JobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(job_id = %id))]
    pub fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        self.db.with_conn(|conn| get_job(conn, id))
    }

    /// Most recently created jobs first.
    pub fn list_recent(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_JOB} ORDER BY created_at DESC, id DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut jobs = Vec::new();
            while let Some(row) = rows.next()? {
                jobs.push(row_to_job(row)?);
            }
            Ok(jobs)
        })
    }

    /// Mark a non-terminal job cancel-requested. Returns false if it had already finished.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn request_cancel(&self, id: &JobId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
            )?;
            if changed == 0 {
                // Distinguish unknown id from finished job
                get_job(conn, id)?;
                return Ok(false);
            }
            Ok(true)
        })
    }

    pub fn is_cancel_requested(&self, id: &JobId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let flag: Option<i64> = conn
                .query_row(
                    "SELECT cancel_requested FROM jobs WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            flag.map(|f| f != 0)
                .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
        })
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<Job, StoreError> {
    const T: &str = "jobs";
    let id: String = row_helpers::get(row, 0, T, "id")?;
    let status: String = row_helpers::get(row, 1, T, "status")?;
    let request: String = row_helpers::get(row, 2, T, "request")?;
    let result: Option<String> = row_helpers::get_opt(row, 3, T, "result")?;
    let cancel: i64 = row_helpers::get(row, 5, T, "cancel_requested")?;

    Ok(Job {
        id: JobId::from_raw(id),
        status: row_helpers::parse_enum(&status, T, "status")?,
        request: row_helpers::parse_json(&request, T, "request")?,
        result: result
            .map(|raw| row_helpers::parse_json(&raw, T, "result"))
            .transpose()?,
        error: row_helpers::get_opt(row, 4, T, "error")?,
        cancel_requested: cancel != 0,
        created_at: row_helpers::get(row, 6, T, "created_at")?,
        updated_at: row_helpers::get(row, 7, T, "updated_at")?,
    })
}
