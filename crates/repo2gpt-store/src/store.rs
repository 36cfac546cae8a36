//! The job store: durable job records plus their event logs.
//!
//! Every mutation commits to SQLite before the resulting event is published
//! to in-process subscribers, so anything a subscriber sees can be replayed
//! from the database later.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use repo2gpt_core::events::{EventDraft, JobEvent};
use repo2gpt_core::ids::JobId;
use repo2gpt_core::job::{Chunk, Job, JobArtifacts, JobRequest, JobResult, JobStatus};

use crate::artifacts::{self, ArtifactRepo, REPOMAP_ARTIFACT};
use crate::database::Database;
use crate::error::StoreError;
use crate::events::{self, EventRepo};
use crate::jobs::{self, JobRepo};

/// Output of a successful pipeline run, committed atomically with the
/// `running → completed` transition.
#[derive(Clone, Debug)]
pub struct CompletedJob {
    pub repomap: String,
    pub chunks: Vec<Chunk>,
    pub result: JobResult,
}

/// Per-job write lock so a job's event ids and status changes never interleave.
struct JobLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl JobLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, job_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release(&mut self, job_id: &str) {
        self.locks.remove(job_id);
    }
}

pub struct JobStore {
    db: Database,
    jobs: JobRepo,
    events: EventRepo,
    artifacts: ArtifactRepo,
    job_locks: Mutex<JobLocks>,
    event_tx: broadcast::Sender<JobEvent>,
    closed: AtomicBool,
}

impl JobStore {
    /// Open the store at `path`. `channel_capacity` bounds the live fan-out buffer.
    pub fn open(path: &Path, channel_capacity: usize) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?, channel_capacity))
    }

    pub fn in_memory(channel_capacity: usize) -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?, channel_capacity))
    }

    pub fn new(db: Database, channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            jobs: JobRepo::new(db.clone()),
            events: EventRepo::new(db.clone()),
            artifacts: ArtifactRepo::new(db.clone()),
            db,
            job_locks: Mutex::new(JobLocks::new()),
            event_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Live feed of every event committed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// Create a `pending` job and its first status event.
    #[instrument(skip(self, request), fields(source = request.source.kind()))]
    pub fn create_job(&self, request: JobRequest) -> Result<Job, StoreError> {
        self.ensure_open()?;
        let id = JobId::new();
        let lock = self.job_locks.lock().get(id.as_str());
        let _guard = lock.lock();

        let (job, event) = self.db.transaction(|conn| {
            let job = jobs::insert_job(conn, &id, &request)?;
            let event =
                events::insert_event(conn, &id, EventDraft::status(JobStatus::Pending, "Job created"))?;
            Ok((job, event))
        })?;
        self.publish(event);
        info!(job_id = %id, "job created");
        Ok(job)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        self.jobs.get(id)
    }

    pub fn list_jobs(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        self.jobs.list_recent(limit)
    }

    pub fn events(&self, id: &JobId) -> Result<Vec<JobEvent>, StoreError> {
        self.events.list(id)
    }

    /// Events with id > `after`; errors with NotFound for an unknown job.
    pub fn events_after(&self, id: &JobId, after: u64) -> Result<Vec<JobEvent>, StoreError> {
        let events = self.events.list_after(id, after)?;
        if events.is_empty() {
            self.jobs.get(id)?;
        }
        Ok(events)
    }

    /// Atomically move the oldest pending job to `running`.
    pub fn claim_next_pending(&self) -> Result<Option<Job>, StoreError> {
        self.ensure_open()?;
        loop {
            let Some(id) = self.db.with_conn(jobs::oldest_pending)? else {
                return Ok(None);
            };
            let lock = self.job_locks.lock().get(id.as_str());
            let _guard = lock.lock();

            let claimed = self.db.transaction(|conn| {
                jobs::update_status(conn, &id, JobStatus::Pending, JobStatus::Running, None, None)?;
                events::insert_event(conn, &id, EventDraft::status(JobStatus::Running, "Job started"))
            });
            match claimed {
                Ok(event) => {
                    self.publish(event);
                    debug!(job_id = %id, "job claimed");
                    return self.jobs.get(&id).map(Some);
                }
                // Another worker won the race; look for the next one
                Err(StoreError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Append a non-status event to a job that has not finished.
    pub fn append_event(&self, id: &JobId, draft: EventDraft) -> Result<JobEvent, StoreError> {
        self.ensure_open()?;
        let lock = self.job_locks.lock().get(id.as_str());
        let _guard = lock.lock();

        let event = self.db.transaction(|conn| {
            let job = jobs::get_job(conn, id)?;
            if job.status.is_terminal() {
                return Err(StoreError::JobFinished(id.to_string()));
            }
            events::insert_event(conn, id, draft)
        })?;
        self.publish(event.clone());
        Ok(event)
    }

    /// `running → failed` with exactly one terminal status event.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn fail_job(&self, id: &JobId, error: &str) -> Result<JobEvent, StoreError> {
        self.ensure_open()?;
        let lock = self.job_locks.lock().get(id.as_str());
        let guard = lock.lock();

        let event = self.db.transaction(|conn| {
            jobs::update_status(conn, id, JobStatus::Running, JobStatus::Failed, None, Some(error))?;
            events::insert_event(conn, id, EventDraft::failed(error))
        })?;
        self.publish(event.clone());
        drop(guard);
        self.job_locks.lock().release(id.as_str());
        warn!(job_id = %id, error, "job failed");
        Ok(event)
    }

    /// `running → completed`, persisting artifacts and result in the same transaction.
    #[instrument(skip(self, completed), fields(job_id = %id, chunks = completed.chunks.len()))]
    pub fn complete_job(&self, id: &JobId, completed: CompletedJob) -> Result<JobEvent, StoreError> {
        self.ensure_open()?;
        let lock = self.job_locks.lock().get(id.as_str());
        let guard = lock.lock();

        let summary = json!({
            "chunk_count": completed.result.chunks.len(),
            "included_files": completed.result.included_files,
            "warning_count": completed.result.warnings.len(),
            "token_totals": completed.result.token_totals,
        });

        let event = self.db.transaction(|conn| {
            artifacts::insert_artifact(conn, id, REPOMAP_ARTIFACT, &completed.repomap)?;
            for chunk in &completed.chunks {
                artifacts::insert_chunk(conn, id, chunk)?;
            }
            jobs::update_status(
                conn,
                id,
                JobStatus::Running,
                JobStatus::Completed,
                Some(&completed.result),
                None,
            )?;
            events::insert_event(conn, id, EventDraft::completed(summary))
        })?;
        self.publish(event.clone());
        drop(guard);
        self.job_locks.lock().release(id.as_str());
        info!(job_id = %id, "job completed");
        Ok(event)
    }

    /// Durably flag a job for cooperative cancellation.
    pub fn request_cancel(&self, id: &JobId) -> Result<bool, StoreError> {
        self.ensure_open()?;
        self.jobs.request_cancel(id)
    }

    pub fn is_cancel_requested(&self, id: &JobId) -> Result<bool, StoreError> {
        self.jobs.is_cancel_requested(id)
    }

    /// Fail every job left `running` by a previous process.
    pub fn recover_interrupted(&self) -> Result<Vec<JobId>, StoreError> {
        let stuck = self
            .db
            .with_conn(|conn| jobs::ids_with_status(conn, JobStatus::Running))?;
        for id in &stuck {
            self.fail_job(id, "interrupted")?;
        }
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "recovered interrupted jobs");
        }
        Ok(stuck)
    }

    /// Artifacts of a completed job; `NotReady` for any other status.
    pub fn artifacts(&self, id: &JobId) -> Result<JobArtifacts, StoreError> {
        let job = self.jobs.get(id)?;
        if job.status != JobStatus::Completed {
            return Err(StoreError::NotReady {
                job_id: id.to_string(),
                status: job.status,
            });
        }
        let result = job.result.ok_or_else(|| StoreError::CorruptRow {
            table: "jobs",
            column: "result",
            detail: format!("completed job {id} has no result"),
        })?;

        Ok(JobArtifacts {
            repomap: self.artifacts.get(id, REPOMAP_ARTIFACT)?,
            chunks: self.artifacts.chunks(id)?,
            warnings: result.warnings,
            token_estimator: result.token_estimator,
            token_totals: result.token_totals,
        })
    }

    /// Reject further writes and flush the WAL.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.checkpoint()?;
        match self.db.file() {
            Some(path) => info!(path = %path.display(), "job store closed"),
            None => info!("in-memory job store closed"),
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn publish(&self, event: JobEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("no live subscribers for job event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo2gpt_core::events::EventKind;
    use repo2gpt_core::job::{TokenEstimatorInfo, TokenTotals};
    use repo2gpt_core::source::SourceSpec;

    fn store() -> JobStore {
        JobStore::in_memory(64).unwrap()
    }

    fn request() -> JobRequest {
        JobRequest::new(SourceSpec::Local {
            path: "/tmp/repo".into(),
        })
    }

    fn completed(chunks: Vec<Chunk>) -> CompletedJob {
        CompletedJob {
            repomap: "repo\n    a.py\n".into(),
            result: JobResult {
                repomap_ref: REPOMAP_ARTIFACT.into(),
                chunks: chunks.iter().map(Chunk::manifest).collect(),
                warnings: vec!["a.py: summarizer failed".into()],
                token_estimator: TokenEstimatorInfo {
                    enabled: true,
                    approximate: true,
                    strategy: "approximate (characters / 4)".into(),
                },
                token_totals: Some(TokenTotals {
                    chunk_tokens: 5,
                    repo_map_tokens: 3,
                    chunk_count: chunks.len(),
                }),
                included_files: 1,
            },
            chunks,
        }
    }

    fn chunk0() -> Chunk {
        Chunk {
            index: 0,
            token_count: 5,
            files: vec!["a.py".into()],
            content: "\n\n---\na.py\n---\n\nx = 1".into(),
        }
    }

    #[test]
    fn create_emits_pending_status_event() {
        let store = store();
        let job = store.create_job(request()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let events = store.events(&job.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 1);
        assert_eq!(events[0].status(), Some(JobStatus::Pending));
    }

    #[test]
    fn full_lifecycle_event_ids_are_gapless() {
        let store = store();
        let job = store.create_job(request()).unwrap();
        let claimed = store.claim_next_pending().unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);

        store
            .append_event(&job.id, EventDraft::progress("fetch", 10, "Preparing workspace"))
            .unwrap();
        store
            .complete_job(&job.id, completed(vec![chunk0()]))
            .unwrap();

        let events = store.events(&job.id).unwrap();
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        let statuses: Vec<JobStatus> = events.iter().filter_map(JobEvent::status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
        );
        assert!(events.last().unwrap().is_terminal());
    }

    #[test]
    fn claim_with_nothing_pending() {
        assert!(store().claim_next_pending().unwrap().is_none());
    }

    #[test]
    fn each_job_claimed_once() {
        let store = store();
        store.create_job(request()).unwrap();
        store.create_job(request()).unwrap();
        let a = store.claim_next_pending().unwrap().unwrap();
        let b = store.claim_next_pending().unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert!(store.claim_next_pending().unwrap().is_none());
    }

    #[test]
    fn no_events_after_terminal() {
        let store = store();
        let job = store.create_job(request()).unwrap();
        store.claim_next_pending().unwrap();
        store.fail_job(&job.id, "fetch error: 404").unwrap();

        let err = store
            .append_event(&job.id, EventDraft::progress("filter", 30, "late"))
            .unwrap_err();
        assert!(matches!(err, StoreError::JobFinished(_)));

        let err = store.fail_job(&job.id, "again").unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let loaded = store.get_job(&job.id).unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("fetch error: 404"));
        let terminal = store
            .events(&job.id)
            .unwrap()
            .into_iter()
            .filter(JobEvent::is_terminal)
            .count();
        assert_eq!(terminal, 1);
    }

    #[test]
    fn cannot_complete_pending_job() {
        let store = store();
        let job = store.create_job(request()).unwrap();
        let err = store.complete_job(&job.id, completed(vec![])).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        // The failed transaction left no artifacts behind
        assert!(store.events(&job.id).unwrap().len() == 1);
    }

    #[test]
    fn artifacts_only_when_completed() {
        let store = store();
        let job = store.create_job(request()).unwrap();
        assert!(matches!(
            store.artifacts(&job.id),
            Err(StoreError::NotReady {
                status: JobStatus::Pending,
                ..
            })
        ));

        store.claim_next_pending().unwrap();
        store.complete_job(&job.id, completed(vec![chunk0()])).unwrap();

        let artifacts = store.artifacts(&job.id).unwrap();
        assert_eq!(artifacts.repomap, "repo\n    a.py\n");
        assert_eq!(artifacts.chunks, vec![chunk0()]);
        assert_eq!(artifacts.warnings.len(), 1);
        assert_eq!(artifacts.token_totals.unwrap().chunk_count, 1);
    }

    #[test]
    fn recover_fails_running_jobs_only() {
        let store = store();
        let first = store.create_job(request()).unwrap();
        let second = store.create_job(request()).unwrap();
        let claimed = store.claim_next_pending().unwrap().unwrap();
        assert_eq!(claimed.id, first.id);

        let recovered = store.recover_interrupted().unwrap();
        assert_eq!(recovered, vec![first.id.clone()]);

        let failed = store.get_job(&first.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("interrupted"));
        assert_eq!(store.get_job(&second.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn events_after_unknown_job_is_not_found() {
        let store = store();
        assert!(matches!(
            store.events_after(&JobId::new(), 0),
            Err(StoreError::NotFound(_))
        ));
        let job = store.create_job(request()).unwrap();
        assert!(store.events_after(&job.id, 1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn publishes_after_commit_in_order() {
        let store = store();
        let mut rx = store.subscribe();
        let job = store.create_job(request()).unwrap();
        store.claim_next_pending().unwrap();
        store
            .append_event(&job.id, EventDraft::repomap(12, 1))
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let ev = rx.recv().await.unwrap();
            // Anything published is already readable from the log
            let stored = store.events_after(&job.id, ev.id - 1).unwrap();
            assert_eq!(stored[0], ev);
            seen.push((ev.id, ev.kind));
        }
        assert_eq!(
            seen,
            vec![
                (1, EventKind::Status),
                (2, EventKind::Status),
                (3, EventKind::Repomap)
            ]
        );
    }

    #[test]
    fn closed_store_rejects_writes() {
        let store = store();
        store.close().unwrap();
        assert!(matches!(
            store.create_job(request()),
            Err(StoreError::Closed)
        ));
        // Closing twice is harmless
        store.close().unwrap();
    }

    #[test]
    fn reopen_file_store_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let id = {
            let store = JobStore::open(&path, 8).unwrap();
            let job = store.create_job(request()).unwrap();
            store.claim_next_pending().unwrap();
            store.close().unwrap();
            job.id
        };

        let store = JobStore::open(&path, 8).unwrap();
        assert_eq!(store.get_job(&id).unwrap().status, JobStatus::Running);
        store.recover_interrupted().unwrap();
        let events = store.events(&id).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].data["error"], "interrupted");
    }
}
