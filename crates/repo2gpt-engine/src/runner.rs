//! Worker pool that drives jobs through fetch → filter → summarize → repomap → chunk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use repo2gpt_core::events::EventDraft;
use repo2gpt_core::ids::JobId;
use repo2gpt_core::job::{Job, JobRequest, JobResult, TokenTotals};
use repo2gpt_core::source::SourceSpec;
use repo2gpt_core::tokens::{estimator_info, Tokenizer};
use repo2gpt_store::{CompletedJob, JobStore, StoreError, REPOMAP_ARTIFACT};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::chunker::{ChunkError, Chunker};
use crate::error::EngineError;
use crate::fetch::SourceFetcher;
use crate::filter::{FilterConfig, FilterEngine};
use crate::repomap::{build_repomap, MappedFile};
use crate::summarize::SummarizerRegistry;
use crate::walk::{collect_files, IncludedFile};

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub workers: usize,
    /// Idle workers re-check the store this often even without a wake-up.
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub default_chunk_token_limit: u64,
    pub default_max_file_bytes: u64,
    /// Parent directory for per-job scratch space.
    pub workspace_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(300),
            default_chunk_token_limit: 0,
            default_max_file_bytes: crate::filter::DEFAULT_MAX_FILE_BYTES,
            workspace_dir: std::env::temp_dir().join("repo2gpt"),
        }
    }
}

struct RunnerInner {
    store: Arc<JobStore>,
    fetcher: Arc<dyn SourceFetcher>,
    summarizers: Arc<SummarizerRegistry>,
    tokenizer: Arc<dyn Tokenizer>,
    config: RunnerConfig,
    wake: Notify,
    shutdown: CancellationToken,
    /// Cancellation handles of jobs currently owned by a worker.
    active: DashMap<JobId, CancellationToken>,
}

/// Bounded pool of workers pulling pending jobs from the store.
pub struct JobRunner {
    inner: Arc<RunnerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobStore>,
        fetcher: Arc<dyn SourceFetcher>,
        summarizers: Arc<SummarizerRegistry>,
        tokenizer: Arc<dyn Tokenizer>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                fetcher,
                summarizers,
                tokenizer,
                config,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                active: DashMap::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    /// Record a new `pending` job and return it without running anything.
    pub fn submit(&self, request: JobRequest) -> Result<Job, EngineError> {
        let job = self.inner.store.create_job(request)?;
        self.inner.wake.notify_one();
        Ok(job)
    }

    /// Spawn the worker tasks. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        let count = self.inner.config.workers.max(1);
        for worker in 0..count {
            let inner = Arc::clone(&self.inner);
            let span = tracing::info_span!("worker", worker);
            workers.push(tokio::spawn(inner.worker_loop(worker).instrument(span)));
        }
        info!(workers = count, "job runner started");
    }

    /// Flag a job for cancellation and signal its worker if it is running.
    ///
    /// Returns `false` when the job has already finished.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn cancel(&self, id: &JobId) -> Result<bool, EngineError> {
        let flagged = self.inner.store.request_cancel(id)?;
        if flagged {
            if let Some(token) = self.inner.active.get(id) {
                token.cancel();
            }
            info!("cancel requested");
        }
        Ok(flagged)
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.active.len()
    }

    /// Stop claiming work, interrupt in-flight jobs and wait for every worker to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("job runner stopped");
    }
}

impl RunnerInner {
    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker started");
        while !self.shutdown.is_cancelled() {
            match self.store.claim_next_pending() {
                Ok(Some(job)) => self.run_job(job).await,
                Ok(None) => {
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = self.wake.notified() => {}
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(StoreError::Closed) => break,
                Err(e) => {
                    error!(error = %e, "failed to claim job");
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        debug!(worker, "worker exiting");
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, source = job.request.source.kind()))]
    async fn run_job(&self, job: Job) {
        let cancel = self.shutdown.child_token();
        let _ = self.active.insert(job.id.clone(), cancel.clone());

        let outcome = self.execute(&job, &cancel).await;
        let _ = self.active.remove(&job.id);

        let committed = match outcome {
            Ok(completed) => self.store.complete_job(&job.id, completed).map(|_| ()),
            Err(EngineError::Store(e)) => Err(e),
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "job failed");
                self.store.fail_job(&job.id, &message).map(|_| ())
            }
        };
        // The job stays in its last committed state; restart recovery fails it.
        if let Err(e) = committed {
            error!(error = %e, "could not record job outcome");
        }
    }

    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> Result<CompletedJob, EngineError> {
        let id = &job.id;
        let request = &job.request;
        let mut warnings = Vec::new();

        // Patterns are compiled before touching the network or disk.
        let mut filter = FilterEngine::new(FilterConfig::from_options(
            &request.options,
            self.config.default_max_file_bytes,
        ))?;
        self.checkpoint(id, cancel)?;

        // ── Fetch ───────────────────────────────────────────────────
        self.emit(id, EventDraft::progress("fetch", 0, "Preparing workspace"))?;
        tokio::fs::create_dir_all(&self.config.workspace_dir)
            .await
            .map_err(|e| EngineError::Internal(format!("workspace unavailable: {e}")))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{id}-"))
            .tempdir_in(&self.config.workspace_dir)
            .map_err(|e| EngineError::Internal(format!("workspace unavailable: {e}")))?;

        let root = self.fetch(job, scratch.path(), cancel).await?;
        self.checkpoint(id, cancel)?;

        // ── Filter ──────────────────────────────────────────────────
        self.emit(id, EventDraft::progress("filter", 25, "Filtering files"))?;
        let walk_root = root.clone();
        let (rule_warnings, outcome) = tokio::task::spawn_blocking(move || {
            let rule_warnings = filter.load_repo_rules(&walk_root);
            (rule_warnings, collect_files(&walk_root, &filter))
        })
        .await
        .map_err(|e| EngineError::Internal(format!("filter task failed: {e}")))?;
        warnings.extend(rule_warnings);
        warnings.extend(outcome.warnings);
        let files = outcome.files;
        let excluded: usize = outcome.excluded.values().sum();
        self.emit(
            id,
            EventDraft::progress(
                "filter",
                35,
                format!("Selected {} files ({excluded} excluded)", files.len()),
            ),
        )?;
        self.checkpoint(id, cancel)?;

        // ── Summarize ───────────────────────────────────────────────
        self.emit(id, EventDraft::progress("summarize", 40, "Extracting symbols"))?;
        let registry = Arc::clone(&self.summarizers);
        let to_summarize = files.clone();
        let (mapped, summary_warnings) =
            tokio::task::spawn_blocking(move || summarize_files(&registry, &to_summarize))
                .await
                .map_err(|e| EngineError::Internal(format!("summarize task failed: {e}")))?;
        warnings.extend(summary_warnings);
        self.checkpoint(id, cancel)?;

        // ── Repomap ─────────────────────────────────────────────────
        self.emit(id, EventDraft::progress("repomap", 60, "Building repository map"))?;
        let repomap = build_repomap(&root_name(&request.source, &root), &mapped, self.tokenizer.as_ref())
            .map_err(|source| ChunkError::Estimator {
                path: "repository map".into(),
                source,
            })?;
        self.emit(id, EventDraft::repomap(repomap.token_count, repomap.file_count))?;
        self.checkpoint(id, cancel)?;

        // ── Chunk ───────────────────────────────────────────────────
        self.emit(id, EventDraft::progress("chunk", 75, "Generating repository snapshot"))?;
        let limit = request
            .chunk_token_limit
            .unwrap_or(self.config.default_chunk_token_limit);
        let (chunks, mut totals) = self.chunk(id, &files, limit, cancel).await?;
        totals.repo_map_tokens = repomap.token_count;

        let strategy = self.tokenizer.strategy();
        if request.enable_token_counts {
            self.emit(id, EventDraft::tokens(&totals, &strategy))?;
        }
        self.emit(id, EventDraft::progress("chunk", 100, "Snapshot generation complete"))?;
        self.checkpoint(id, cancel)?;

        let result = JobResult {
            repomap_ref: REPOMAP_ARTIFACT.to_string(),
            chunks: chunks.iter().map(|c| c.manifest()).collect(),
            warnings,
            token_estimator: estimator_info(self.tokenizer.as_ref(), request.enable_token_counts),
            token_totals: request.enable_token_counts.then_some(totals),
            included_files: files.len(),
        };
        drop(scratch);
        Ok(CompletedJob {
            repomap: repomap.text,
            chunks,
            result,
        })
    }

    async fn fetch(
        &self,
        job: &Job,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        let id = &job.id;
        let report = |message: &str| {
            if let Err(e) = self.store.append_event(id, EventDraft::progress("fetch", 10, message)) {
                warn!(error = %e, "failed to record fetch progress");
            }
        };
        let timeout = self.config.fetch_timeout;
        let fetch = self.fetcher.fetch(&job.request.source, workspace, &report);

        tokio::select! {
            result = tokio::time::timeout(timeout, fetch) => match result {
                Ok(root) => Ok(root?),
                Err(_) => Err(EngineError::FetchTimeout(timeout)),
            },
            () = cancel.cancelled() => Err(self.cancel_reason()),
        }
    }

    async fn chunk(
        &self,
        id: &JobId,
        files: &[IncludedFile],
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<(Vec<repo2gpt_core::job::Chunk>, TokenTotals), EngineError> {
        let mut chunker = Chunker::new(self.tokenizer.as_ref(), limit);
        let mut chunks = Vec::new();
        for file in files {
            if cancel.is_cancelled() {
                return Err(self.cancel_reason());
            }
            let bytes = tokio::fs::read(&file.absolute_path)
                .await
                .map_err(|source| ChunkError::Read {
                    path: file.absolute_path.clone(),
                    source,
                })?;
            let content = String::from_utf8_lossy(&bytes);
            if let Some(closed) = chunker.push(&file.relative_path, &content)? {
                self.emit(id, EventDraft::chunk(closed.index, closed.token_count, closed.file_count()))?;
                chunks.push(closed);
            }
        }
        let (last, totals) = chunker.finish();
        if let Some(last) = last {
            self.emit(id, EventDraft::chunk(last.index, last.token_count, last.file_count()))?;
            chunks.push(last);
        }
        Ok((chunks, totals))
    }

    fn emit(&self, id: &JobId, draft: EventDraft) -> Result<(), EngineError> {
        self.store.append_event(id, draft)?;
        Ok(())
    }

    /// Cooperative stop point between stages.
    fn checkpoint(&self, id: &JobId, cancel: &CancellationToken) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Interrupted);
        }
        if cancel.is_cancelled() || self.store.is_cancel_requested(id)? {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn cancel_reason(&self) -> EngineError {
        if self.shutdown.is_cancelled() {
            EngineError::Interrupted
        } else {
            EngineError::Cancelled
        }
    }
}

fn summarize_files(registry: &SummarizerRegistry, files: &[IncludedFile]) -> (Vec<MappedFile>, Vec<String>) {
    let mut mapped = Vec::with_capacity(files.len());
    let mut warnings = Vec::new();
    for file in files {
        let symbols = match std::fs::read(&file.absolute_path) {
            Ok(bytes) => {
                let summary = registry.summarize(&file.relative_path, &String::from_utf8_lossy(&bytes));
                warnings.extend(summary.warning);
                summary.symbols
            }
            Err(e) => {
                warnings.push(format!("{}: unreadable: {e}", file.relative_path));
                Vec::new()
            }
        };
        mapped.push(MappedFile {
            relative_path: file.relative_path.clone(),
            symbols,
        });
    }
    (mapped, warnings)
}

/// Name shown on the first line of the repomap.
fn root_name(source: &SourceSpec, root: &Path) -> String {
    const ARCHIVE_SUFFIXES: [&str; 4] = [".tar.gz", ".tgz", ".tar", ".zip"];

    let from_dir = || {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repository".to_string())
    };
    let strip_archive = |name: &str| {
        ARCHIVE_SUFFIXES
            .iter()
            .find_map(|suffix| {
                let cut = name.len().checked_sub(suffix.len())?;
                let (stem, tail) = (name.get(..cut)?, name.get(cut..)?);
                tail.eq_ignore_ascii_case(suffix).then(|| stem.to_string())
            })
            .unwrap_or_else(|| name.to_string())
    };

    match source {
        SourceSpec::Git { url, .. } => url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .map(|n| n.trim_end_matches(".git").to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(from_dir),
        // A flat archive has no wrapping directory to name the tree after.
        SourceSpec::ArchiveUpload { filename, .. } if root.ends_with("extracted") => {
            strip_archive(filename)
        }
        SourceSpec::ArchiveUrl {
            filename: Some(filename),
            ..
        } if root.ends_with("extracted") => strip_archive(filename),
        _ => from_dir(),
    }
}
