//! Job lifecycle types shared by the store, the runner and the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::ids::JobId;
use crate::source::SourceSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal edges of the lifecycle: `pending → running → {completed | failed}`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-job overrides for the file filter. Lists extend the built-in defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterOptions {
    pub ignore_patterns: Vec<String>,
    pub include_patterns: Vec<String>,
    pub allowed_extensions: Vec<String>,
    pub special_filenames: Vec<String>,
    /// `None` falls back to the runner default; `Some(0)` disables the size check.
    pub max_file_bytes: Option<u64>,
    pub allow_non_code: bool,
    pub include_all: bool,
    #[serde(default = "default_true")]
    pub respect_repo_ignore_files: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            include_patterns: Vec::new(),
            allowed_extensions: Vec::new(),
            special_filenames: Vec::new(),
            max_file_bytes: None,
            allow_non_code: false,
            include_all: false,
            respect_repo_ignore_files: true,
        }
    }
}

/// The original submission, stored verbatim on the job record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    pub source: SourceSpec,
    #[serde(default)]
    pub options: FilterOptions,
    /// `None` falls back to the runner default; `Some(0)` means a single unbounded chunk.
    #[serde(default)]
    pub chunk_token_limit: Option<u64>,
    #[serde(default = "default_true")]
    pub enable_token_counts: bool,
}

impl JobRequest {
    pub fn new(source: SourceSpec) -> Self {
        Self {
            source,
            options: FilterOptions::default(),
            chunk_token_limit: None,
            enable_token_counts: true,
        }
    }
}

/// How token counts in a result were produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimatorInfo {
    pub enabled: bool,
    pub approximate: bool,
    pub strategy: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub chunk_tokens: u64,
    pub repo_map_tokens: u64,
    pub chunk_count: usize,
}

/// One entry of a completed job's chunk manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub index: usize,
    pub token_count: u64,
    pub file_count: usize,
    pub files: Vec<String>,
}

/// A produced chunk including its consolidated text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub token_count: u64,
    pub files: Vec<String>,
    pub content: String,
}

impl Chunk {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn manifest(&self) -> ChunkManifest {
        ChunkManifest {
            index: self.index,
            token_count: self.token_count,
            file_count: self.files.len(),
            files: self.files.clone(),
        }
    }
}

/// Result payload persisted when a job completes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Name of the stored repomap artifact.
    pub repomap_ref: String,
    pub chunks: Vec<ChunkManifest>,
    pub warnings: Vec<String>,
    pub token_estimator: TokenEstimatorInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_totals: Option<TokenTotals>,
    pub included_files: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub request: JobRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Everything a client needs from a completed job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobArtifacts {
    pub repomap: String,
    pub chunks: Vec<Chunk>,
    pub warnings: Vec<String>,
    pub token_estimator: TokenEstimatorInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_totals: Option<TokenTotals>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_edges() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_display_parse() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn request_defaults() {
        let req: JobRequest = serde_json::from_value(json!({
            "source": {"type": "git", "url": "https://example.com/r.git"}
        }))
        .unwrap();
        assert!(req.enable_token_counts);
        assert_eq!(req.chunk_token_limit, None);
        assert!(req.options.respect_repo_ignore_files);
        assert!(!req.options.allow_non_code);
    }

    #[test]
    fn request_rejects_unknown_fields() {
        let res: Result<JobRequest, _> = serde_json::from_value(json!({
            "source": {"type": "git", "url": "u"},
            "chunk_size": 10
        }));
        assert!(res.is_err());
    }

    #[test]
    fn result_omits_disabled_totals() {
        let result = JobResult {
            repomap_ref: "repomap".into(),
            chunks: vec![],
            warnings: vec![],
            token_estimator: TokenEstimatorInfo {
                enabled: false,
                approximate: true,
                strategy: "approximate (characters / 4)".into(),
            },
            token_totals: None,
            included_files: 0,
        };
        let v = serde_json::to_value(&result).unwrap();
        assert!(v.get("token_totals").is_none());
    }

    #[test]
    fn chunk_manifest_counts_files() {
        let chunk = Chunk {
            index: 2,
            token_count: 40,
            files: vec!["a.py".into(), "b.py".into()],
            content: String::new(),
        };
        let m = chunk.manifest();
        assert_eq!(m.index, 2);
        assert_eq!(m.file_count, 2);
    }
}
