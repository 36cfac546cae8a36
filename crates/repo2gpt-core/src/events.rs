//! Job events: the append-only, per-job ordered log entries.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ids::JobId;
use crate::job::{JobStatus, TokenTotals};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Progress,
    Chunk,
    Repomap,
    Tokens,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Progress => write!(f, "progress"),
            Self::Chunk => write!(f, "chunk"),
            Self::Repomap => write!(f, "repomap"),
            Self::Tokens => write!(f, "tokens"),
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "progress" => Ok(Self::Progress),
            "chunk" => Ok(Self::Chunk),
            "repomap" => Ok(Self::Repomap),
            "tokens" => Ok(Self::Tokens),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// A persisted event. `id` is assigned by the event log, starting at 1 per job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: u64,
    pub job_id: JobId,
    pub timestamp: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: Value,
}

impl JobEvent {
    /// The status carried by a `status` event.
    pub fn status(&self) -> Option<JobStatus> {
        if self.kind != EventKind::Status {
            return None;
        }
        self.data.get("status")?.as_str()?.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(JobStatus::is_terminal)
    }
}

/// An event before it has been assigned an id and timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct EventDraft {
    pub kind: EventKind,
    pub message: Option<String>,
    pub data: Value,
}

impl EventDraft {
    pub fn status(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Status,
            message: Some(message.into()),
            data: json!({ "status": status }),
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            kind: EventKind::Status,
            message: Some("Job failed".into()),
            data: json!({ "status": JobStatus::Failed, "error": error }),
        }
    }

    pub fn completed(result_summary: Value) -> Self {
        Self {
            kind: EventKind::Status,
            message: Some("Job completed".into()),
            data: json!({ "status": JobStatus::Completed, "result_summary": result_summary }),
        }
    }

    /// `percent` is clamped to 0..=100.
    pub fn progress(stage: &str, percent: u8, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Progress,
            message: Some(message.into()),
            data: json!({ "stage": stage, "percent": percent.min(100) }),
        }
    }

    pub fn chunk(index: usize, token_count: u64, file_count: usize) -> Self {
        Self {
            kind: EventKind::Chunk,
            message: Some(format!("Chunk {index} ready")),
            data: json!({
                "chunk_index": index,
                "token_count": token_count,
                "file_count": file_count,
            }),
        }
    }

    pub fn repomap(token_count: u64, file_count: usize) -> Self {
        Self {
            kind: EventKind::Repomap,
            message: Some("Repository map generated".into()),
            data: json!({ "token_count": token_count, "file_count": file_count }),
        }
    }

    pub fn tokens(totals: &TokenTotals, estimation_strategy: &str) -> Self {
        Self {
            kind: EventKind::Tokens,
            message: Some("Token totals computed".into()),
            data: json!({
                "chunk_count": totals.chunk_count,
                "total_tokens": totals.chunk_tokens,
                "repo_map_tokens": totals.repo_map_tokens,
                "estimation_strategy": estimation_strategy,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(draft: EventDraft) -> JobEvent {
        JobEvent {
            id: 1,
            job_id: JobId::from_raw("job_t"),
            timestamp: "2026-01-01T00:00:00Z".into(),
            kind: draft.kind,
            message: draft.message,
            data: draft.data,
        }
    }

    #[test]
    fn status_event_roundtrips_status() {
        let ev = persisted(EventDraft::status(JobStatus::Running, "Job started"));
        assert_eq!(ev.status(), Some(JobStatus::Running));
        assert!(!ev.is_terminal());
    }

    #[test]
    fn failed_event_is_terminal() {
        let ev = persisted(EventDraft::failed("fetch error: boom"));
        assert_eq!(ev.status(), Some(JobStatus::Failed));
        assert!(ev.is_terminal());
        assert_eq!(ev.data["error"], "fetch error: boom");
    }

    #[test]
    fn progress_is_not_a_status() {
        let ev = persisted(EventDraft::progress("fetch", 10, "Preparing workspace"));
        assert_eq!(ev.status(), None);
        assert!(!ev.is_terminal());
    }

    #[test]
    fn progress_percent_clamped() {
        let d = EventDraft::progress("chunk", 250, "x");
        assert_eq!(d.data["percent"], 100);
    }

    #[test]
    fn chunk_payload_fields() {
        let d = EventDraft::chunk(0, 50, 1);
        assert_eq!(d.data["chunk_index"], 0);
        assert_eq!(d.data["token_count"], 50);
        assert_eq!(d.data["file_count"], 1);
    }

    #[test]
    fn kind_display_parse() {
        for k in [
            EventKind::Status,
            EventKind::Progress,
            EventKind::Chunk,
            EventKind::Repomap,
            EventKind::Tokens,
        ] {
            assert_eq!(k.to_string().parse::<EventKind>().unwrap(), k);
        }
    }
}
