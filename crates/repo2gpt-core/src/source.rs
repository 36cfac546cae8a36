use serde::{Deserialize, Serialize};

/// Where a job obtains its file tree.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    Git {
        url: String,
        #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    ArchiveUrl {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    ArchiveUpload {
        filename: String,
        content_base64: String,
    },
    /// An existing directory on the server host. Only honoured when enabled in settings.
    Local { path: String },
}

impl SourceSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Git { .. } => "git",
            Self::ArchiveUrl { .. } => "archive_url",
            Self::ArchiveUpload { .. } => "archive_upload",
            Self::Local { .. } => "local",
        }
    }
}

// Uploaded archives can be megabytes of base64; keep them out of logs.
impl std::fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git { url, reference } => f
                .debug_struct("Git")
                .field("url", url)
                .field("reference", reference)
                .finish(),
            Self::ArchiveUrl { url, filename } => f
                .debug_struct("ArchiveUrl")
                .field("url", url)
                .field("filename", filename)
                .finish(),
            Self::ArchiveUpload {
                filename,
                content_base64,
            } => f
                .debug_struct("ArchiveUpload")
                .field("filename", filename)
                .field("content_len", &content_base64.len())
                .finish(),
            Self::Local { path } => f.debug_struct("Local").field("path", path).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn git_ref_field_name() {
        let spec: SourceSpec = serde_json::from_value(json!({
            "type": "git", "url": "https://example.com/x.git", "ref": "main"
        }))
        .unwrap();
        assert_eq!(
            spec,
            SourceSpec::Git {
                url: "https://example.com/x.git".into(),
                reference: Some("main".into()),
            }
        );
        assert_eq!(spec.kind(), "git");
    }

    #[test]
    fn archive_upload_parses() {
        let spec: SourceSpec = serde_json::from_value(json!({
            "type": "archive_upload", "filename": "repo.zip", "content_base64": "UEsDBA=="
        }))
        .unwrap();
        assert_eq!(spec.kind(), "archive_upload");
    }

    #[test]
    fn unknown_type_rejected() {
        let res: Result<SourceSpec, _> =
            serde_json::from_value(json!({"type": "svn", "url": "x"}));
        assert!(res.is_err());
    }

    #[test]
    fn debug_hides_upload_payload() {
        let spec = SourceSpec::ArchiveUpload {
            filename: "r.tar.gz".into(),
            content_base64: "QUFBQUFB".into(),
        };
        let dbg = format!("{spec:?}");
        assert!(!dbg.contains("QUFBQUFB"));
        assert!(dbg.contains("content_len"));
    }
}
