use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings object, mirrored by `~/.repo2gpt/settings.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub server: ServerSettings,
    pub runner: RunnerSettings,
    pub storage: StorageSettings,
    pub telemetry: TelemetrySettings,
    pub defaults: DefaultsSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// When set, `/jobs` routes require a matching `X-API-Key` header.
    pub api_key: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub allow_local_sources: bool,
    /// Largest accepted `POST /jobs` body; uploads arrive base64-encoded inline.
    pub max_upload_bytes: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            api_key: None,
            heartbeat_interval_ms: 5_000,
            allow_local_sources: false,
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerSettings {
    pub workers: usize,
    pub fetch_timeout_secs: u64,
    /// Fallback poll for pending jobs when no submission wakes a worker.
    pub poll_interval_ms: u64,
    pub event_channel_capacity: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            fetch_timeout_secs: 300,
            poll_interval_ms: 2_000,
            event_channel_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSettings {
    /// Root directory; relative database paths resolve against it.
    pub data_dir: String,
    pub database_file: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: home_dir().join(".repo2gpt").to_string_lossy().into_owned(),
            database_file: "jobs.db".into(),
        }
    }
}

impl StorageSettings {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.database_file)
    }

    /// Scratch space for fetched source trees.
    pub fn workspace_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("workspaces")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetrySettings {
    pub log_level: String,
    pub log_to_sqlite: bool,
    pub log_database_file: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_to_sqlite: true,
            log_database_file: "logs.db".into(),
        }
    }
}

/// Job-level defaults applied when a submission leaves a field unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultsSettings {
    pub chunk_token_limit: u64,
    pub max_file_bytes: u64,
    /// HuggingFace `tokenizer.json` for exact counts; needs the `hf-tokenizer` feature.
    pub tokenizer_file: Option<PathBuf>,
}

impl Default for DefaultsSettings {
    fn default() -> Self {
        Self {
            chunk_token_limit: 0,
            max_file_bytes: 500_000,
            tokenizer_file: None,
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
