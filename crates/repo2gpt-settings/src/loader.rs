//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `REPO2GPT_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::Settings;

/// Resolve the settings file: `$REPO2GPT_SETTINGS`, else `~/.repo2gpt/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(p) = std::env::var("REPO2GPT_SETTINGS")
        .ok()
        .filter(|v| !v.is_empty())
    {
        return PathBuf::from(p);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".repo2gpt").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut settings = load_file(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup` (normally the process environment).
///
/// Invalid values are ignored with a warning and the file/default value is kept.
pub fn apply_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("REPO2GPT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("REPO2GPT_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.string("REPO2GPT_API_KEY") {
        settings.server.api_key = Some(v);
    }
    if let Some(v) = env.u64("REPO2GPT_HEARTBEAT_MS", 100, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.bool("REPO2GPT_ALLOW_LOCAL_SOURCES") {
        settings.server.allow_local_sources = v;
    }
    if let Some(v) = env.u64("REPO2GPT_MAX_UPLOAD_BYTES", 1024, u64::MAX) {
        settings.server.max_upload_bytes = v;
    }

    // ── Runner ──────────────────────────────────────────────────────
    if let Some(v) = env.u64("REPO2GPT_WORKERS", 1, 256) {
        settings.runner.workers = v as usize;
    }
    if let Some(v) = env.u64("REPO2GPT_FETCH_TIMEOUT_SECS", 1, 86_400) {
        settings.runner.fetch_timeout_secs = v;
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = env.string("REPO2GPT_STORAGE_ROOT") {
        settings.storage.data_dir = v;
    }

    // ── Telemetry ───────────────────────────────────────────────────
    if let Some(v) = env.string("REPO2GPT_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }

    // ── Job defaults ────────────────────────────────────────────────
    if let Some(v) = env.u64("REPO2GPT_CHUNK_TOKEN_LIMIT", 0, u64::MAX) {
        settings.defaults.chunk_token_limit = v;
    }
    if let Some(v) = env.u64("REPO2GPT_MAX_FILE_BYTES", 0, u64::MAX) {
        settings.defaults.max_file_bytes = v;
    }
    if let Some(v) = env.string("REPO2GPT_TOKENIZER_FILE") {
        settings.defaults.tokenizer_file = Some(v.into());
    }
}

fn validate(settings: &Settings) -> Result<()> {
    if settings.runner.workers == 0 {
        return Err(SettingsError::InvalidValue(
            "runner.workers must be at least 1".into(),
        ));
    }
    if settings.runner.event_channel_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "runner.eventChannelCapacity must be at least 1".into(),
        ));
    }
    if settings.server.heartbeat_interval_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "server.heartbeatIntervalMs must be positive".into(),
        ));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}
