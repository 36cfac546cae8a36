//! Configuration for the repo2gpt service.
//!
//! Settings are loaded once at startup and passed down explicitly; there is
//! no process-wide settings singleton.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{
    DefaultsSettings, RunnerSettings, ServerSettings, Settings, StorageSettings,
    TelemetrySettings,
};
