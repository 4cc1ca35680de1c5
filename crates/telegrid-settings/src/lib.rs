//! Layered configuration: compiled defaults, optional
//! `~/.telegrid/settings.json` deep-merged over them, and `TELEGRID_*`
//! environment overrides on top.

mod errors;
mod loader;
mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{MqttSettings, ObservabilitySettings, ServerSettings, Settings, StorageSettings};
