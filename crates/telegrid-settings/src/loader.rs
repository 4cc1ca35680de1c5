//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If `~/.telegrid/settings.json` exists, deep-merge user values over
//!    defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::Settings;

/// Resolve the path to the settings file (`~/.telegrid/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".telegrid").join("settings.json")
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
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Some(v) = read_env_string("TELEGRID_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("TELEGRID_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_usize("TELEGRID_SEND_QUEUE", 1, 1_000_000) {
        settings.server.send_queue_capacity = v;
    }
    if let Some(v) = read_env_u64("TELEGRID_HEARTBEAT_SECS", 1, 3600) {
        settings.server.heartbeat_interval_secs = v;
    }

    if let Some(v) = read_env_string("TELEGRID_MQTT_HOST") {
        settings.mqtt.host = v;
    }
    if let Some(v) = read_env_u16("TELEGRID_MQTT_PORT", 1, 65535) {
        settings.mqtt.port = v;
    }
    if let Some(v) = read_env_string("TELEGRID_MQTT_USERNAME") {
        settings.mqtt.username = Some(v);
    }
    if let Some(v) = read_env_string("TELEGRID_MQTT_PASSWORD") {
        settings.mqtt.password = Some(v);
    }
    if let Some(v) = read_env_string("TELEGRID_MQTT_TOPIC_PREFIX") {
        settings.mqtt.topic_prefix = v;
    }

    if let Some(v) = read_env_string("TELEGRID_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some(v) = read_env_usize("TELEGRID_WRITER_QUEUE", 1, 1_000_000) {
        settings.storage.writer_queue_capacity = v;
    }

    if let Some(v) = read_env_string("TELEGRID_LOG_LEVEL") {
        settings.observability.log_level = v;
    }
    if let Some(v) = read_env_bool("TELEGRID_LOG_TO_SQLITE") {
        settings.observability.log_to_sqlite = v;
    }
    if let Some(v) = read_env_bool("TELEGRID_METRICS_ENABLED") {
        settings.observability.metrics_enabled = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_nested_objects() {
        let target = json!({"server": {"port": 8080, "host": "0.0.0.0"}});
        let source = json!({"server": {"port": 9000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9000);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn deep_merge_skips_nulls() {
        let target = json!({"mqtt": {"host": "broker.local"}});
        let source = json!({"mqtt": {"host": null}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["mqtt"]["host"], "broker.local");
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let target = json!({"list": [1, 2, 3]});
        let source = json!({"list": [4]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["list"], json!([4]));
    }

    #[test]
    fn parse_bool_spellings() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges_reject_out_of_bounds() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("30", 1, 3600), Some(30));
        assert_eq!(parse_u64_range("9999", 1, 3600), None);
        assert_eq!(parse_usize_range("abc", 1, 10), None);
    }

    #[test]
    fn missing_file_returns_defaults() {
        let settings =
            load_settings_from_path(Path::new("/nonexistent/telegrid/settings.json")).unwrap();
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9000}, "mqtt": {"host": "broker.field.example"}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.mqtt.host, "broker.field.example");
        // Untouched sections keep defaults.
        assert_eq!(settings.server.send_queue_capacity, 256);
        assert_eq!(settings.storage.db_path, "telegrid.db");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_settings_from_path(&path).is_err());
    }
}
