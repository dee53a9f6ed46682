//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TandemSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `TANDEM_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{BrokerKind, TandemSettings};

/// `~/.tandem/settings.json`
pub fn settings_path() -> PathBuf {
    home_dir().join(".tandem").join("settings.json")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

pub fn load_settings() -> Result<TandemSettings> {
    load_settings_from_path(&settings_path())
}

/// Missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TandemSettings> {
    let defaults = serde_json::to_value(TandemSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TandemSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    validate(&settings)?;
    Ok(settings)
}

/// Objects merge per key; arrays and primitives are replaced; nulls in `source`
/// are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup`. Invalid values are ignored with a warning.
pub fn apply_overrides<F>(settings: &mut TandemSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("TANDEM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("TANDEM_PORT", |s| parse_range::<u16>(s, 0, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("TANDEM_BROKER", parse_broker_kind) {
        settings.broker.kind = v;
    }
    if let Some(v) = env.string("TANDEM_REDIS_URL") {
        settings.broker.redis_url = Some(v);
    }
    if let Some(v) = env.string("TANDEM_DB_PATH") {
        settings.store.database_path = v;
    }
    if let Some(v) = env.string("TANDEM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("TANDEM_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
    if let Some(v) = env.parsed("TANDEM_TASK_IDLE_TIMEOUT_SECS", |s| {
        parse_range::<u64>(s, 1, 86_400)
    }) {
        settings.runtime.task_idle_timeout_secs = v;
    }
    if let Some(v) = env.parsed("TANDEM_RATE_LIMIT", |s| parse_range::<u32>(s, 1, 10_000)) {
        settings.runtime.rate_limit_per_minute = v;
    }
}

fn validate(settings: &TandemSettings) -> Result<()> {
    if settings.broker.kind == BrokerKind::Redis && settings.broker.redis_url.is_none() {
        return Err(SettingsError::InvalidValue(
            "broker.kind is redis but broker.redisUrl is not set".into(),
        ));
    }
    if settings.server.max_message_bytes == 0 {
        return Err(SettingsError::InvalidValue("server.maxMessageBytes must be > 0".into()));
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_broker_kind(val: &str) -> Option<BrokerKind> {
    match val.to_lowercase().as_str() {
        "local" => Some(BrokerKind::Local),
        "redis" => Some(BrokerKind::Redis),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env override, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.max_send_queue, 256);
    }

    #[test]
    fn load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"runtime": {"rateLimitPerMinute": 20}}"#).unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.runtime.rate_limit_per_minute, 20);
        assert_eq!(settings.runtime.task_idle_timeout_secs, 600);
    }

    #[test]
    fn load_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn redis_without_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"broker": {"kind": "redis"}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn overrides_apply_valid_values() {
        let mut settings = TandemSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("TANDEM_PORT", "8088"),
                ("TANDEM_BROKER", "Redis"),
                ("TANDEM_REDIS_URL", "redis://127.0.0.1/"),
                ("TANDEM_RATE_LIMIT", "3"),
                ("TANDEM_LOG_JSON", "off"),
            ]),
        );
        assert_eq!(settings.server.port, 8088);
        assert_eq!(settings.broker.kind, BrokerKind::Redis);
        assert_eq!(settings.broker.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(settings.runtime.rate_limit_per_minute, 3);
        assert!(!settings.logging.json);
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut settings = TandemSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("TANDEM_PORT", "99999"),
                ("TANDEM_BROKER", "kafka"),
                ("TANDEM_TASK_IDLE_TIMEOUT_SECS", "0"),
                ("TANDEM_HOST", ""),
            ]),
        );
        assert_eq!(settings, TandemSettings::default());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_range::<u16>("65535", 0, 65535), Some(65535));
        assert_eq!(parse_range::<u32>("11", 1, 10), None);
        assert_eq!(parse_broker_kind("LOCAL"), Some(BrokerKind::Local));
    }

    #[test]
    fn expand_home_prefix() {
        let expanded = expand_home("~/x/y.db");
        assert!(expanded.ends_with("x/y.db"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_home("/abs/y.db"), PathBuf::from("/abs/y.db"));
    }
}
