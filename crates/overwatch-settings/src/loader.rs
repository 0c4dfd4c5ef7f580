//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`OverwatchSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `OVERWATCH_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::OverwatchSettings;

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Resolve the path to the settings file (`~/.overwatch/settings.json`).
pub fn settings_path() -> PathBuf {
    home_dir().join(".overwatch").join("settings.json")
}

/// Expand a leading `~/` against `$HOME`.
pub fn resolve_path(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(raw),
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<OverwatchSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<OverwatchSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults deep-merged with the file at `path`, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<OverwatchSettings> {
    let defaults = serde_json::to_value(OverwatchSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
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

/// Apply `OVERWATCH_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut OverwatchSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_overrides<F>(settings: &mut OverwatchSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("OVERWATCH_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("OVERWATCH_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("OVERWATCH_MAX_SEND_QUEUE", 1, 65_536) {
        settings.server.max_send_queue = v;
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = env.string("OVERWATCH_DATABASE_PATH") {
        settings.storage.database_path = v;
    }
    if let Some(v) = env.string("OVERWATCH_POLICIES_PATH") {
        settings.policies_path = Some(v);
    }

    // ── Generator ───────────────────────────────────────────────────
    if let Some(v) = env.string("OVERWATCH_MODEL") {
        settings.generator.model = v;
    }
    if let Some(v) = env.u64("OVERWATCH_GENERATOR_TIMEOUT_MS", 100, 120_000) {
        settings.generator.timeout_ms = v;
    }
    if let Some(v) = env.string("OVERWATCH_API_BASE_URL") {
        settings.generator.api_base_url = v;
    }

    // ── Lifecycle ───────────────────────────────────────────────────
    if let Some(v) = env.u64("OVERWATCH_STALENESS_SECS", 1, 604_800) {
        settings.lifecycle.staleness_secs = v;
    }
    if let Some(v) = env.u64("OVERWATCH_SWEEP_INTERVAL_SECS", 1, 86_400) {
        settings.lifecycle.sweep_interval_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("OVERWATCH_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("OVERWATCH_PERSIST_WARNINGS") {
        settings.logging.persist_warnings = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean (case-insensitive).
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

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn checked<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.checked(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.checked(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.checked(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.checked(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
