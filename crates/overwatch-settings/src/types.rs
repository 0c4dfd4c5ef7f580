//! Settings sections. Every struct deserializes from camelCase JSON and
//! fills missing keys from its `Default`.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverwatchSettings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub generator: GeneratorSettings,
    pub engine: EngineSettings,
    pub lifecycle: LifecycleSettings,
    pub logging: LoggingSettings,
    /// Optional JSON file of policies upserted at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policies_path: Option<String>,
}

impl OverwatchSettings {
    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(SettingsError::InvalidValue("server.port must be non-zero".into()));
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue("server.maxSendQueue must be non-zero".into()));
        }
        if self.generator.timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("generator.timeoutMs must be non-zero".into()));
        }
        if self.generator.max_output_chars == 0 {
            return Err(SettingsError::InvalidValue(
                "generator.maxOutputChars must be non-zero".into(),
            ));
        }
        if self.engine.policy_fetch_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "engine.policyFetchAttempts must be at least 1".into(),
            ));
        }
        if self.lifecycle.sweep_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "lifecycle.sweepIntervalSecs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP/WebSocket port.
    pub port: u16,
    /// Per-connection outbound queue depth.
    pub max_send_queue: usize,
    /// WebSocket ping interval.
    pub ping_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_send_queue: 256,
            ping_interval_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite file holding sessions, events, policies and interventions.
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "~/.overwatch/overwatch.db".to_string(),
        }
    }
}

/// Instruction generator backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratorSettings {
    pub model: String,
    /// Upper bound on a single backend call.
    pub timeout_ms: u64,
    pub max_tokens: u32,
    /// Generated text longer than this is truncated.
    pub max_output_chars: usize,
    pub api_base_url: String,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            model: "claude-3-5-haiku-latest".to_string(),
            timeout_ms: 5_000,
            max_tokens: 512,
            max_output_chars: 2_000,
            api_base_url: "https://api.anthropic.com".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub policy_fetch_timeout_ms: u64,
    pub policy_fetch_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy_fetch_timeout_ms: 3_000,
            policy_fetch_attempts: 2,
        }
    }
}

/// Session staleness and sweep cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleSettings {
    pub staleness_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            staleness_secs: 3_600,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level when RUST_LOG is unset.
    pub level: String,
    /// Persist warn+ records to the log database.
    pub persist_warnings: bool,
    pub log_database_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            persist_warnings: true,
            log_database_path: "~/.overwatch/logs.db".to_string(),
        }
    }
}
