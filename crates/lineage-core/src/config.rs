//! Settings resolution for Lineage.
//!
//! Implements hierarchical settings resolution:
//! 1. Built-in defaults
//! 2. Global settings (~/.config/lineage/settings.json)
//! 3. Project settings (.lineage/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Lineage settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub wait: WaitSettings,
    /// Process-level default job parameters, applied beneath caller parameters.
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub log_json: bool,
}

/// Remote process service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Service base URL (e.g. `http://localhost:8001`).
    pub base_url: Option<String>,
    /// API key sent in the `Authorization` header.
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout_secs: 30,
        }
    }
}

/// Polling, retry and kill-wait timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSettings {
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Bound on the confirmation wait that follows a synchronous kill.
    pub kill_wait_timeout_ms: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            kill_wait_timeout_ms: 10_000,
        }
    }
}

impl WaitSettings {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub const fn kill_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_wait_timeout_ms)
    }
}

/// One settings file. Only the fields a file sets are applied on top of the
/// layers beneath it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsLayer {
    pub client: ClientLayer,
    pub wait: WaitLayer,
    pub defaults: Map<String, Value>,
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientLayer {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WaitLayer {
    pub poll_interval_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub kill_wait_timeout_ms: Option<u64>,
}

/// Load settings with hierarchical resolution.
pub fn load_settings(project_dir: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();

    if let Some(global_path) = global_settings_path()
        && global_path.exists()
    {
        let global = load_settings_file(&global_path)?;
        merge_settings(&mut settings, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".lineage").join("settings.json");
        if project_path.exists() {
            let project = load_settings_file(&project_path)?;
            merge_settings(&mut settings, project);
        }
    }

    apply_env_overrides(&mut settings);

    Ok(settings)
}

/// Get the global settings file path.
pub fn global_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("lineage").join("settings.json"))
}

/// Read a single settings file.
pub fn load_settings_file(path: &Path) -> Result<SettingsLayer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read settings file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse settings file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Apply the fields `layer` sets onto `base`. `defaults` entries are merged
/// key by key.
pub fn merge_settings(base: &mut Settings, layer: SettingsLayer) {
    let SettingsLayer {
        client,
        wait,
        defaults,
        log_json,
    } = layer;

    if client.base_url.is_some() {
        base.client.base_url = client.base_url;
    }
    if client.api_key.is_some() {
        base.client.api_key = client.api_key;
    }
    set(&mut base.client.request_timeout_secs, client.request_timeout_secs);

    set(&mut base.wait.poll_interval_ms, wait.poll_interval_ms);
    set(&mut base.wait.retry_attempts, wait.retry_attempts);
    set(&mut base.wait.retry_delay_ms, wait.retry_delay_ms);
    set(&mut base.wait.kill_wait_timeout_ms, wait.kill_wait_timeout_ms);

    base.defaults.extend(defaults);

    set(&mut base.log_json, log_json);
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Apply `LINEAGE_*` overrides read through `lookup`.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("LINEAGE_BASE_URL") {
        settings.client.base_url = Some(val);
    }
    if let Some(val) = lookup("LINEAGE_API_KEY") {
        settings.client.api_key = Some(val);
    }
    if let Some(val) = lookup("LINEAGE_POLL_INTERVAL_MS")
        && let Ok(n) = val.parse()
    {
        settings.wait.poll_interval_ms = n;
    }
    if let Some(val) = lookup("LINEAGE_LOG_JSON") {
        settings.log_json = matches!(val.as_str(), "1" | "true" | "yes");
    }
}
