use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::decoder::DecoderConfig;
use crate::errors::{PilotError, PilotResult};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub apps: AppsConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Chat-completions base URL; `/chat/completions` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Empty means "send the EMPTY placeholder".
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f64,
    /// Hosts that reject `frequency_penalty`.
    #[serde(default = "default_omit_penalty_hosts")]
    pub omit_frequency_penalty_hosts: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000/v1".into()
}

fn default_model() -> String {
    "autoglm-phone-9b".into()
}

fn default_max_tokens() -> u32 {
    3000
}

fn default_top_p() -> f64 {
    0.85
}

fn default_frequency_penalty() -> f64 {
    0.2
}

fn default_omit_penalty_hosts() -> Vec<String> {
    vec!["dashscope.aliyuncs.com".into()]
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            top_p: default_top_p(),
            frequency_penalty: default_frequency_penalty(),
            omit_frequency_penalty_hosts: default_omit_penalty_hosts(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_action_retries")]
    pub max_action_retries: u32,
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: u32,
    #[serde(default = "default_transport_retry_delay")]
    pub transport_retry_delay_ms: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_self_observation_delay")]
    pub self_observation_delay_ms: u64,
    /// Consecutive unparseable replies tolerated before the run fails.
    #[serde(default = "default_max_format_retries")]
    pub max_format_retries: u32,
    #[serde(default = "default_blank_threshold")]
    pub blank_threshold: f64,
    /// Identifier of the app hosting the agent; never acted upon.
    #[serde(default)]
    pub host_app: Option<String>,
    #[serde(default = "default_true")]
    pub record_sessions: bool,
}

fn default_max_steps() -> u32 {
    50
}

fn default_max_action_retries() -> u32 {
    10
}

fn default_max_transport_retries() -> u32 {
    2
}

fn default_transport_retry_delay() -> u64 {
    2000
}

fn default_settle_delay() -> u64 {
    1000
}

fn default_self_observation_delay() -> u64 {
    2000
}

fn default_max_format_retries() -> u32 {
    5
}

fn default_blank_threshold() -> f64 {
    0.98
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_action_retries: default_max_action_retries(),
            max_transport_retries: default_max_transport_retries(),
            transport_retry_delay_ms: default_transport_retry_delay(),
            settle_delay_ms: default_settle_delay(),
            self_observation_delay_ms: default_self_observation_delay(),
            max_format_retries: default_max_format_retries(),
            blank_threshold: default_blank_threshold(),
            host_app: None,
            record_sessions: true,
        }
    }
}

impl AgentConfig {
    pub fn transport_retry_delay(&self) -> Duration {
        Duration::from_millis(self.transport_retry_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn self_observation_delay(&self) -> Duration {
        Duration::from_millis(self.self_observation_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Values below 1.0 shrink the screenshot before it is sent.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_scale_factor() -> f64 {
    1.0
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            scale_factor: default_scale_factor(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppsConfig {
    /// JSON object of app name → package, merged over the built-in table.
    #[serde(default)]
    pub mapping_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    #[serde(default)]
    pub serial: Option<String>,
    /// Pause after a launch so the app can draw its first frame.
    #[serde(default = "default_launch_wait")]
    pub launch_wait_ms: u64,
}

fn default_adb_path() -> String {
    "adb".into()
}

fn default_launch_wait() -> u64 {
    1000
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            serial: None,
            launch_wait_ms: default_launch_wait(),
        }
    }
}

impl AppConfig {
    /// Apply `PHONEPILOT_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key: &str, slot: &mut String| {
            if let Some(v) = lookup(key).filter(|v| !v.trim().is_empty()) {
                tracing::debug!(key, "config overridden from environment");
                *slot = v;
            }
        };
        set("PHONEPILOT_API_KEY", &mut self.llm.api_key);
        set("PHONEPILOT_BASE_URL", &mut self.llm.base_url);
        set("PHONEPILOT_MODEL", &mut self.llm.model);
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join(CONFIG_FILE);
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Some(candidate);
            }
        }
    }

    let candidate = std::env::current_dir().ok()?.join(CONFIG_FILE);
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Some(candidate);
    }
    None
}

/// Load from an explicit path; a missing file is an error here.
pub fn load_config_from(path: &Path) -> PilotResult<AppConfig> {
    if !path.exists() {
        return Err(PilotError::Config(format!(
            "config file {} does not exist",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let mut config: AppConfig = toml::from_str(&content)?;
    config.apply_env();
    tracing::info!(path = %path.display(), model = %config.llm.model, "config loaded");
    Ok(config)
}

/// Explicit path, else `config.toml` next to the executable or in the
/// working directory, else built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> PilotResult<AppConfig> {
    if let Some(path) = explicit {
        return load_config_from(path);
    }
    match resolve_config_path() {
        Some(path) => load_config_from(&path),
        None => {
            tracing::info!("no config.toml found, using defaults");
            let mut config = AppConfig::default();
            config.apply_env();
            Ok(config)
        }
    }
}

pub fn save_config(config: &AppConfig, path: &Path) -> PilotResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.agent.max_steps, 50);
        assert_eq!(config.agent.max_action_retries, 10);
        assert_eq!(config.agent.max_transport_retries, 2);
        assert_eq!(config.llm.max_tokens, 3000);
        assert_eq!(config.llm.top_p, 0.85);
        assert_eq!(config.llm.omit_frequency_penalty_hosts, vec!["dashscope.aliyuncs.com"]);
        assert_eq!(config.image.jpeg_quality, 80);
        assert!(config.decoder.launch_verbs.iter().any(|v| v == "打开"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [llm]
            model = "glm-4v"

            [agent]
            max_steps = 10
            host_app = "com.example.pilot"
            "#,
        )
        .unwrap();
        assert_eq!(config.llm.model, "glm-4v");
        assert_eq!(config.llm.request_timeout_secs, 120);
        assert_eq!(config.agent.max_steps, 10);
        assert_eq!(config.agent.settle_delay_ms, 1000);
        assert_eq!(config.agent.host_app.as_deref(), Some("com.example.pilot"));
    }

    #[test]
    fn save_then_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.llm.base_url = "https://example.test/v1".into();
        config.device.serial = Some("emulator-5554".into());
        save_config(&config, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: AppConfig = toml::from_str(&content).unwrap();
        assert_eq!(loaded.llm.base_url, "https://example.test/v1");
        assert_eq!(loaded.device.serial.as_deref(), Some("emulator-5554"));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, PilotError::Config(_)));
    }

    #[test]
    fn overrides_replace_non_empty_values_only() {
        let mut config = AppConfig::default();
        config.apply_overrides(|key| match key {
            "PHONEPILOT_API_KEY" => Some("sk-test".into()),
            "PHONEPILOT_MODEL" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(config.llm.api_key, "sk-test");
        assert_eq!(config.llm.model, default_model());
    }
}
