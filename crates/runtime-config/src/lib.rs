//! Shared client/CLI configuration types.
//!
//! Both `opsdesk-api-client` and the `opsdesk` binary read `opsdesk.toml`
//! through these types. File discovery and environment overrides live in
//! the CLI crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Canonical config file name.
pub const CONFIG_FILE_NAME: &str = "opsdesk.toml";
/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "OPSDESK_CONFIG";
/// Environment variable overriding `server.auth_token`.
pub const AUTH_TOKEN_ENV: &str = "OPSDESK_TOKEN";

/// Top-level configuration (persisted as `opsdesk.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpsdeskConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub turns: TurnSettings,
    #[serde(default)]
    pub clarifications: ClarificationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_url")]
    pub url: String,
    /// Bearer token issued by the identity provider.
    #[serde(default)]
    pub auth_token: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_stream_path")]
    pub path: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Wall-clock ceiling for one run.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Capacity of the event channel between the run task and its consumer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            path: default_stream_path(),
            model: default_model(),
            max_turns: default_max_turns(),
            run_timeout_secs: default_run_timeout_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamSettings {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Longest accepted turn window (one day).
pub const MAX_TURN_WINDOW_MS: u64 = 86_400_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSettings {
    /// How far before a user message an event may still belong to its turn.
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
    /// Events further than this before a user message belong to the previous turn.
    #[serde(default = "default_guard_ms")]
    pub guard_ms: u64,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            tolerance_ms: default_tolerance_ms(),
            guard_ms: default_guard_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ClarificationMode,
    #[serde(default = "default_clarifications_path")]
    pub path: String,
    /// Compiled clarification dataset (JSON) for local resolution.
    #[serde(default)]
    pub catalog_path: String,
    /// Cached system-default query results (JSON).
    #[serde(default)]
    pub system_defaults_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retry_delays_secs")]
    pub retry_delays_secs: Vec<u64>,
}

impl Default for ClarificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ClarificationMode::Auto,
            path: default_clarifications_path(),
            catalog_path: String::new(),
            system_defaults_path: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_delays_secs: default_retry_delays_secs(),
        }
    }
}

impl ClarificationSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationMode {
    /// Use the clarification service, resolving locally when it is unavailable.
    #[default]
    #[serde(alias = "remote", alias = "service")]
    Auto,
    /// Never contact the service; resolve from the local catalog only.
    #[serde(alias = "offline")]
    Local,
    /// Unknown/invalid values are normalized by compatibility fallbacks.
    #[serde(other)]
    Unknown,
}

// ── Serde default functions ─────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_server_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_stream_path() -> String {
    "/api/v1/query/stream".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}
fn default_max_turns() -> u32 {
    15
}
fn default_run_timeout_secs() -> u64 {
    600
}
fn default_channel_capacity() -> usize {
    256
}
fn default_tolerance_ms() -> u64 {
    1_000
}
fn default_guard_ms() -> u64 {
    5_000
}
fn default_clarifications_path() -> String {
    "/api/v1/clarifications".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_retry_delays_secs() -> Vec<u64> {
    vec![1, 2, 4]
}

/// Parse `opsdesk.toml` contents and apply compatibility fallbacks.
pub fn parse_config(raw: &str) -> Result<OpsdeskConfig, toml::de::Error> {
    let root: toml::Value = toml::from_str(raw)?;
    let mut config: OpsdeskConfig = root.clone().try_into()?;
    apply_compat_fallbacks(&mut config, Some(&root));
    Ok(config)
}

/// Apply compatibility fallbacks after loading raw TOML.
/// Returns true when any field was updated.
pub fn apply_compat_fallbacks(config: &mut OpsdeskConfig, root: Option<&toml::Value>) -> bool {
    let mut changed = false;

    if config.server.auth_token.is_empty() {
        let legacy = root
            .and_then(|root| root.get("server"))
            .and_then(|server| server.get("api_key"))
            .and_then(toml::Value::as_str)
            .filter(|key| !key.is_empty());
        if let Some(key) = legacy {
            config.server.auth_token = key.to_string();
            changed = true;
        }
    }

    changed |= reset_if_blank(&mut config.server.url, default_server_url);
    changed |= reset_if_blank(&mut config.stream.path, default_stream_path);
    changed |= reset_if_blank(&mut config.stream.model, default_model);
    changed |= reset_if_blank(&mut config.clarifications.path, default_clarifications_path);
    changed |= reset_if_zero(&mut config.stream.max_turns, default_max_turns());
    changed |= reset_if_zero(&mut config.stream.run_timeout_secs, default_run_timeout_secs());
    changed |= reset_if_zero(&mut config.stream.channel_capacity, default_channel_capacity());
    changed |= reset_if_zero(
        &mut config.clarifications.request_timeout_secs,
        default_request_timeout_secs(),
    );

    if config.turns.guard_ms < config.turns.tolerance_ms
        || config.turns.guard_ms > MAX_TURN_WINDOW_MS
    {
        config.turns = TurnSettings::default();
        changed = true;
    }

    if config.clarifications.mode == ClarificationMode::Unknown {
        config.clarifications.mode = ClarificationMode::Auto;
        changed = true;
    }

    changed
}

fn reset_if_blank(value: &mut String, default: fn() -> String) -> bool {
    if !value.trim().is_empty() {
        return false;
    }
    *value = default();
    true
}

fn reset_if_zero<T: PartialEq + Default>(value: &mut T, default: T) -> bool {
    if *value != T::default() {
        return false;
    }
    *value = default;
    true
}
