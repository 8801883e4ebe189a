//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.chatrelay/config.json`) and environment.
//! Environment variables (`GEMINI_API_KEYS`, `PORT`, `ALLOWED_ORIGINS`, ...) override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP + WebSocket server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Credentials per provider family.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Relay tuning (identify timeout, history window, provider timeout).
    #[serde(default)]
    pub relay: RelayConfig,

    /// Key pool cool-down policy.
    #[serde(default)]
    pub key_pool: KeyPoolConfig,

    /// Session persistence.
    #[serde(default)]
    pub store: StoreConfig,

    /// Audio transcription backend.
    #[serde(default)]
    pub transcription: TranscriptionConfig,
}

/// Server bind, port, and CORS settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP and WebSocket (default 3000). Overridden by PORT env.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Allowed cross-origin origins. Empty means any origin. Overridden by ALLOWED_ORIGINS env.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_port() -> u16 {
    3000
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Credentials for one provider family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredentials {
    /// API keys tried in order; the pool rotates across them.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Override the provider's API base URL (e.g. a proxy).
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default)]
    pub gemini: ProviderCredentials,
    #[serde(default)]
    pub anthropic: ProviderCredentials,
    #[serde(default)]
    pub openai: ProviderCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// How long a new connection may stay unidentified before it is treated as a chatbot.
    #[serde(default = "default_identify_timeout_ms")]
    pub identify_timeout_ms: u64,
    /// Number of most-recent turns kept in memory and sent to providers.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Upper bound for a single provider call.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Maximum number of summaries returned by GET /api/sessions.
    #[serde(default = "default_session_list_limit")]
    pub session_list_limit: usize,
}

fn default_identify_timeout_ms() -> u64 {
    2000
}

fn default_history_window() -> usize {
    10
}

fn default_provider_timeout_secs() -> u64 {
    45
}

fn default_session_list_limit() -> usize {
    100
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            identify_timeout_ms: default_identify_timeout_ms(),
            history_window: default_history_window(),
            provider_timeout_secs: default_provider_timeout_secs(),
            session_list_limit: default_session_list_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPoolConfig {
    /// Consecutive failures after which a key is blocked (default 3).
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Cool-down for a blocked key, in seconds (default 60).
    #[serde(default = "default_block_seconds")]
    pub block_seconds: u64,
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_block_seconds() -> u64 {
    60
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            block_seconds: default_block_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Sessions file (default ~/.chatrelay/sessions.json).
    pub path: Option<PathBuf>,
}

/// Which transcription service handles `transcribe_audio`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionBackend {
    /// Transcription disabled; requests are answered with an error event.
    #[default]
    None,
    Deepgram,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionConfig {
    #[serde(default)]
    pub backend: TranscriptionBackend,
    /// Deepgram API key. Overridden by DEEPGRAM_API_KEY env.
    pub api_key: Option<String>,
}

/// Read an env var, trimmed; None when unset or blank.
fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Parse a transcription backend name; unknown names fall back to `None`.
pub fn parse_transcription_backend(s: &str) -> TranscriptionBackend {
    match s.trim().to_lowercase().as_str() {
        "deepgram" => TranscriptionBackend::Deepgram,
        "none" | "" => TranscriptionBackend::None,
        other => {
            log::warn!("unknown transcription backend {:?}, transcription disabled", other);
            TranscriptionBackend::None
        }
    }
}

impl Config {
    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Some(keys) = env_non_empty("GEMINI_API_KEYS").or_else(|| env_non_empty("GEMINI_API_KEY")) {
            self.providers.gemini.api_keys = parse_csv(&keys);
        }
        if let Some(keys) = env_non_empty("ANTHROPIC_API_KEYS").or_else(|| env_non_empty("ANTHROPIC_API_KEY")) {
            self.providers.anthropic.api_keys = parse_csv(&keys);
        }
        if let Some(keys) = env_non_empty("OPENAI_API_KEYS").or_else(|| env_non_empty("OPENAI_API_KEY")) {
            self.providers.openai.api_keys = parse_csv(&keys);
        }
        if let Some(origins) = env_non_empty("ALLOWED_ORIGINS") {
            self.server.allowed_origins = parse_csv(&origins);
        }
        if let Some(port) = env_non_empty("PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => log::warn!("ignoring invalid PORT {:?}", port),
            }
        }
        if let Some(backend) = env_non_empty("TRANSCRIPTION_BACKEND") {
            self.transcription.backend = parse_transcription_backend(&backend);
        }
        if let Some(key) = env_non_empty("DEEPGRAM_API_KEY") {
            self.transcription.api_key = Some(key);
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".chatrelay"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CHATRELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir().join("config.json"))
}

/// Resolve the sessions file: `store.path` when set, else `~/.chatrelay/sessions.json`.
pub fn resolve_store_path(config: &Config) -> PathBuf {
    config
        .store
        .path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| data_dir().join("sessions.json"))
}

/// Load config from the given path (or CHATRELAY_CONFIG_PATH / default), then apply env
/// overrides. Missing file => default config.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config.apply_env();
    Ok((config, path))
}
