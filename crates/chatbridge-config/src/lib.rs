use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_CHATBRIDGE_CONFIG: &str = "CHATBRIDGE_CONFIG";
pub const ENV_TELEGRAM_TOKEN: &str = "CHATBRIDGE_TELEGRAM_TOKEN";
pub const ENV_WHATSAPP_ALLOWED_SENDER: &str = "CHATBRIDGE_WHATSAPP_ALLOWED_SENDER";

const DEFAULT_WHATSAPP_BRIDGE_LISTEN_ADDR: &str = ":8090";
const DEFAULT_CODEX_BINARY: &str = "codex";
const DEFAULT_CLAUDE_BINARY: &str = "claude";
const DEFAULT_EXECUTOR_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 8;
const DEFAULT_PER_SESSION_BUFFER: usize = 64;
const DEFAULT_BATCH_INTERVAL_MS: u64 = 400;
const DEFAULT_MAX_CHUNK_BYTES: usize = 3500;
const DEFAULT_SQLITE_PATH: &str = "chatbridge.db";
const DEFAULT_SESSION_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

const MIN_BATCH_INTERVAL_MS: u64 = 300;
const MAX_BATCH_INTERVAL_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub telegram: TelegramConfigToml,
    #[serde(default)]
    pub whatsapp: WhatsAppConfigToml,
    #[serde(default)]
    pub executor: ExecutorConfigToml,
    #[serde(default)]
    pub queue: QueueConfigToml,
    #[serde(default)]
    pub stream: StreamConfigToml,
    #[serde(default)]
    pub security: SecurityConfigToml,
    #[serde(default)]
    pub storage: StorageConfigToml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelegramConfigToml {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub allowed_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhatsAppConfigToml {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_whatsapp_bridge_listen_addr")]
    pub bridge_listen_addr: String,
    #[serde(default)]
    pub allowed_sender_id: String,
}

impl Default for WhatsAppConfigToml {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_listen_addr: default_whatsapp_bridge_listen_addr(),
            allowed_sender_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfigToml {
    #[serde(default = "default_codex_binary")]
    pub codex_binary: String,
    #[serde(default = "default_claude_binary")]
    pub claude_binary: String,
    #[serde(default = "default_executor_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExecutorConfigToml {
    fn default() -> Self {
        Self {
            codex_binary: default_codex_binary(),
            claude_binary: default_claude_binary(),
            timeout_secs: default_executor_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfigToml {
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_per_session_buffer")]
    pub per_session_buffer: usize,
}

impl Default for QueueConfigToml {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            per_session_buffer: default_per_session_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamConfigToml {
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl Default for StreamConfigToml {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityConfigToml {
    #[serde(default = "default_allowlist_commands")]
    pub allowlist_commands: Vec<String>,
    #[serde(default)]
    pub project_root: String,
}

impl Default for SecurityConfigToml {
    fn default() -> Self {
        Self {
            allowlist_commands: default_allowlist_commands(),
            project_root: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfigToml {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
}

impl Default for StorageConfigToml {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            session_retention_secs: default_session_retention_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.stream.batch_interval_ms)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.storage.session_retention_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.enabled && self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::configuration(
                "telegram.bot_token is required when telegram.enabled = true",
            ));
        }
        if self.storage.sqlite_path.trim().is_empty() {
            return Err(ConfigError::configuration("storage.sqlite_path is required"));
        }
        if self.stream.batch_interval_ms < MIN_BATCH_INTERVAL_MS
            || self.stream.batch_interval_ms > MAX_BATCH_INTERVAL_MS
        {
            return Err(ConfigError::configuration(format!(
                "stream.batch_interval_ms must be between {MIN_BATCH_INTERVAL_MS} and {MAX_BATCH_INTERVAL_MS}: got {}",
                self.stream.batch_interval_ms
            )));
        }
        if self.queue.max_concurrent_sessions == 0 {
            return Err(ConfigError::configuration(
                "queue.max_concurrent_sessions must be > 0",
            ));
        }
        if self.queue.per_session_buffer == 0 {
            return Err(ConfigError::configuration(
                "queue.per_session_buffer must be > 0",
            ));
        }
        if self
            .security
            .allowlist_commands
            .iter()
            .all(|name| name.trim().is_empty())
        {
            return Err(ConfigError::configuration(
                "security.allowlist_commands cannot be empty",
            ));
        }
        if self.security.project_root.trim().is_empty() {
            return Err(ConfigError::configuration(
                "security.project_root cannot be empty",
            ));
        }
        Ok(())
    }
}

/// Loads the config file named by `CHATBRIDGE_CONFIG` (or the default path),
/// applies environment overrides, and validates.
pub fn load_from_env() -> Result<BrokerConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<BrokerConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ConfigError::configuration(format!(
            "failed to read config from {}: {err}",
            path.display()
        ))
    })?;

    let mut config: BrokerConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "failed to parse config from {}: {err}",
            path.display()
        ))
    })?;

    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("unable to resolve home directory from HOME or USERPROFILE")
    })?;
    Ok(home.join(".chatbridge").join("config.toml"))
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_CHATBRIDGE_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "CHATBRIDGE_CONFIG contained invalid UTF-8",
        )),
    }
}

fn apply_env_overrides(config: &mut BrokerConfig) {
    if let Ok(token) = std::env::var(ENV_TELEGRAM_TOKEN) {
        if !token.trim().is_empty() {
            config.telegram.bot_token = token;
        }
    }
    if let Ok(sender) = std::env::var(ENV_WHATSAPP_ALLOWED_SENDER) {
        if !sender.trim().is_empty() {
            config.whatsapp.allowed_sender_id = sender;
        }
    }
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn default_whatsapp_bridge_listen_addr() -> String {
    DEFAULT_WHATSAPP_BRIDGE_LISTEN_ADDR.to_owned()
}

fn default_codex_binary() -> String {
    DEFAULT_CODEX_BINARY.to_owned()
}

fn default_claude_binary() -> String {
    DEFAULT_CLAUDE_BINARY.to_owned()
}

fn default_executor_timeout_secs() -> u64 {
    DEFAULT_EXECUTOR_TIMEOUT_SECS
}

fn default_max_concurrent_sessions() -> usize {
    DEFAULT_MAX_CONCURRENT_SESSIONS
}

fn default_per_session_buffer() -> usize {
    DEFAULT_PER_SESSION_BUFFER
}

fn default_batch_interval_ms() -> u64 {
    DEFAULT_BATCH_INTERVAL_MS
}

fn default_max_chunk_bytes() -> usize {
    DEFAULT_MAX_CHUNK_BYTES
}

fn default_allowlist_commands() -> Vec<String> {
    vec![DEFAULT_CODEX_BINARY.to_owned(), DEFAULT_CLAUDE_BINARY.to_owned()]
}

fn default_sqlite_path() -> String {
    DEFAULT_SQLITE_PATH.to_owned()
}

fn default_session_retention_secs() -> u64 {
    DEFAULT_SESSION_RETENTION_SECS
}
