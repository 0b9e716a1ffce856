use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TOKEN_K: u64 = 100;
pub const DEFAULT_MAX_TOKENS: u64 = 256;
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_RATE_LIMIT_PREFIX: &str = "rl:chat";

pub const DEFAULT_HISTORY_MESSAGES: usize = 20;
pub const MAX_HISTORY_MESSAGES: usize = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json config error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "gateway-config-yaml")]
    #[error("yaml config error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("toml config error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: String,
    pub backend: BackendConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub history: HistoryConfig,
    pub conversations: PaginationConfig,
    pub store: StoreConfig,
    pub chat_ws: ChatWsConfig,
    pub node_id: u16,
    pub proxy_max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            backend: BackendConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            history: HistoryConfig::default(),
            conversations: PaginationConfig::default(),
            store: StoreConfig::default(),
            chat_ws: ChatWsConfig::default(),
            node_id: 1,
            proxy_max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        Self::parse(&raw, &extension)
    }

    pub fn parse(raw: &str, format: &str) -> Result<Self, ConfigError> {
        let config: Self = match format {
            "json" => serde_json::from_str(raw)?,
            #[cfg(feature = "gateway-config-yaml")]
            "yaml" | "yml" => serde_yaml::from_str(raw)?,
            "toml" => toml::from_str(raw)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.base_url is required".to_string()));
        }
        if self.node_id > crate::gateway::ids::MAX_NODE_ID {
            return Err(ConfigError::Invalid(format!(
                "node_id must be <= {}",
                crate::gateway::ids::MAX_NODE_ID
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            connect_timeout_secs: 10,
            request_timeout_secs: None,
            headers: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("headers", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub jwt_secret_env: Option<String>,
    pub login_device_max: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_secret_env: None,
            login_device_max: 3,
        }
    }
}

impl AuthConfig {
    /// Inline secret wins over the environment variable.
    pub fn resolve_secret(&self) -> Result<String, ConfigError> {
        if let Some(secret) = self.jwt_secret.as_deref().map(str::trim) {
            if !secret.is_empty() {
                return Ok(secret.to_string());
            }
        }
        if let Some(name) = self.jwt_secret_env.as_deref() {
            if let Ok(secret) = std::env::var(name) {
                if !secret.trim().is_empty() {
                    return Ok(secret.trim().to_string());
                }
            }
            return Err(ConfigError::Invalid(format!("env {name} is empty or unset")));
        }
        Err(ConfigError::Invalid("auth.jwt_secret is required".to_string()))
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("jwt_secret_env", &self.jwt_secret_env)
            .field("login_device_max", &self.login_device_max)
            .finish()
    }
}

/// Raw rate-limit parameters as written in the config file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub request_per_min: i64,
    pub token_per_min: i64,
    pub token_k: i64,
    pub default_max_tokens: i64,
    pub window_seconds: i64,
    pub redis_prefix: String,
}

impl RateLimitConfig {
    pub fn normalize(&self) -> RateLimitSettings {
        let positive_or = |value: i64, fallback: u64| -> u64 {
            if value > 0 { value as u64 } else { fallback }
        };
        let prefix = self.redis_prefix.trim();
        RateLimitSettings {
            request_per_min: positive_or(self.request_per_min, 0),
            token_per_min: positive_or(self.token_per_min, 0),
            token_k: positive_or(self.token_k, DEFAULT_TOKEN_K),
            default_max_tokens: positive_or(self.default_max_tokens, DEFAULT_MAX_TOKENS),
            window_seconds: positive_or(self.window_seconds, DEFAULT_WINDOW_SECONDS),
            prefix: if prefix.is_empty() {
                DEFAULT_RATE_LIMIT_PREFIX.to_string()
            } else {
                prefix.to_string()
            },
        }
    }
}

/// Normalized rate-limit parameters. A limit of 0 disables that dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub request_per_min: u64,
    pub token_per_min: u64,
    pub token_k: u64,
    pub default_max_tokens: u64,
    pub window_seconds: u64,
    pub prefix: String,
}

impl RateLimitSettings {
    fn unloaded() -> Self {
        Self {
            request_per_min: 0,
            token_per_min: 0,
            token_k: 0,
            default_max_tokens: 0,
            window_seconds: 0,
            prefix: String::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.token_k > 0
            && self.default_max_tokens > 0
            && self.window_seconds > 0
            && !self.prefix.is_empty()
    }

    pub fn request_enabled(&self) -> bool {
        self.request_per_min > 0
    }

    pub fn token_enabled(&self) -> bool {
        self.token_per_min > 0
    }

    pub fn any_enabled(&self) -> bool {
        self.request_enabled() || self.token_enabled()
    }
}

pub trait RateLimitSource: Send + Sync {
    fn load(&self) -> Result<RateLimitConfig, ConfigError>;
}

#[derive(Clone, Debug, Default)]
pub struct StaticRateLimitSource(pub RateLimitConfig);

impl RateLimitSource for StaticRateLimitSource {
    fn load(&self) -> Result<RateLimitConfig, ConfigError> {
        Ok(self.0.clone())
    }
}

/// Re-reads the `rate_limit` section of a config file on every load.
#[derive(Clone, Debug)]
pub struct FileRateLimitSource {
    path: PathBuf,
}

impl FileRateLimitSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RateLimitSource for FileRateLimitSource {
    fn load(&self) -> Result<RateLimitConfig, ConfigError> {
        Ok(GatewayConfig::from_path(&self.path)?.rate_limit)
    }
}

/// Process-wide rate-limit settings. Readers load an `Arc` snapshot without
/// locking; an invalid snapshot is reloaded from the source and swapped in.
pub struct RateLimitConfigCache {
    current: ArcSwap<RateLimitSettings>,
    source: Arc<dyn RateLimitSource>,
}

impl RateLimitConfigCache {
    pub fn new(source: Arc<dyn RateLimitSource>) -> Self {
        Self {
            current: ArcSwap::from_pointee(RateLimitSettings::unloaded()),
            source,
        }
    }

    pub fn from_config(config: RateLimitConfig) -> Self {
        Self::new(Arc::new(StaticRateLimitSource(config)))
    }

    pub fn get(&self) -> Arc<RateLimitSettings> {
        let snapshot = self.current.load_full();
        if snapshot.is_valid() {
            return snapshot;
        }
        self.refresh()
    }

    pub fn refresh(&self) -> Arc<RateLimitSettings> {
        let raw = match self.source.load() {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "rate limit config reload failed; limits disabled");
                RateLimitConfig::default()
            }
        };
        self.replace(&raw)
    }

    pub fn replace(&self, raw: &RateLimitConfig) -> Arc<RateLimitSettings> {
        let settings = Arc::new(raw.normalize());
        self.current.store(Arc::clone(&settings));
        settings
    }
}

impl std::fmt::Debug for RateLimitConfigCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfigCache")
            .field("current", &*self.current.load())
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_HISTORY_MESSAGES,
        }
    }
}

impl HistoryConfig {
    pub fn effective_max_messages(&self) -> usize {
        match self.max_messages {
            0 => DEFAULT_HISTORY_MESSAGES,
            n => n.min(MAX_HISTORY_MESSAGES),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub default_message_page_size: u32,
    pub max_message_page_size: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            default_message_page_size: 50,
            max_message_page_size: 200,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub sqlite_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub redis_prefix: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatWsConfig {
    pub publish_key: String,
}

impl Default for ChatWsConfig {
    fn default() -> Self {
        Self {
            publish_key: "ditto:chat".to_string(),
        }
    }
}
