//! ReplyChain configuration loader.

use rc_llm::{ProviderConfig, ProviderRegistry};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyChainConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
    /// Completion backends in priority order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Where the gateway posts events to us.
    #[serde(default = "default_event_bind")]
    pub event_bind: String,
    /// Base URL of the gateway's HTTP action API.
    #[serde(default = "default_gateway_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            event_bind: default_event_bind(),
            endpoint: default_gateway_endpoint(),
            request_timeout_seconds: default_request_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_event_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_gateway_endpoint() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.replychain/context.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Provider calls allowed in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
    #[serde(default = "default_queue_buffer")]
    pub inbound_buffer: usize,
    #[serde(default = "default_queue_buffer")]
    pub outbound_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            acquire_timeout_seconds: default_acquire_timeout_seconds(),
            inbound_buffer: default_queue_buffer(),
            outbound_buffer: default_queue_buffer(),
        }
    }
}

fn default_max_concurrent() -> usize {
    5
}

fn default_acquire_timeout_seconds() -> u64 {
    10
}

fn default_queue_buffer() -> usize {
    256
}

impl DispatchConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptsConfig {
    /// JSON array of `{role, content}` prepended to private conversations.
    #[serde(default)]
    pub private: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Add a system line naming the asking user.
    #[serde(default)]
    pub include_nickname: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default = "default_whitelist_path")]
    pub path: String,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            path: default_whitelist_path(),
        }
    }
}

fn default_whitelist_path() -> String {
    "~/.replychain/whitelist.json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_viewer_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth_path: Option<String>,
    #[serde(default)]
    pub id_map_path: Option<String>,
    /// Mask the last four characters of ids in dialog labels.
    #[serde(default = "default_fuzz_ids")]
    pub fuzz_ids: bool,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_viewer_bind(),
            auth_path: None,
            id_map_path: None,
            fuzz_ids: default_fuzz_ids(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

fn default_viewer_bind() -> String {
    "127.0.0.1:6060".to_string()
}

fn default_fuzz_ids() -> bool {
    true
}

fn default_requests_per_second() -> u32 {
    20
}

impl ReplyChainConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let cfg = Self::from_toml(&contents, |key| std::env::var(key).ok())
            .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))?;
        Ok((cfg, path))
    }

    fn from_toml(
        contents: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut cfg: ReplyChainConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides(env);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("REPLYCHAIN_GATEWAY_ENDPOINT") {
            self.gateway.endpoint = v;
        }
        if let Some(v) = non_empty("REPLYCHAIN_DB_PATH") {
            self.storage.db_path = v;
        }
        if let Some(v) = non_empty("REPLYCHAIN_MAX_CONCURRENT") {
            match v.trim().parse() {
                Ok(n) => self.dispatch.max_concurrent = n,
                Err(e) => tracing::warn!(value = %v, %e, "ignoring invalid REPLYCHAIN_MAX_CONCURRENT"),
            }
        }
        // Bare host:port endpoints are taken as plain http.
        let endpoint = self.gateway.endpoint.trim();
        if !endpoint.contains("://") {
            self.gateway.endpoint = format!("http://{endpoint}");
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.event_bind_addr()?;
        if self.gateway.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "gateway.request_timeout_seconds must be > 0"
            ));
        }
        if self.gateway.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("gateway.http_max_in_flight must be > 0"));
        }
        if self.storage.db_path.trim().is_empty() {
            return Err(anyhow::anyhow!("storage.db_path is required"));
        }
        if self.dispatch.max_concurrent == 0 {
            return Err(anyhow::anyhow!("dispatch.max_concurrent must be > 0"));
        }
        if self.dispatch.acquire_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "dispatch.acquire_timeout_seconds must be > 0"
            ));
        }
        if self.dispatch.inbound_buffer == 0 || self.dispatch.outbound_buffer == 0 {
            return Err(anyhow::anyhow!("dispatch queue buffers must be > 0"));
        }
        if self.whitelist.path.trim().is_empty() {
            return Err(anyhow::anyhow!("whitelist.path is required"));
        }
        if self.viewer.enabled {
            self.viewer_bind_addr()?;
            if self.viewer.auth_path.as_deref().is_none_or(|p| p.trim().is_empty()) {
                return Err(anyhow::anyhow!(
                    "viewer.auth_path is required when viewer.enabled = true"
                ));
            }
            if self.viewer.requests_per_second == 0 {
                return Err(anyhow::anyhow!("viewer.requests_per_second must be > 0"));
            }
        }
        self.provider_registry()?;
        Ok(())
    }

    pub fn provider_registry(&self) -> anyhow::Result<ProviderRegistry> {
        ProviderRegistry::new(self.providers.clone())
            .map_err(|e| anyhow::anyhow!("providers: {e}"))
    }

    pub fn event_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.gateway
            .event_bind
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("gateway.event_bind {:?}: {e}", self.gateway.event_bind))
    }

    pub fn viewer_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.viewer
            .bind
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("viewer.bind {:?}: {e}", self.viewer.bind))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.request_timeout_seconds)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".replychain").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}
