use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::models::{Folder, Protocol};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Used for groups whose `sync_interval_minutes` is 0
    #[serde(default = "default_interval_minutes")]
    pub default_interval_minutes: u32,
    /// Used for groups whose `sync_batch_size` is 0
    #[serde(default = "default_batch_size")]
    pub default_batch_size: u32,
    /// Pause after each completed round; 0 disables the cooldown
    #[serde(default)]
    pub round_cooldown_minutes: u32,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
    #[serde(default = "default_max_error_len")]
    pub max_error_len: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_minutes: default_interval_minutes(),
            default_batch_size: default_batch_size(),
            round_cooldown_minutes: 0,
            log_capacity: default_log_capacity(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            max_error_len: default_max_error_len(),
        }
    }
}

/// Token endpoint and server for one IMAP generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImapEndpoint {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub token_url: String,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Used when an account carries no client id of its own
    #[serde(default)]
    pub default_client_id: Option<String>,
    #[serde(default = "default_graph_token_url")]
    pub graph_token_url: String,
    #[serde(default = "default_graph_scope")]
    pub graph_scope: String,
    #[serde(default = "default_graph_base")]
    pub graph_base: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default = "default_folders")]
    pub folders: Vec<Folder>,
    #[serde(default = "default_imap_workers")]
    pub imap_workers: usize,
    #[serde(default = "default_imap_new")]
    pub imap_new: ImapEndpoint,
    #[serde(default = "default_imap_old")]
    pub imap_old: ImapEndpoint,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_client_id: None,
            graph_token_url: default_graph_token_url(),
            graph_scope: default_graph_scope(),
            graph_base: default_graph_base(),
            request_timeout_secs: default_request_timeout_secs(),
            fetch_limit: default_fetch_limit(),
            folders: default_folders(),
            imap_workers: default_imap_workers(),
            imap_new: default_imap_new(),
            imap_old: default_imap_old(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Token endpoint and scope for a protocol's refresh-token exchange
    pub fn token_endpoint(&self, protocol: Protocol) -> (&str, &str) {
        match protocol {
            Protocol::Graph => (&self.graph_token_url, &self.graph_scope),
            Protocol::ImapNew => (&self.imap_new.token_url, &self.imap_new.scope),
            Protocol::ImapOld => (&self.imap_old.token_url, &self.imap_old.scope),
        }
    }

    /// IMAP server settings, `None` for non-IMAP protocols
    pub fn imap_endpoint(&self, protocol: Protocol) -> Option<&ImapEndpoint> {
        match protocol {
            Protocol::Graph => None,
            Protocol::ImapNew => Some(&self.imap_new),
            Protocol::ImapOld => Some(&self.imap_old),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_interval_minutes() -> u32 {
    4
}

fn default_batch_size() -> u32 {
    1
}

fn default_log_capacity() -> usize {
    200
}

fn default_token_refresh_margin_secs() -> u64 {
    300
}

fn default_max_error_len() -> usize {
    500
}

fn default_imap_port() -> u16 {
    993
}

fn default_requests_per_second() -> f64 {
    5.0
}

fn default_burst() -> f64 {
    10.0
}

fn default_graph_token_url() -> String {
    "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string()
}

fn default_graph_scope() -> String {
    "https://graph.microsoft.com/.default offline_access".to_string()
}

fn default_graph_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_imap_new() -> ImapEndpoint {
    ImapEndpoint {
        host: "outlook.live.com".to_string(),
        port: default_imap_port(),
        token_url: "https://login.microsoftonline.com/consumers/oauth2/v2.0/token".to_string(),
        scope: "https://outlook.office.com/IMAP.AccessAsUser.All offline_access".to_string(),
    }
}

fn default_imap_old() -> ImapEndpoint {
    ImapEndpoint {
        host: "outlook.office365.com".to_string(),
        port: default_imap_port(),
        token_url: "https://login.live.com/oauth20_token.srf".to_string(),
        scope: String::new(),
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_fetch_limit() -> usize {
    30
}

fn default_folders() -> Vec<Folder> {
    vec![Folder::Inbox]
}

fn default_imap_workers() -> usize {
    4
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".mailbox-sync/mailbox.db")
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| SyncError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.default_interval_minutes == 0 {
            return Err(SyncError::Config(
                "scheduler.default_interval_minutes must be at least 1".to_string(),
            ));
        }
        if scheduler.default_batch_size == 0 {
            return Err(SyncError::Config(
                "scheduler.default_batch_size must be at least 1".to_string(),
            ));
        }
        if scheduler.log_capacity == 0 {
            return Err(SyncError::Config(
                "scheduler.log_capacity must be greater than 0".to_string(),
            ));
        }
        if scheduler.max_error_len < 16 {
            return Err(SyncError::Config(
                "scheduler.max_error_len must be at least 16".to_string(),
            ));
        }

        let provider = &self.provider;
        for (name, url) in [
            ("provider.graph_token_url", &provider.graph_token_url),
            ("provider.graph_base", &provider.graph_base),
            ("provider.imap_new.token_url", &provider.imap_new.token_url),
            ("provider.imap_old.token_url", &provider.imap_old.token_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SyncError::Config(format!(
                    "{} must be an http(s) URL, got '{}'",
                    name, url
                )));
            }
        }
        for (name, endpoint) in [
            ("provider.imap_new", &provider.imap_new),
            ("provider.imap_old", &provider.imap_old),
        ] {
            if endpoint.host.trim().is_empty() {
                return Err(SyncError::Config(format!("{}.host cannot be empty", name)));
            }
            if endpoint.port == 0 {
                return Err(SyncError::Config(format!("{}.port cannot be 0", name)));
            }
        }
        if provider.request_timeout_secs == 0 {
            return Err(SyncError::Config(
                "provider.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        // Graph caps $top at 1000
        if provider.fetch_limit == 0 || provider.fetch_limit > 1000 {
            return Err(SyncError::Config(
                "provider.fetch_limit must be between 1 and 1000".to_string(),
            ));
        }
        if provider.folders.is_empty() {
            return Err(SyncError::Config(
                "provider.folders must name at least one folder".to_string(),
            ));
        }
        if provider.imap_workers == 0 {
            return Err(SyncError::Config(
                "provider.imap_workers must be at least 1".to_string(),
            ));
        }
        if provider.rate_limit.requests_per_second <= 0.0 {
            return Err(SyncError::Config(
                "provider.rate_limit.requests_per_second must be positive".to_string(),
            ));
        }
        if provider.rate_limit.burst < 2.0 {
            return Err(SyncError::Config(
                "provider.rate_limit.burst must be at least 2 (one IMAP session)".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
