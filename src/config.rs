use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Graph `$batch` rejects more than 20 sub-requests per call
pub const GRAPH_MAX_BATCH: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub unsubscribe: UnsubscribeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Conversation-style provider (Gmail REST API)
    Gmail,
    /// Graph-style provider (Microsoft Graph mail API)
    Graph,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Graph => "graph",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Overrides the provider's API root (used for tests and sovereign clouds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            account_id: default_account_id(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_gmail_chunk_size")]
    pub gmail_chunk_size: usize,
    #[serde(default = "default_graph_chunk_size")]
    pub graph_chunk_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            gmail_chunk_size: default_gmail_chunk_size(),
            graph_chunk_size: default_graph_chunk_size(),
            max_concurrency: default_max_concurrency(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
        }
    }
}

impl BatchConfig {
    pub fn chunk_size_for(&self, kind: ProviderKind) -> usize {
        match kind {
            ProviderKind::Gmail => self.gmail_chunk_size,
            ProviderKind::Graph => self.graph_chunk_size,
        }
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Page size for inbox listing; `None` uses the provider maximum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: None,
            store_path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeConfig {
    /// Perform the RFC 8058 one-click POST instead of handing the link back
    #[serde(default)]
    pub one_click_post: bool,
    #[serde(default = "default_unsubscribe_subject")]
    pub default_subject: String,
    #[serde(default = "default_unsubscribe_body")]
    pub default_body: String,
}

impl Default for UnsubscribeConfig {
    fn default() -> Self {
        Self {
            one_click_post: false,
            default_subject: default_unsubscribe_subject(),
            default_body: default_unsubscribe_body(),
        }
    }
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Gmail
}

fn default_account_id() -> String {
    "default".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    32_000
}

fn default_jitter_ratio() -> f64 {
    0.5
}

fn default_gmail_chunk_size() -> usize {
    50
}

fn default_graph_chunk_size() -> usize {
    GRAPH_MAX_BATCH
}

fn default_max_concurrency() -> usize {
    10
}

fn default_inter_batch_delay_ms() -> u64 {
    250
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".sender-sweep/store.json")
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_unsubscribe_subject() -> String {
    "Unsubscribe".to_string()
}

fn default_unsubscribe_body() -> String {
    "Please remove this address from your mailing list.".to_string()
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
            .map_err(|e| SyncError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_toml(&content)?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SyncError::ConfigError(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| SyncError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.provider.account_id.trim().is_empty() {
            return Err(SyncError::ConfigError(
                "provider.account_id must not be empty".to_string(),
            ));
        }

        if self.retry.initial_backoff_ms == 0 {
            return Err(SyncError::ConfigError(
                "retry.initial_backoff_ms must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(SyncError::ConfigError(format!(
                "retry.initial_backoff_ms ({}) cannot exceed retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(SyncError::ConfigError(format!(
                "retry.jitter_ratio must be between 0.0 and 1.0, got {}",
                self.retry.jitter_ratio
            )));
        }

        if self.batch.gmail_chunk_size == 0 || self.batch.graph_chunk_size == 0 {
            return Err(SyncError::ConfigError(
                "batch chunk sizes must be at least 1".to_string(),
            ));
        }
        if self.batch.graph_chunk_size > GRAPH_MAX_BATCH {
            return Err(SyncError::ConfigError(format!(
                "batch.graph_chunk_size cannot exceed {} (Graph $batch limit)",
                GRAPH_MAX_BATCH
            )));
        }
        if self.batch.max_concurrency == 0 {
            return Err(SyncError::ConfigError(
                "batch.max_concurrency must be at least 1".to_string(),
            ));
        }

        if let Some(page_size) = self.sync.page_size {
            if page_size == 0 {
                return Err(SyncError::ConfigError(
                    "sync.page_size must be at least 1".to_string(),
                ));
            }
        }

        if self.http.timeout_secs == 0 {
            return Err(SyncError::ConfigError(
                "http.timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Render an annotated example configuration
    pub fn example_toml() -> String {
        r#"# sender-sweep configuration

[provider]
# "gmail" or "graph"
kind = "gmail"
account_id = "me@example.com"

[retry]
max_retries = 3
initial_backoff_ms = 1000
max_backoff_ms = 32000
# Extra random delay, as a fraction of the computed backoff
jitter_ratio = 0.5

[batch]
gmail_chunk_size = 50
# Graph $batch accepts at most 20 sub-requests
graph_chunk_size = 20
max_concurrency = 10
inter_batch_delay_ms = 250

[sync]
store_path = ".sender-sweep/store.json"

[http]
timeout_secs = 60
connect_timeout_secs = 10

[unsubscribe]
one_click_post = false
default_subject = "Unsubscribe"
default_body = "Please remove this address from your mailing list."
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.batch.graph_chunk_size, 20);
        assert_eq!(config.provider.kind, ProviderKind::Gmail);
    }

    #[test]
    fn test_example_toml_parses() {
        let config = Config::from_toml(&Config::example_toml()).unwrap();
        assert_eq!(config.provider.account_id, "me@example.com");
        assert_eq!(config.batch.inter_batch_delay_ms, 250);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [provider]
            kind = "graph"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Graph);
        assert_eq!(config.retry.initial_backoff_ms, 1000);
        assert_eq!(config.batch.chunk_size_for(ProviderKind::Graph), 20);
        assert_eq!(config.batch.chunk_size_for(ProviderKind::Gmail), 50);
    }

    #[test]
    fn test_rejects_oversized_graph_chunk() {
        let result = Config::from_toml(
            r#"
            [batch]
            graph_chunk_size = 21
            "#,
        );
        assert!(matches!(result, Err(SyncError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let mut config = Config::default();
        config.retry.initial_backoff_ms = 5000;
        config.retry.max_backoff_ms = 1000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.jitter_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.batch.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.provider.kind = ProviderKind::Graph;
        config.provider.account_id = "someone@example.com".to_string();
        config.save(&path).await.unwrap();

        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.provider.kind, ProviderKind::Graph);
        assert_eq!(loaded.provider.account_id, "someone@example.com");
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.provider.account_id, "default");
    }
}
