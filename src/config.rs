use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Polling,
    Webhook,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Polling => write!(f, "polling"),
            TransportMode::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    #[serde(default)]
    pub review: ReviewConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Group accepted applicants are invited to
    pub group_id: i64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransportConfig {
    #[serde(default)]
    pub mode: TransportMode,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u32,
    #[serde(default = "default_poll_limit")]
    pub limit: u8,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_poll_timeout(),
            limit: default_poll_limit(),
        }
    }
}

/// Extra time the HTTP client allows on top of the long-poll wait.
const POLL_REQUEST_SLACK: Duration = Duration::from_secs(10);

impl PollingConfig {
    /// HTTP timeout for Bot API calls; outlasts a full long poll.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_secs)) + POLL_REQUEST_SLACK
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// HTTPS URL Telegram will POST to
    pub public_url: String,
    #[serde(default = "default_webhook_listen")]
    pub listen: String,
    #[serde(default = "default_webhook_path")]
    pub path: String,
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default = "default_webhook_queue")]
    pub queue_capacity: usize,
    #[serde(default = "default_webhook_batch")]
    pub batch_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_consecutive_failures: default_max_failures(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Cron expression (with seconds) for the idle-session sweep
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_cron: default_sweep_cron(),
            shutdown_grace_secs: default_grace(),
        }
    }
}

impl DispatcherConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReviewConfig {
    /// Seeded into the database at start; order sets the rotation
    #[serde(default)]
    pub reviewers: Vec<u64>,
}

fn default_poll_timeout() -> u32 {
    30
}

fn default_poll_limit() -> u8 {
    100
}

fn default_webhook_listen() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_webhook_path() -> String {
    "/telegram".to_string()
}

fn default_webhook_queue() -> usize {
    1024
}

fn default_webhook_batch() -> usize {
    100
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_max_failures() -> u32 {
    10
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_sweep_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_grace() -> u64 {
    10
}

fn default_db_path() -> PathBuf {
    PathBuf::from("reviewbot.db")
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        database_path: default_db_path(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token must not be empty");
        }
        if self.dispatcher.workers == 0 {
            anyhow::bail!("dispatcher.workers must be at least 1");
        }
        if self.dispatcher.queue_capacity == 0 {
            anyhow::bail!("dispatcher.queue_capacity must be at least 1");
        }
        if self.transport.retry.initial_backoff_ms > self.transport.retry.max_backoff_ms {
            anyhow::bail!("transport.retry.initial_backoff_ms exceeds max_backoff_ms");
        }
        if self.transport.mode == TransportMode::Webhook {
            let webhook = self
                .transport
                .webhook
                .as_ref()
                .context("transport.mode = \"webhook\" requires a [transport.webhook] section")?;
            if webhook.queue_capacity == 0 || webhook.batch_limit == 0 {
                anyhow::bail!("transport.webhook queue_capacity and batch_limit must be positive");
            }
            if !webhook.path.starts_with('/') {
                anyhow::bail!("transport.webhook.path must start with '/'");
            }
        }
        Ok(())
    }
}
