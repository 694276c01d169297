use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::capability::ModelCatalog;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub models: ModelCatalog,
    #[serde(default)]
    pub model_endpoint: Option<ModelEndpointConfig>,
    #[serde(default)]
    pub ocr: OcrConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database: DatabaseConfig::default(),
            server: ServerConfig::default(),
            workers: WorkersConfig::default(),
            sweeper: SweeperConfig::default(),
            retry: RetryConfig::default(),
            models: ModelCatalog::default(),
            model_endpoint: None,
            ocr: OcrConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. Falls back to the platform data directory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// How long a write waits on a lock held by another connection before
    /// failing as busy (and being retried by the store policy).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

fn default_http_addr() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_page_workers")]
    pub page_workers: usize,
    #[serde(default = "default_aggregation_workers")]
    pub aggregation_workers: usize,
    /// How long a worker blocks on the broker before re-checking shutdown.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
}

fn default_page_workers() -> usize {
    num_cpus::get()
}

fn default_aggregation_workers() -> usize {
    2
}

fn default_receive_timeout_ms() -> u64 {
    100
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            page_workers: default_page_workers(),
            aggregation_workers: default_aggregation_workers(),
            receive_timeout_ms: default_receive_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub interval_ms: u64,
}

fn default_sweep_interval_ms() -> u64 {
    2_000
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Retry policies per failure domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Page analyzer and model invoker calls.
    #[serde(default)]
    pub capability: RetryPolicy,
    /// Final-result writes after a successful model call.
    #[serde(default = "default_store_retry")]
    pub store: RetryPolicy,
    /// Broker publishes.
    #[serde(default)]
    pub broker: RetryPolicy,
    /// Re-reading page results that are not all visible yet.
    #[serde(default = "default_page_read_retry")]
    pub page_read: RetryPolicy,
    /// Opening the database at startup.
    #[serde(default = "RetryPolicy::startup")]
    pub startup: RetryPolicy,
    /// Delay before a nacked delivery is handed back to the broker,
    /// keyed by delivery attempt. `max_attempts` is not used.
    #[serde(default = "default_redelivery_backoff")]
    pub redelivery: RetryPolicy,
}

fn default_store_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        initial_backoff_ms: 500,
        max_backoff_ms: 30_000,
        multiplier: 2.0,
    }
}

fn default_page_read_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_backoff_ms: 250,
        max_backoff_ms: 2_000,
        multiplier: 2.0,
    }
}

fn default_redelivery_backoff() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        initial_backoff_ms: 500,
        max_backoff_ms: 30_000,
        multiplier: 2.0,
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capability: RetryPolicy::default(),
            store: default_store_retry(),
            broker: RetryPolicy::default(),
            page_read: default_page_read_retry(),
            startup: RetryPolicy::startup(),
            redelivery: default_redelivery_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEndpointConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Name of the environment variable holding the bearer token, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            languages: default_languages(),
        }
    }
}
