use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::schema::{Config, ModelEndpointConfig};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/docflow-config-v1.json");

pub const ENV_DATABASE_PATH: &str = "DOCFLOW_DATABASE_PATH";
pub const ENV_HTTP_ADDR: &str = "DOCFLOW_HTTP_ADDR";
pub const ENV_PAGE_WORKERS: &str = "DOCFLOW_PAGE_WORKERS";
pub const ENV_AGGREGATION_WORKERS: &str = "DOCFLOW_AGGREGATION_WORKERS";
pub const ENV_SWEEP_INTERVAL_MS: &str = "DOCFLOW_SWEEP_INTERVAL_MS";
pub const ENV_MODEL_ENDPOINT: &str = "DOCFLOW_MODEL_ENDPOINT";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads the file if one is given, otherwise starts from defaults, then
/// applies `DOCFLOW_*` environment overrides and re-validates.
pub fn load_config_with_env(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Applies overrides looked up through `var`. Empty values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, var: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    if let Some(path) = lookup(ENV_DATABASE_PATH) {
        config.database.path = Some(PathBuf::from(path));
    }
    if let Some(addr) = lookup(ENV_HTTP_ADDR) {
        config.server.http_addr = addr;
    }
    if let Some(value) = lookup(ENV_PAGE_WORKERS) {
        config.workers.page_workers = parse_env(ENV_PAGE_WORKERS, &value)?;
    }
    if let Some(value) = lookup(ENV_AGGREGATION_WORKERS) {
        config.workers.aggregation_workers = parse_env(ENV_AGGREGATION_WORKERS, &value)?;
    }
    if let Some(value) = lookup(ENV_SWEEP_INTERVAL_MS) {
        config.sweeper.interval_ms = parse_env(ENV_SWEEP_INTERVAL_MS, &value)?;
    }
    if let Some(url) = lookup(ENV_MODEL_ENDPOINT) {
        match config.model_endpoint.as_mut() {
            Some(endpoint) => endpoint.base_url = url,
            None => {
                config.model_endpoint = Some(ModelEndpointConfig {
                    base_url: url,
                    timeout_secs: 120,
                    api_key_env: None,
                })
            }
        }
    }

    Ok(())
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.workers.page_workers == 0 {
        return Err(ConfigError::Validation {
            message: "workers.page_workers must be at least 1".to_string(),
        });
    }
    if config.workers.aggregation_workers == 0 {
        return Err(ConfigError::Validation {
            message: "workers.aggregation_workers must be at least 1".to_string(),
        });
    }
    if config.sweeper.interval_ms == 0 {
        return Err(ConfigError::Validation {
            message: "sweeper.interval_ms must be positive".to_string(),
        });
    }

    if config.models.is_empty() {
        return Err(ConfigError::Validation {
            message: "at least one model must be configured".to_string(),
        });
    }

    if let Some(endpoint) = &config.model_endpoint {
        if !endpoint.base_url.starts_with("http://") && !endpoint.base_url.starts_with("https://")
        {
            return Err(ConfigError::Validation {
                message: format!(
                    "model_endpoint.base_url must be an http(s) URL: {}",
                    endpoint.base_url
                ),
            });
        }
    }

    Ok(())
}
