//! config.rs
//!
//! Environment-driven configuration. Required variables are validated up front
//! so a misconfigured deployment fails at startup with the full list of what is
//! missing, not on the first proxied request.

use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

use crate::model::DEFAULT_PAGE_SIZE;

const DEFAULT_BIND: &str = "0.0.0.0:8090";
const DEFAULT_PROVIDER: &str = "gdrive";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 30;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("{name} must be an http(s) URL, got '{value}'")]
    InvalidUrl { name: &'static str, value: String },

    #[error("{name} must be a positive integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
}

/// Credentials and endpoints of the external Indexing Service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub base_url: String,
    pub auth_url: String,
    pub anon_key: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    pub bind: String,
    pub provider: String,
    pub page_size: usize,
    pub embedding_model: String,
    pub poll: PollConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let required = [
            "INDEXING_API_BASE_URL",
            "INDEXING_AUTH_URL",
            "INDEXING_AUTH_ANON_KEY",
            "INDEXING_SERVICE_EMAIL",
            "INDEXING_SERVICE_PASSWORD",
        ];
        let missing: Vec<String> = required
            .iter()
            .filter(|&&k| get(k).is_none())
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let base_url = validate_url("INDEXING_API_BASE_URL", get("INDEXING_API_BASE_URL"))?;
        let auth_url = validate_url("INDEXING_AUTH_URL", get("INDEXING_AUTH_URL"))?;

        let page_size = parse_positive("KB_PICKER_PAGE_SIZE", get("KB_PICKER_PAGE_SIZE"))?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let interval_ms = parse_positive(
            "KB_PICKER_POLL_INTERVAL_MS",
            get("KB_PICKER_POLL_INTERVAL_MS"),
        )?
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let max_attempts = parse_positive(
            "KB_PICKER_POLL_MAX_ATTEMPTS",
            get("KB_PICKER_POLL_MAX_ATTEMPTS"),
        )?
        .map(|n| n as u32)
        .unwrap_or(DEFAULT_POLL_MAX_ATTEMPTS);

        Ok(Self {
            service: ServiceConfig {
                base_url,
                auth_url,
                anon_key: get("INDEXING_AUTH_ANON_KEY").unwrap_or_default(),
                email: get("INDEXING_SERVICE_EMAIL").unwrap_or_default(),
                password: get("INDEXING_SERVICE_PASSWORD").unwrap_or_default(),
            },
            bind: get("KB_PICKER_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            provider: get("KB_PICKER_PROVIDER").unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            page_size,
            embedding_model: get("KB_PICKER_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            poll: PollConfig {
                interval: Duration::from_millis(interval_ms),
                max_attempts,
            },
        })
    }
}

fn validate_url(name: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    let value = value.unwrap_or_default();
    match Url::parse(&value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            Ok(value.trim_end_matches('/').to_string())
        }
        _ => Err(ConfigError::InvalidUrl { name, value }),
    }
}

fn parse_positive(name: &'static str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
    match value {
        None => Ok(None),
        Some(v) => match v.parse::<u64>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(ConfigError::InvalidNumber { name, value: v }),
        },
    }
}
