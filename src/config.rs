//! Relay Configuration Module
//!
//! Configuration is read from an optional YAML or JSON file, then individual
//! values may be overridden from the environment:
//!
//! - CHATRELAY_BASE_URL              -> provider.base_url
//! - CHATRELAY_MODELS                -> models (comma separated)
//! - CHATRELAY_LEASE_TTL_SECONDS     -> lease.ttl
//! - CHATRELAY_MAX_RETRIES           -> session.max_retries
//! - CHATRELAY_RETRY_DELAY_MS        -> session.retry_delay
//! - CHATRELAY_UPLOAD_MAX_BYTES      -> upload.max_size
//! - CHATRELAY_UPLOAD_TIMEOUT_MS     -> upload.poll_timeout
//! - CHATRELAY_UPLOAD_FAILURE_STATUSES -> upload.failure_statuses (comma separated)

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderEndpoints {
    pub refresh: String,
    pub create_conversation: String,
    /// `{id}` is replaced with the conversation id.
    pub delete_conversation: String,
    pub send: String,
    pub upload: String,
    pub file_status: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            refresh: "/api/auth/token/refresh".to_string(),
            create_conversation: "/api/chat".to_string(),
            delete_conversation: "/api/chat/{id}".to_string(),
            send: "/api/chat/stream".to_string(),
            upload: "/api/file/upload".to_string(),
            file_status: "/api/file/status".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub endpoints: ProviderEndpoints,
    /// Title given to the ephemeral conversations the relay creates.
    pub conversation_name: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            endpoints: ProviderEndpoints::default(),
            conversation_name: "relay".to_string(),
        }
    }
}

impl ProviderConfig {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LeaseConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "ttl_seconds")]
    pub ttl: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: crate::lease::DEFAULT_LEASE_TTL,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    /// Ceiling on declared and downloaded file size, in bytes.
    pub max_size: u64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_timeout_ms")]
    pub poll_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "settle_delay_ms")]
    pub settle_delay: Duration,
    /// Provider status codes that mean the upload will never complete.
    pub failure_statuses: Vec<i64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_FILE_SIZE,
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_millis(500),
            failure_statuses: vec![12, 22, 59, 404],
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    /// Provider error-event codes that mean the lease was rejected.
    pub auth_failure_codes: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            auth_failure_codes: vec!["unauthenticated".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    pub provider: ProviderConfig,
    pub lease: LeaseConfig,
    pub upload: UploadConfig,
    pub session: SessionConfig,
    /// Model ids advertised on `/v1/models`.
    pub models: Vec<String>,
}

impl RelayConfig {
    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        if config.models.is_empty() {
            config.models.push("chatrelay".to_string());
        }
        Ok(config)
    }

    /// Load config from a YAML or JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: RelayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        tracing::info!("Loaded relay config from {}", path.display());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let parse_u64 = |key: &str| {
            get(key).and_then(|v| match v.parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!("Ignoring non-numeric {}={}", key, v);
                    None
                }
            })
        };

        if let Some(url) = get("CHATRELAY_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(models) = get("CHATRELAY_MODELS") {
            self.models = split_list(&models);
        }
        if let Some(secs) = parse_u64("CHATRELAY_LEASE_TTL_SECONDS") {
            self.lease.ttl = Duration::from_secs(secs);
        }
        if let Some(n) = parse_u64("CHATRELAY_MAX_RETRIES") {
            self.session.max_retries = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(ms) = parse_u64("CHATRELAY_RETRY_DELAY_MS") {
            self.session.retry_delay = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_u64("CHATRELAY_UPLOAD_MAX_BYTES") {
            self.upload.max_size = bytes;
        }
        if let Some(ms) = parse_u64("CHATRELAY_UPLOAD_TIMEOUT_MS") {
            self.upload.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(list) = get("CHATRELAY_UPLOAD_FAILURE_STATUSES") {
            self.upload.failure_statuses = split_list(&list)
                .iter()
                .filter_map(|s| s.parse::<i64>().ok())
                .collect();
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_provider_limits() {
        let config = RelayConfig::default();
        assert_eq!(config.lease.ttl, Duration::from_secs(900));
        assert_eq!(config.upload.max_size, 100 * 1024 * 1024);
        assert_eq!(config.upload.poll_timeout, Duration::from_secs(60));
        assert_eq!(config.upload.failure_statuses, vec![12, 22, 59, 404]);
        assert_eq!(config.session.max_retries, 3);
        assert_eq!(config.session.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn loads_partial_yaml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "provider:\n  base_url: https://provider.example\nsession:\n  max_retries: 1\n  retry_delay_ms: 250\nupload:\n  failure_statuses: [7]\nmodels: [relay-a, relay-b]"
        )
        .unwrap();

        let config = RelayConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.provider.base_url, "https://provider.example");
        assert_eq!(config.provider.endpoints, ProviderEndpoints::default());
        assert_eq!(config.session.max_retries, 1);
        assert_eq!(config.session.retry_delay, Duration::from_millis(250));
        assert_eq!(config.upload.failure_statuses, vec![7]);
        assert_eq!(config.upload.poll_timeout, Duration::from_secs(60));
        assert_eq!(config.models, vec!["relay-a", "relay-b"]);
    }

    #[test]
    fn loads_json_files_too() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"lease": {{"ttl_seconds": 60}}}}"#).unwrap();
        let config = RelayConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.lease.ttl, Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CHATRELAY_BASE_URL", " https://override.example "),
            ("CHATRELAY_MAX_RETRIES", "0"),
            ("CHATRELAY_RETRY_DELAY_MS", "10"),
            ("CHATRELAY_UPLOAD_FAILURE_STATUSES", "1, 2,x"),
            ("CHATRELAY_LEASE_TTL_SECONDS", "not-a-number"),
            ("CHATRELAY_MODELS", "m1,,m2"),
        ]);
        let mut config = RelayConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.provider.base_url, "https://override.example");
        assert_eq!(config.session.max_retries, 0);
        assert_eq!(config.session.retry_delay, Duration::from_millis(10));
        assert_eq!(config.upload.failure_statuses, vec![1, 2]);
        assert_eq!(config.lease.ttl, Duration::from_secs(900));
        assert_eq!(config.models, vec!["m1", "m2"]);
    }

    #[test]
    fn provider_url_joins_without_double_slash() {
        let provider = ProviderConfig {
            base_url: "https://p.example/".into(),
            ..Default::default()
        };
        assert_eq!(provider.url("/api/chat"), "https://p.example/api/chat");
    }
}
